use std::collections::HashSet;

use prost::Message;
use prost_reflect::{DescriptorPool, Kind, MessageDescriptor, ServiceDescriptor};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic_reflection::pb::v1;
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tracing::debug;

use crate::options::Core;
use crate::promise::Promise;
use crate::status::RpcError;

/// Script-facing reflection client. Every top-level operation opens a fresh
/// bidi stream to the gRPC v1 reflection service and drives it to
/// completion.
pub struct ReflectionClient {
    core: Core,
    channel: Channel,
}

impl ReflectionClient {
    pub(crate) fn new(core: Core, channel: Channel) -> ReflectionClient {
        ReflectionClient { core, channel }
    }

    /// Names of all services the server exposes.
    pub fn list_services(&self) -> Promise<Vec<String>> {
        self.run(|channel| async move {
            let mut stream = ReflectionStream::open(&channel).await?;
            let resp = stream
                .request(MessageRequest::ListServices(String::new()))
                .await?
                .ok_or_else(|| RpcError::unavailable("empty reflection response stream"))?;
            match resp {
                MessageResponse::ListServicesResponse(list) => {
                    Ok(list.service.into_iter().map(|s| s.name).collect())
                }
                other => Err(unexpected_response(&other)),
            }
        })
    }

    /// Resolve a service by name, including everything its file imports.
    pub fn describe_service(&self, name: &str) -> Promise<ServiceDescription> {
        let name = name.to_string();
        self.run(|channel| async move {
            let mut stream = ReflectionStream::open(&channel).await?;
            let pool = resolve_symbol_pool(&mut stream, &name).await?;
            let svc = pool.get_service_by_name(&name).ok_or_else(|| {
                if pool.get_message_by_name(&name).is_some() {
                    RpcError::invalid_argument(format!("{name} is not a service"))
                } else {
                    RpcError::not_found(format!("symbol {name} not found"))
                }
            })?;
            Ok(project_service(&svc))
        })
    }

    /// Resolve a message type by name.
    pub fn describe_type(&self, name: &str) -> Promise<TypeDescription> {
        let name = name.to_string();
        self.run(|channel| async move {
            let mut stream = ReflectionStream::open(&channel).await?;
            let pool = resolve_symbol_pool(&mut stream, &name).await?;
            let desc = pool.get_message_by_name(&name).ok_or_else(|| {
                if pool.get_service_by_name(&name).is_some() {
                    RpcError::invalid_argument(format!("{name} is not a message type"))
                } else {
                    RpcError::not_found(format!("symbol {name} not found"))
                }
            })?;
            Ok(project_type(&desc))
        })
    }

    fn run<T, F, Fut>(&self, op: F) -> Promise<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Channel) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, RpcError>> + Send + 'static,
    {
        let (promise, completer) = Promise::new();
        let core = self.core.clone();
        let channel = self.channel.clone();
        self.core.runtime.spawn(async move {
            let result = op(channel).await;
            let c2 = completer.clone();
            core.submit_or_else(Box::new(move || c2.settle(result)), || {
                completer.reject(RpcError::loop_closed());
            });
        });
        promise
    }
}

// -- Stream driving ------------------------------------------------------------

/// The request/response transport of one reflection stream. Abstracted so
/// the transitive-dependency loop can be exercised without a server.
trait ReflectTransport {
    async fn request(
        &mut self,
        req: MessageRequest,
    ) -> Result<Option<MessageResponse>, RpcError>;
}

struct ReflectionStream {
    tx: mpsc::Sender<v1::ServerReflectionRequest>,
    rx: tonic::Streaming<v1::ServerReflectionResponse>,
}

impl ReflectionStream {
    async fn open(channel: &Channel) -> Result<ReflectionStream, RpcError> {
        let (tx, rx) = mpsc::channel(8);
        let mut client = ServerReflectionClient::new(channel.clone());
        let response = client
            .server_reflection_info(tonic::Request::new(ReceiverStream::new(rx)))
            .await
            .map_err(|status| RpcError::from_status(&status, None))?;
        Ok(ReflectionStream {
            tx,
            rx: response.into_inner(),
        })
    }
}

impl ReflectTransport for ReflectionStream {
    async fn request(
        &mut self,
        req: MessageRequest,
    ) -> Result<Option<MessageResponse>, RpcError> {
        self.tx
            .send(v1::ServerReflectionRequest {
                host: String::new(),
                message_request: Some(req),
            })
            .await
            .map_err(|_| RpcError::unavailable("reflection stream closed"))?;
        match self.rx.message().await {
            Ok(Some(resp)) => Ok(resp.message_response),
            Ok(None) => Ok(None),
            Err(status) => Err(RpcError::from_status(&status, None)),
        }
    }
}

fn unexpected_response(resp: &MessageResponse) -> RpcError {
    if let MessageResponse::ErrorResponse(err) = resp {
        return RpcError::new(err.error_code, err.error_message.clone());
    }
    RpcError::internal("unexpected response type")
}

/// Fetch the file containing `symbol` plus the transitive closure of its
/// dependencies, then assemble a descriptor pool.
async fn resolve_symbol_pool<T: ReflectTransport>(
    stream: &mut T,
    symbol: &str,
) -> Result<DescriptorPool, RpcError> {
    let files = resolve_symbol_files(stream, symbol).await?;
    let fds = prost_types::FileDescriptorSet { file: files };
    DescriptorPool::from_file_descriptor_set(fds)
        .map_err(|e| RpcError::internal(format!("incomplete descriptor set: {e}")))
}

async fn resolve_symbol_files<T: ReflectTransport>(
    stream: &mut T,
    symbol: &str,
) -> Result<Vec<prost_types::FileDescriptorProto>, RpcError> {
    let mut files = Vec::new();
    let mut resolved = HashSet::new();

    // Initial fetch: the file (or files) declaring the symbol.
    let resp = stream
        .request(MessageRequest::FileContainingSymbol(symbol.to_string()))
        .await?
        .ok_or_else(|| RpcError::unavailable("empty reflection response stream"))?;
    match resp {
        MessageResponse::FileDescriptorResponse(fdr) => {
            merge_files(&mut files, &mut resolved, &fdr.file_descriptor_proto)?;
        }
        other => return Err(unexpected_response(&other)),
    }

    // Transitive-dependency loop: fetch one missing dependency at a time.
    // Servers may return more files than asked for; all of them are merged
    // and marked resolved.
    while let Some(dep) = next_missing_dependency(&files, &resolved) {
        match stream
            .request(MessageRequest::FileByFilename(dep.clone()))
            .await?
        {
            Some(MessageResponse::FileDescriptorResponse(fdr)) => {
                merge_files(&mut files, &mut resolved, &fdr.file_descriptor_proto)?;
                resolved.insert(dep);
            }
            Some(MessageResponse::ErrorResponse(err)) => {
                // Lenient recovery: the set may still typecheck without it.
                debug!(
                    %dep,
                    code = err.error_code,
                    message = %err.error_message,
                    "reflection dependency unresolved"
                );
                resolved.insert(dep);
            }
            Some(other) => return Err(unexpected_response(&other)),
            // EOF mid-loop terminates; the pool build decides the outcome.
            None => break,
        }
    }

    Ok(files)
}

fn merge_files(
    files: &mut Vec<prost_types::FileDescriptorProto>,
    resolved: &mut HashSet<String>,
    serialized: &[Vec<u8>],
) -> Result<(), RpcError> {
    for bytes in serialized {
        let fdp = prost_types::FileDescriptorProto::decode(bytes.as_slice())
            .map_err(|e| RpcError::internal(format!("failed to decode file descriptor: {e}")))?;
        let name = fdp.name.clone().unwrap_or_default();
        if resolved.insert(name) {
            files.push(fdp);
        }
    }
    Ok(())
}

/// First dependency named by any resolved file that is not itself resolved.
fn next_missing_dependency(
    files: &[prost_types::FileDescriptorProto],
    resolved: &HashSet<String>,
) -> Option<String> {
    files
        .iter()
        .flat_map(|f| f.dependency.iter())
        .find(|dep| !resolved.contains(dep.as_str()))
        .cloned()
}

// -- Projection ----------------------------------------------------------------

/// Script-friendly service projection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceDescription {
    pub name: String,
    pub methods: Vec<MethodDescription>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MethodDescription {
    pub name: String,
    pub full_method: String,
    pub input_type: String,
    pub output_type: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

/// Script-friendly message-type projection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TypeDescription {
    pub name: String,
    pub fields: Vec<FieldDescription>,
    pub oneofs: Vec<OneofDescription>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldDescription {
    pub name: String,
    pub number: u32,
    pub kind: String,
    pub repeated: bool,
    pub map: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<EnumValueDescription>,
    /// Populated only when the source sets an explicit default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oneof: Option<String>,
}

impl ServiceDescription {
    /// The dict form handed to scripts.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl TypeDescription {
    /// The dict form handed to scripts.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OneofDescription {
    pub name: String,
    pub fields: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnumValueDescription {
    pub name: String,
    pub number: i32,
}

pub(crate) fn project_service(svc: &ServiceDescriptor) -> ServiceDescription {
    ServiceDescription {
        name: svc.full_name().to_string(),
        methods: svc
            .methods()
            .map(|m| MethodDescription {
                name: m.name().to_string(),
                full_method: format!("/{}/{}", svc.full_name(), m.name()),
                input_type: m.input().full_name().to_string(),
                output_type: m.output().full_name().to_string(),
                client_streaming: m.is_client_streaming(),
                server_streaming: m.is_server_streaming(),
            })
            .collect(),
    }
}

pub(crate) fn project_type(desc: &MessageDescriptor) -> TypeDescription {
    let fields = desc
        .fields()
        .map(|f| {
            let (kind, message_type, enum_type, enum_values) = match f.kind() {
                Kind::Message(m) => ("message", Some(m.full_name().to_string()), None, Vec::new()),
                Kind::Enum(e) => (
                    "enum",
                    None,
                    Some(e.full_name().to_string()),
                    e.values()
                        .map(|v| EnumValueDescription {
                            name: v.name().to_string(),
                            number: v.number(),
                        })
                        .collect(),
                ),
                other => (scalar_kind_name(&other), None, None, Vec::new()),
            };
            FieldDescription {
                name: f.name().to_string(),
                number: f.number(),
                kind: kind.to_string(),
                repeated: f.is_list(),
                map: f.is_map(),
                message_type,
                enum_type,
                enum_values,
                default_value: f.field_descriptor_proto().default_value.clone(),
                oneof: f.containing_oneof().map(|o| o.name().to_string()),
            }
        })
        .collect();

    let oneofs = desc
        .oneofs()
        .map(|o| OneofDescription {
            name: o.name().to_string(),
            fields: o.fields().map(|f| f.name().to_string()).collect(),
        })
        .collect();

    TypeDescription {
        name: desc.full_name().to_string(),
        fields,
        oneofs,
    }
}

fn scalar_kind_name(kind: &Kind) -> &'static str {
    match kind {
        Kind::Double => "double",
        Kind::Float => "float",
        Kind::Int32 => "int32",
        Kind::Int64 => "int64",
        Kind::Uint32 => "uint32",
        Kind::Uint64 => "uint64",
        Kind::Sint32 => "sint32",
        Kind::Sint64 => "sint64",
        Kind::Fixed32 => "fixed32",
        Kind::Fixed64 => "fixed64",
        Kind::Sfixed32 => "sfixed32",
        Kind::Sfixed64 => "sfixed64",
        Kind::Bool => "bool",
        Kind::String => "string",
        Kind::Bytes => "bytes",
        Kind::Message(_) | Kind::Enum(_) => "message",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(
        name: &str,
        package: &str,
        deps: &[&str],
        message: Option<&str>,
    ) -> prost_types::FileDescriptorProto {
        prost_types::FileDescriptorProto {
            name: Some(name.into()),
            package: Some(package.into()),
            dependency: deps.iter().map(|d| d.to_string()).collect(),
            message_type: message
                .map(|m| {
                    vec![prost_types::DescriptorProto {
                        name: Some(m.into()),
                        ..Default::default()
                    }]
                })
                .unwrap_or_default(),
            syntax: Some("proto3".into()),
            ..Default::default()
        }
    }

    fn encode(fdp: &prost_types::FileDescriptorProto) -> Vec<u8> {
        fdp.encode_to_vec()
    }

    /// Scripted fake transport: serves FileContainingSymbol and
    /// FileByFilename from a canned map, with optional error and EOF
    /// behaviors.
    struct FakeTransport {
        symbol_files: Vec<Vec<u8>>,
        by_name: std::collections::HashMap<String, Vec<Vec<u8>>>,
        error_deps: HashSet<String>,
        eof_deps: HashSet<String>,
        requests: Vec<String>,
    }

    impl ReflectTransport for FakeTransport {
        async fn request(
            &mut self,
            req: MessageRequest,
        ) -> Result<Option<MessageResponse>, RpcError> {
            match req {
                MessageRequest::FileContainingSymbol(symbol) => {
                    self.requests.push(format!("symbol:{symbol}"));
                    Ok(Some(MessageResponse::FileDescriptorResponse(
                        v1::FileDescriptorResponse {
                            file_descriptor_proto: self.symbol_files.clone(),
                        },
                    )))
                }
                MessageRequest::FileByFilename(name) => {
                    self.requests.push(format!("file:{name}"));
                    if self.eof_deps.contains(&name) {
                        return Ok(None);
                    }
                    if self.error_deps.contains(&name) {
                        return Ok(Some(MessageResponse::ErrorResponse(v1::ErrorResponse {
                            error_code: crate::status::code::NOT_FOUND,
                            error_message: format!("{name} not found"),
                        })));
                    }
                    match self.by_name.get(&name) {
                        Some(files) => Ok(Some(MessageResponse::FileDescriptorResponse(
                            v1::FileDescriptorResponse {
                                file_descriptor_proto: files.clone(),
                            },
                        ))),
                        None => Ok(Some(MessageResponse::ErrorResponse(v1::ErrorResponse {
                            error_code: crate::status::code::NOT_FOUND,
                            error_message: format!("{name} unknown"),
                        }))),
                    }
                }
                _ => Err(RpcError::internal("unexpected request in test")),
            }
        }
    }

    #[tokio::test]
    async fn transitive_dependencies_resolve_one_at_a_time() {
        let a = file("a.proto", "pkg", &["b.proto"], Some("MsgInA"));
        let b = file("b.proto", "pkg", &["c.proto"], Some("MsgInB"));
        let c = file("c.proto", "pkg", &[], Some("MsgInC"));
        let mut transport = FakeTransport {
            symbol_files: vec![encode(&a)],
            by_name: [
                ("b.proto".to_string(), vec![encode(&b)]),
                ("c.proto".to_string(), vec![encode(&c)]),
            ]
            .into_iter()
            .collect(),
            error_deps: HashSet::new(),
            eof_deps: HashSet::new(),
            requests: Vec::new(),
        };
        let pool = resolve_symbol_pool(&mut transport, "pkg.MsgInA")
            .await
            .unwrap();
        assert!(pool.get_message_by_name("pkg.MsgInA").is_some());
        assert!(pool.get_message_by_name("pkg.MsgInB").is_some());
        assert!(pool.get_message_by_name("pkg.MsgInC").is_some());
        assert_eq!(
            transport.requests,
            vec!["symbol:pkg.MsgInA", "file:b.proto", "file:c.proto"]
        );
    }

    #[tokio::test]
    async fn extra_unrequested_files_are_merged() {
        let a = file("a.proto", "pkg", &["b.proto"], Some("MsgInA"));
        let b = file("b.proto", "pkg", &["c.proto"], Some("MsgInB"));
        let c = file("c.proto", "pkg", &[], Some("MsgInC"));
        // Asking for b returns b and c together; no request for c follows.
        let mut transport = FakeTransport {
            symbol_files: vec![encode(&a)],
            by_name: [("b.proto".to_string(), vec![encode(&b), encode(&c)])]
                .into_iter()
                .collect(),
            error_deps: HashSet::new(),
            eof_deps: HashSet::new(),
            requests: Vec::new(),
        };
        let pool = resolve_symbol_pool(&mut transport, "pkg.MsgInA")
            .await
            .unwrap();
        assert!(pool.get_message_by_name("pkg.MsgInC").is_some());
        assert_eq!(
            transport.requests,
            vec!["symbol:pkg.MsgInA", "file:b.proto"]
        );
    }

    #[tokio::test]
    async fn dependency_errors_are_lenient_but_pool_build_decides() {
        let a = file("a.proto", "pkg", &["b.proto"], Some("MsgInA"));
        let mut transport = FakeTransport {
            symbol_files: vec![encode(&a)],
            by_name: Default::default(),
            error_deps: ["b.proto".to_string()].into_iter().collect(),
            eof_deps: HashSet::new(),
            requests: Vec::new(),
        };
        // The loop terminates despite the error; the missing import makes
        // the final pool build fail.
        let err = resolve_symbol_pool(&mut transport, "pkg.MsgInA")
            .await
            .unwrap_err();
        assert!(err.message.contains("incomplete descriptor set"));
    }

    #[tokio::test]
    async fn eof_mid_loop_terminates() {
        let a = file("a.proto", "pkg", &["b.proto"], Some("MsgInA"));
        let mut transport = FakeTransport {
            symbol_files: vec![encode(&a)],
            by_name: Default::default(),
            error_deps: HashSet::new(),
            eof_deps: ["b.proto".to_string()].into_iter().collect(),
            requests: Vec::new(),
        };
        let result = resolve_symbol_pool(&mut transport, "pkg.MsgInA").await;
        assert!(result.is_err());
        assert_eq!(
            transport.requests,
            vec!["symbol:pkg.MsgInA", "file:b.proto"]
        );
    }

    #[tokio::test]
    async fn self_contained_file_needs_no_dependency_requests() {
        let a = file("a.proto", "pkg", &[], Some("MsgInA"));
        let mut transport = FakeTransport {
            symbol_files: vec![encode(&a)],
            by_name: Default::default(),
            error_deps: HashSet::new(),
            eof_deps: HashSet::new(),
            requests: Vec::new(),
        };
        let pool = resolve_symbol_pool(&mut transport, "pkg.MsgInA")
            .await
            .unwrap();
        assert!(pool.get_message_by_name("pkg.MsgInA").is_some());
        assert_eq!(transport.requests, vec!["symbol:pkg.MsgInA"]);
    }

    #[test]
    fn projection_covers_fields_oneofs_and_enums() {
        let fds = prost_types::FileDescriptorSet {
            file: vec![prost_types::FileDescriptorProto {
                name: Some("proj.proto".into()),
                package: Some("proj".into()),
                enum_type: vec![prost_types::EnumDescriptorProto {
                    name: Some("Mode".into()),
                    value: vec![
                        prost_types::EnumValueDescriptorProto {
                            name: Some("MODE_OFF".into()),
                            number: Some(0),
                            ..Default::default()
                        },
                        prost_types::EnumValueDescriptorProto {
                            name: Some("MODE_ON".into()),
                            number: Some(1),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                message_type: vec![
                    prost_types::DescriptorProto {
                        name: Some("Inner".into()),
                        ..Default::default()
                    },
                    prost_types::DescriptorProto {
                        name: Some("Outer".into()),
                        field: vec![
                            prost_types::FieldDescriptorProto {
                                name: Some("label".into()),
                                number: Some(1),
                                r#type: Some(9), // TYPE_STRING
                                label: Some(1),
                                ..Default::default()
                            },
                            prost_types::FieldDescriptorProto {
                                name: Some("inner".into()),
                                number: Some(2),
                                r#type: Some(11), // TYPE_MESSAGE
                                type_name: Some(".proj.Inner".into()),
                                label: Some(1),
                                ..Default::default()
                            },
                            prost_types::FieldDescriptorProto {
                                name: Some("mode".into()),
                                number: Some(3),
                                r#type: Some(14), // TYPE_ENUM
                                type_name: Some(".proj.Mode".into()),
                                label: Some(1),
                                ..Default::default()
                            },
                            prost_types::FieldDescriptorProto {
                                name: Some("choice_a".into()),
                                number: Some(4),
                                r#type: Some(9),
                                label: Some(1),
                                oneof_index: Some(0),
                                ..Default::default()
                            },
                        ],
                        oneof_decl: vec![prost_types::OneofDescriptorProto {
                            name: Some("choice".into()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                ],
                syntax: Some("proto3".into()),
                ..Default::default()
            }],
        };
        let pool = DescriptorPool::from_file_descriptor_set(fds).unwrap();
        let desc = pool.get_message_by_name("proj.Outer").unwrap();
        let projected = project_type(&desc);

        assert_eq!(projected.name, "proj.Outer");
        let inner = projected.fields.iter().find(|f| f.name == "inner").unwrap();
        assert_eq!(inner.kind, "message");
        assert_eq!(inner.message_type.as_deref(), Some("proj.Inner"));

        let mode = projected.fields.iter().find(|f| f.name == "mode").unwrap();
        assert_eq!(mode.kind, "enum");
        assert_eq!(mode.enum_type.as_deref(), Some("proj.Mode"));
        assert_eq!(mode.enum_values.len(), 2);
        assert_eq!(mode.enum_values[1].name, "MODE_ON");

        let choice = projected
            .fields
            .iter()
            .find(|f| f.name == "choice_a")
            .unwrap();
        assert_eq!(choice.oneof.as_deref(), Some("choice"));
        assert_eq!(projected.oneofs.len(), 1);
        assert_eq!(projected.oneofs[0].fields, vec!["choice_a"]);

        let json = projected.to_json();
        assert_eq!(json["name"], "proj.Outer");
        assert_eq!(json["fields"][1]["message_type"], "proj.Inner");
        // Absent optional attributes are omitted from the dict entirely.
        assert!(json["fields"][0].get("oneof").is_none());
    }

    #[test]
    fn projection_covers_service_methods() {
        let fds = prost_types::FileDescriptorSet {
            file: vec![prost_types::FileDescriptorProto {
                name: Some("svc.proto".into()),
                package: Some("svc".into()),
                message_type: vec![prost_types::DescriptorProto {
                    name: Some("Note".into()),
                    ..Default::default()
                }],
                service: vec![prost_types::ServiceDescriptorProto {
                    name: Some("Notes".into()),
                    method: vec![prost_types::MethodDescriptorProto {
                        name: Some("Watch".into()),
                        input_type: Some(".svc.Note".into()),
                        output_type: Some(".svc.Note".into()),
                        server_streaming: Some(true),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                syntax: Some("proto3".into()),
                ..Default::default()
            }],
        };
        let pool = DescriptorPool::from_file_descriptor_set(fds).unwrap();
        let svc = pool.get_service_by_name("svc.Notes").unwrap();
        let projected = project_service(&svc);
        assert_eq!(projected.name, "svc.Notes");
        assert_eq!(projected.methods.len(), 1);
        let method = &projected.methods[0];
        assert_eq!(method.full_method, "/svc.Notes/Watch");
        assert!(method.server_streaming);
        assert!(!method.client_streaming);
    }
}
