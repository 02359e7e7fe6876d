use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use prost_reflect::DescriptorPool;
use tokio::runtime::Handle;
use tonic::transport::Channel;

use crate::client::{ClientHandle, ClientOptions};
use crate::connection::{dial, ChannelHandle, DialOptions};
use crate::event_loop::EventLoop;
use crate::options::{Core, CoreOptions};
use crate::reflection::ReflectionClient;
use crate::server::ServerBuilder;
use crate::status::RpcError;

/// Collaborators for [`RpcModule::new`]; all are required.
#[derive(Default)]
pub struct ModuleOptions {
    /// The default channel used by clients and reflection clients that do
    /// not override it.
    pub channel: Option<Channel>,
    /// Descriptor registry covering every service/message the scripts use.
    pub pool: Option<DescriptorPool>,
    /// The loop that owns the script runtime.
    pub event_loop: Option<Arc<dyn EventLoop>>,
    /// Worker runtime for blocking transport calls.
    pub runtime: Option<Handle>,
}

/// The script-global module object: everything scripts reach gRPC through.
///
/// One module serves exactly one runtime and one loop; the channel and pool
/// are shared read-only across its background workers.
pub struct RpcModule {
    core: Core,
    reflection_enabled: AtomicBool,
}

impl RpcModule {
    pub fn new(opts: ModuleOptions) -> Result<RpcModule, RpcError> {
        let core = CoreOptions {
            channel: opts.channel,
            pool: opts.pool,
            event_loop: opts.event_loop,
            runtime: opts.runtime,
        }
        .build()?;
        Ok(RpcModule {
            core,
            reflection_enabled: AtomicBool::new(false),
        })
    }

    /// Build a client for a service known to the pool. The returned handle
    /// has one callable per method, keyed by lowerCamelCase name.
    pub fn create_client(
        &self,
        service: &str,
        opts: ClientOptions,
    ) -> Result<ClientHandle, RpcError> {
        ClientHandle::new(&self.core, service, opts)
    }

    /// Builder for a server hosting services from the pool. Servers created
    /// after [`RpcModule::enable_reflection`] also host gRPC v1 reflection.
    pub fn create_server(&self) -> ServerBuilder {
        ServerBuilder::new(
            self.core.clone(),
            self.reflection_enabled.load(Ordering::SeqCst),
        )
    }

    /// Reflection client over the module's default channel.
    pub fn create_reflection_client(&self) -> ReflectionClient {
        ReflectionClient::new(self.core.clone(), self.core.channel.clone())
    }

    /// Reflection client over a specific channel.
    pub fn create_reflection_client_on(&self, channel: Channel) -> ReflectionClient {
        ReflectionClient::new(self.core.clone(), channel)
    }

    /// Turn on reflection hosting for subsequently created servers.
    /// Idempotent.
    pub fn enable_reflection(&self) {
        self.reflection_enabled.store(true, Ordering::SeqCst);
    }

    pub fn reflection_enabled(&self) -> bool {
        self.reflection_enabled.load(Ordering::SeqCst)
    }

    /// Open a channel handle to `host:port`. Lazy; see [`dial`]. The channel
    /// plumbing lives on the worker runtime, so the call is safe from the
    /// loop thread.
    pub fn dial(&self, target: &str, opts: &DialOptions) -> Result<ChannelHandle, RpcError> {
        let _runtime = self.core.runtime.enter();
        dial(target, opts)
    }
}

/// Compile `.proto` sources into a descriptor pool, for embedders that load
/// schemas from files instead of a protoset.
pub fn compile_proto_files(
    files: &[impl AsRef<Path>],
    includes: &[impl AsRef<Path>],
) -> Result<DescriptorPool, RpcError> {
    let fds = protox::compile(files, includes)
        .map_err(|e| RpcError::invalid_argument(format!("proto compilation failed: {e}")))?;
    DescriptorPool::from_file_descriptor_set(fds)
        .map_err(|e| RpcError::internal(format!("descriptor pool: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::ScriptLoop;
    use std::io::Write;

    fn module(looper: &ScriptLoop) -> RpcModule {
        let fds = prost_types::FileDescriptorSet {
            file: vec![prost_types::FileDescriptorProto {
                name: Some("module_test.proto".into()),
                package: Some("modtest".into()),
                message_type: vec![prost_types::DescriptorProto {
                    name: Some("Ping".into()),
                    ..Default::default()
                }],
                service: vec![prost_types::ServiceDescriptorProto {
                    name: Some("Pinger".into()),
                    method: vec![prost_types::MethodDescriptorProto {
                        name: Some("Ping".into()),
                        input_type: Some(".modtest.Ping".into()),
                        output_type: Some(".modtest.Ping".into()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                syntax: Some("proto3".into()),
                ..Default::default()
            }],
        };
        RpcModule::new(ModuleOptions {
            channel: Some(Channel::from_static("http://127.0.0.1:1").connect_lazy()),
            pool: Some(DescriptorPool::from_file_descriptor_set(fds).unwrap()),
            event_loop: Some(Arc::new(looper.handle())),
            runtime: Some(Handle::current()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn create_client_resolves_methods() {
        let looper = ScriptLoop::start().unwrap();
        let module = module(&looper);
        let client = module
            .create_client("modtest.Pinger", ClientOptions::default())
            .unwrap();
        assert_eq!(client.method_names(), vec!["ping"]);
        assert!(client.method("ping").is_ok());
        assert!(client.method("pong").is_err());
        looper.shutdown();
    }

    #[tokio::test]
    async fn create_client_unknown_service_fails() {
        let looper = ScriptLoop::start().unwrap();
        let module = module(&looper);
        let err = module
            .create_client("modtest.Missing", ClientOptions::default())
            .unwrap_err();
        assert_eq!(err.code, crate::status::code::NOT_FOUND);
        looper.shutdown();
    }

    #[tokio::test]
    async fn enable_reflection_is_idempotent() {
        let looper = ScriptLoop::start().unwrap();
        let module = module(&looper);
        assert!(!module.reflection_enabled());
        module.enable_reflection();
        module.enable_reflection();
        assert!(module.reflection_enabled());
        looper.shutdown();
    }

    #[test]
    fn compile_proto_files_builds_a_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.proto");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "syntax = \"proto3\";\npackage hello;\nmessage Hi {{ string name = 1; }}"
        )
        .unwrap();
        let pool = compile_proto_files(&[&path], &[dir.path()]).unwrap();
        assert!(pool.get_message_by_name("hello.Hi").is_some());
    }
}
