use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use http::uri::PathAndQuery;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tonic::client::Grpc;
use tonic::codec::CompressionEncoding;
use tonic::transport::Channel;
use tonic::{Status, Streaming};
use tracing::debug;

use crate::call_options::{CallContext, CallOptions, MetadataCallback};
use crate::codec::DynamicCodec;
use crate::message::MessageValue;
use crate::metadata::Metadata;
use crate::options::Core;
use crate::promise::{Completer, OnceGuard, Promise};
use crate::status::RpcError;

/// Streaming sends are serialized through a bounded queue drained by one
/// sender; this is its capacity.
const SEND_QUEUE_CAPACITY: usize = 64;

/// One `recv()` result: a message, or the end-of-stream marker.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamItem {
    pub value: Option<MessageValue>,
    pub done: bool,
}

impl StreamItem {
    fn message(value: MessageValue) -> StreamItem {
        StreamItem {
            value: Some(value),
            done: false,
        }
    }

    fn finished() -> StreamItem {
        StreamItem {
            value: None,
            done: true,
        }
    }
}

/// The four gRPC call shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodShape {
    Unary,
    ServerStream,
    ClientStream,
    Bidi,
}

impl MethodShape {
    pub fn of(desc: &MethodDescriptor) -> MethodShape {
        match (desc.is_client_streaming(), desc.is_server_streaming()) {
            (false, false) => MethodShape::Unary,
            (false, true) => MethodShape::ServerStream,
            (true, false) => MethodShape::ClientStream,
            (true, true) => MethodShape::Bidi,
        }
    }
}

impl fmt::Display for MethodShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MethodShape::Unary => "unary",
            MethodShape::ServerStream => "server-streaming",
            MethodShape::ClientStream => "client-streaming",
            MethodShape::Bidi => "bidi-streaming",
        };
        write!(f, "{label}")
    }
}

/// The request bundle handed through a unary interceptor chain.
pub struct UnaryPayload {
    /// Full method path, `/package.Service/Method`.
    pub method: String,
    pub message: MessageValue,
    /// Mutable header view seeded from the call's outgoing metadata; the
    /// state after the chain becomes the outgoing metadata.
    pub header: Metadata,
}

/// The `next` function of a unary interceptor chain.
pub type UnaryInvoker =
    Arc<dyn Fn(UnaryPayload) -> Result<Promise<MessageValue>, RpcError> + Send + Sync>;

/// An interceptor factory: receives `next`, returns the wrapping invoker.
/// Factories run once per call; chains fold right-to-left so the first
/// listed interceptor is the outermost.
pub type UnaryInterceptor =
    Arc<dyn Fn(UnaryInvoker) -> Result<UnaryInvoker, RpcError> + Send + Sync>;

/// Options for building a client.
#[derive(Default)]
pub struct ClientOptions {
    /// Channel override; the module's default channel otherwise.
    pub channel: Option<Channel>,
    /// Unary interceptor factories, outermost first.
    pub interceptors: Vec<UnaryInterceptor>,
}

/// A script-visible client: one callable per service method, keyed by the
/// method's lowerCamelCase name.
pub struct ClientHandle {
    service: String,
    methods: HashMap<String, ClientMethod>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl ClientHandle {
    pub(crate) fn new(
        core: &Core,
        service: &str,
        opts: ClientOptions,
    ) -> Result<ClientHandle, RpcError> {
        let desc = core
            .pool
            .get_service_by_name(service)
            .ok_or_else(|| RpcError::not_found(format!("service {service} not found in pool")))?;
        let channel = match opts.channel {
            Some(channel) => channel,
            None => core.channel.clone(),
        };
        let interceptors: Arc<[UnaryInterceptor]> = opts.interceptors.into();

        let mut methods = HashMap::new();
        for method in desc.methods() {
            let full_method = format!("/{}/{}", desc.full_name(), method.name());
            let path: PathAndQuery = full_method
                .parse()
                .map_err(|e| RpcError::invalid_argument(format!("invalid method path: {e}")))?;
            methods.insert(
                lower_camel(method.name()),
                ClientMethod {
                    inner: Arc::new(MethodInner {
                        core: core.clone(),
                        channel: channel.clone(),
                        shape: MethodShape::of(&method),
                        desc: method,
                        path,
                        full_method,
                        interceptors: Arc::clone(&interceptors),
                    }),
                },
            );
        }
        Ok(ClientHandle {
            service: service.to_string(),
            methods,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Look up a method by its lowerCamelCase key.
    pub fn method(&self, name: &str) -> Result<&ClientMethod, RpcError> {
        self.methods.get(name).ok_or_else(|| {
            RpcError::not_found(format!("service {} has no method {name}", self.service))
        })
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

/// One callable RPC method.
#[derive(Clone)]
pub struct ClientMethod {
    inner: Arc<MethodInner>,
}

struct MethodInner {
    core: Core,
    channel: Channel,
    desc: MethodDescriptor,
    shape: MethodShape,
    path: PathAndQuery,
    full_method: String,
    interceptors: Arc<[UnaryInterceptor]>,
}

impl ClientMethod {
    pub fn shape(&self) -> MethodShape {
        self.inner.shape
    }

    pub fn full_method(&self) -> &str {
        &self.inner.full_method
    }

    /// Unary call: request in, promise of the response message out.
    pub fn unary(
        &self,
        request: &MessageValue,
        opts: CallOptions,
    ) -> Result<Promise<MessageValue>, RpcError> {
        self.check_shape(MethodShape::Unary)?;
        let ctx = CallContext::parse(opts, &self.inner.core.runtime);

        if self.inner.interceptors.is_empty() {
            let msg = match request.to_message(&self.inner.desc.input()) {
                Ok(msg) => msg,
                Err(err) => {
                    ctx.release();
                    return Err(err);
                }
            };
            return Ok(run_unary(Arc::clone(&self.inner), Arc::new(ctx), msg));
        }

        // Interceptor path: seed the payload header from the parsed outgoing
        // metadata, fold the chain, and let the innermost invoker execute the
        // bare path with whatever header state the chain left behind.
        let header = Metadata::from_tonic(&ctx.outgoing);
        let payload = UnaryPayload {
            method: self.inner.full_method.clone(),
            message: request.clone(),
            header,
        };

        let ctx_slot = Arc::new(Mutex::new(Some(ctx)));
        let m = Arc::clone(&self.inner);
        let slot = Arc::clone(&ctx_slot);
        let bare: UnaryInvoker = Arc::new(move |payload: UnaryPayload| {
            let mut ctx = slot
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take()
                .ok_or_else(|| {
                    RpcError::internal("interceptor chain: call context already consumed")
                })?;
            let msg = payload.message.to_message(&m.desc.input()).map_err(|err| {
                ctx.release();
                err
            })?;
            ctx.outgoing = payload.header.to_tonic();
            Ok(run_unary(Arc::clone(&m), Arc::new(ctx), msg))
        });

        let chain = build_chain(&self.inner.interceptors, bare);
        let next = match chain {
            Ok(next) => next,
            Err(err) => {
                release_slot(&ctx_slot);
                return Err(err);
            }
        };
        next(payload).map_err(|err| {
            release_slot(&ctx_slot);
            err
        })
    }

    /// Server-streaming call: request in, promise of a [`StreamReader`] out.
    pub fn server_streaming(
        &self,
        request: &MessageValue,
        opts: CallOptions,
    ) -> Result<Promise<StreamReader>, RpcError> {
        self.check_shape(MethodShape::ServerStream)?;
        let ctx = CallContext::parse(opts, &self.inner.core.runtime);
        let msg = match request.to_message(&self.inner.desc.input()) {
            Ok(msg) => msg,
            Err(err) => {
                ctx.release();
                return Err(err);
            }
        };

        let ctx = Arc::new(ctx);
        let (promise, completer) = Promise::<StreamReader>::new();
        let m = Arc::clone(&self.inner);
        let worker_ctx = Arc::clone(&ctx);
        self.inner.core.runtime.spawn(async move {
            let mut grpc = new_grpc(&m.channel);
            let codec = DynamicCodec::client(m.desc.input(), m.desc.output());
            let mut req = tonic::Request::new(msg);
            worker_ctx.apply_to_request(&mut req);
            let path = m.path.clone();

            let result = worker_ctx
                .guard(async {
                    grpc.ready().await.map_err(service_not_ready)?;
                    grpc.server_streaming(req, path, codec).await
                })
                .await;

            match result {
                Ok(response) => {
                    // The response future resolves once headers arrive, so
                    // the header callback is guaranteed to run before any
                    // recv settles.
                    let header = Metadata::from_tonic_filtered(response.metadata());
                    let on_header = worker_ctx.on_header.clone();
                    let reader = StreamReader::new(
                        m.core.clone(),
                        Arc::clone(&worker_ctx),
                        response.into_inner(),
                    );
                    let c2 = completer.clone();
                    m.core.submit_or_else(
                        Box::new(move || {
                            if let Some(cb) = &on_header {
                                cb(&header.read_only_view());
                            }
                            c2.resolve(reader);
                        }),
                        || {
                            completer.reject(RpcError::loop_closed());
                            worker_ctx.release();
                        },
                    );
                }
                Err(status) => {
                    let err = RpcError::from_status(&status, Some(&m.core.pool));
                    let c2 = completer.clone();
                    let ctx2 = Arc::clone(&worker_ctx);
                    m.core.submit_or_else(
                        Box::new(move || {
                            c2.reject(err);
                            ctx2.release();
                        }),
                        || {
                            completer.reject(RpcError::loop_closed());
                            worker_ctx.release();
                        },
                    );
                }
            }
        });
        Ok(promise)
    }

    /// Client-streaming call: promise of a [`ClientStreamCall`] whose
    /// `response` promise carries the single reply.
    pub fn client_streaming(&self, opts: CallOptions) -> Result<Promise<ClientStreamCall>, RpcError> {
        self.check_shape(MethodShape::ClientStream)?;
        let ctx = Arc::new(CallContext::parse(opts, &self.inner.core.runtime));

        let (call_promise, call_completer) = Promise::<ClientStreamCall>::new();
        let (resp_promise, resp_completer) = Promise::<MessageValue>::new();
        let (tx, rx) = mpsc::channel::<SendOp>(SEND_QUEUE_CAPACITY);
        let terminal = Arc::new(Mutex::new(None::<RpcError>));

        let m = Arc::clone(&self.inner);
        let worker_ctx = Arc::clone(&ctx);
        let worker_terminal = Arc::clone(&terminal);
        self.inner.core.runtime.spawn(async move {
            let mut grpc = new_grpc(&m.channel);
            let codec = DynamicCodec::client(m.desc.input(), m.desc.output());

            if let Err(status) = worker_ctx
                .guard(async { grpc.ready().await.map_err(service_not_ready) })
                .await
            {
                let err = RpcError::from_status(&status, Some(&m.core.pool));
                *lock_plain(&worker_terminal) = Some(err.clone());
                let c2 = call_completer.clone();
                let ctx2 = Arc::clone(&worker_ctx);
                m.core.submit_or_else(
                    Box::new(move || {
                        c2.reject(err);
                        ctx2.release();
                    }),
                    || {
                        call_completer.reject(RpcError::loop_closed());
                        worker_ctx.release();
                    },
                );
                return;
            }

            // Deliver the call object before the response exists; sends are
            // queued from here on, the header callback fires whenever the
            // response headers become available.
            let call = ClientStreamCall {
                sender: SendHalf {
                    tx,
                    input: m.desc.input(),
                    closed: Arc::new(AtomicBool::new(false)),
                    terminal: Arc::clone(&worker_terminal),
                },
                response: resp_promise,
            };
            {
                let c2 = call_completer.clone();
                m.core
                    .submit_or_else(Box::new(move || c2.resolve(call)), || {
                        call_completer.reject(RpcError::loop_closed());
                    });
            }

            let outbound = OutboundQueue::new(rx, m.core.clone());
            let mut req = tonic::Request::new(outbound);
            worker_ctx.apply_to_request(&mut req);
            let path = m.path.clone();

            let result = worker_ctx
                .guard(async { grpc.client_streaming(req, path, codec).await })
                .await;

            let on_header = worker_ctx.on_header.clone();
            let on_trailer = worker_ctx.on_trailer.clone();
            let ctx2 = Arc::clone(&worker_ctx);
            let pool = m.core.pool.clone();
            match result {
                Ok(response) => {
                    let md = Metadata::from_tonic_filtered(response.metadata());
                    let value = MessageValue::from_dynamic(response.into_inner());
                    let c2 = resp_completer.clone();
                    m.core.submit_or_else(
                        Box::new(move || {
                            if let Some(cb) = &on_header {
                                cb(&md.read_only_view());
                            }
                            if let Some(cb) = &on_trailer {
                                cb(&md.read_only_view());
                            }
                            c2.resolve(value);
                            ctx2.release();
                        }),
                        || {
                            resp_completer.reject(RpcError::loop_closed());
                            worker_ctx.release();
                        },
                    );
                }
                Err(status) => {
                    let err = RpcError::from_status(&status, Some(&pool));
                    *lock_plain(&worker_terminal) = Some(err.clone());
                    let md = Metadata::from_tonic_filtered(status.metadata());
                    let c2 = resp_completer.clone();
                    m.core.submit_or_else(
                        Box::new(move || {
                            if let Some(cb) = &on_header {
                                cb(&md.read_only_view());
                            }
                            if let Some(cb) = &on_trailer {
                                cb(&md.read_only_view());
                            }
                            c2.reject(err);
                            ctx2.release();
                        }),
                        || {
                            resp_completer.reject(RpcError::loop_closed());
                            worker_ctx.release();
                        },
                    );
                }
            }
        });
        Ok(call_promise)
    }

    /// Bidi call: promise of a [`BidiCall`] combining the send queue with a
    /// stream reader. Delivered once response headers arrive.
    pub fn bidi(&self, opts: CallOptions) -> Result<Promise<BidiCall>, RpcError> {
        self.check_shape(MethodShape::Bidi)?;
        let ctx = Arc::new(CallContext::parse(opts, &self.inner.core.runtime));

        let (call_promise, call_completer) = Promise::<BidiCall>::new();
        let (tx, rx) = mpsc::channel::<SendOp>(SEND_QUEUE_CAPACITY);
        let terminal = Arc::new(Mutex::new(None::<RpcError>));

        let m = Arc::clone(&self.inner);
        let worker_ctx = Arc::clone(&ctx);
        let worker_terminal = Arc::clone(&terminal);
        self.inner.core.runtime.spawn(async move {
            let mut grpc = new_grpc(&m.channel);
            let codec = DynamicCodec::client(m.desc.input(), m.desc.output());
            let outbound = OutboundQueue::new(rx, m.core.clone());
            let mut req = tonic::Request::new(outbound);
            worker_ctx.apply_to_request(&mut req);
            let path = m.path.clone();

            let result = worker_ctx
                .guard(async {
                    grpc.ready().await.map_err(service_not_ready)?;
                    grpc.streaming(req, path, codec).await
                })
                .await;

            match result {
                Ok(response) => {
                    let header = Metadata::from_tonic_filtered(response.metadata());
                    let on_header = worker_ctx.on_header.clone();
                    let reader = StreamReader::new(
                        m.core.clone(),
                        Arc::clone(&worker_ctx),
                        response.into_inner(),
                    );
                    let call = BidiCall {
                        sender: SendHalf {
                            tx,
                            input: m.desc.input(),
                            closed: Arc::new(AtomicBool::new(false)),
                            terminal: Arc::clone(&worker_terminal),
                        },
                        reader,
                    };
                    let c2 = call_completer.clone();
                    m.core.submit_or_else(
                        Box::new(move || {
                            if let Some(cb) = &on_header {
                                cb(&header.read_only_view());
                            }
                            c2.resolve(call);
                        }),
                        || {
                            call_completer.reject(RpcError::loop_closed());
                            worker_ctx.release();
                        },
                    );
                }
                Err(status) => {
                    let err = RpcError::from_status(&status, Some(&m.core.pool));
                    *lock_plain(&worker_terminal) = Some(err.clone());
                    let c2 = call_completer.clone();
                    let ctx2 = Arc::clone(&worker_ctx);
                    m.core.submit_or_else(
                        Box::new(move || {
                            c2.reject(err);
                            ctx2.release();
                        }),
                        || {
                            call_completer.reject(RpcError::loop_closed());
                            worker_ctx.release();
                        },
                    );
                }
            }
        });
        Ok(call_promise)
    }

    fn check_shape(&self, want: MethodShape) -> Result<(), RpcError> {
        if self.inner.shape != want {
            return Err(RpcError::invalid_argument(format!(
                "{} is a {} method, not {}",
                self.inner.full_method, self.inner.shape, want
            )));
        }
        Ok(())
    }
}

/// Bare unary execution: worker invoke, then one loop submit running header
/// callback, trailer callback, and settlement, then the context release.
fn run_unary(
    m: Arc<MethodInner>,
    ctx: Arc<CallContext>,
    msg: DynamicMessage,
) -> Promise<MessageValue> {
    let (promise, completer) = Promise::new();
    let worker_ctx = Arc::clone(&ctx);
    m.core.runtime.clone().spawn(async move {
        let mut grpc = new_grpc(&m.channel);
        let codec = DynamicCodec::client(m.desc.input(), m.desc.output());
        let mut req = tonic::Request::new(msg);
        worker_ctx.apply_to_request(&mut req);
        let path = m.path.clone();
        debug!(method = %m.full_method, "unary call");

        let result = worker_ctx
            .guard(async {
                grpc.ready().await.map_err(service_not_ready)?;
                grpc.unary(req, path, codec).await
            })
            .await;

        let on_header = worker_ctx.on_header.clone();
        let on_trailer = worker_ctx.on_trailer.clone();
        let pool = m.core.pool.clone();
        let ctx2 = Arc::clone(&worker_ctx);
        let c2 = completer.clone();
        let task: Box<dyn FnOnce() + Send> = Box::new(move || {
            match result {
                Ok(response) => {
                    // tonic surfaces unary headers and trailers as one
                    // merged map; both callbacks observe it.
                    let md = Metadata::from_tonic_filtered(response.metadata());
                    if let Some(cb) = &on_header {
                        cb(&md.read_only_view());
                    }
                    if let Some(cb) = &on_trailer {
                        cb(&md.read_only_view());
                    }
                    c2.resolve(MessageValue::from_dynamic(response.into_inner()));
                }
                Err(status) => {
                    let md = Metadata::from_tonic_filtered(status.metadata());
                    if let Some(cb) = &on_header {
                        cb(&md.read_only_view());
                    }
                    if let Some(cb) = &on_trailer {
                        cb(&md.read_only_view());
                    }
                    c2.reject(RpcError::from_status(&status, Some(&pool)));
                }
            }
            ctx2.release();
        });
        m.core.submit_or_else(task, || {
            completer.reject(RpcError::loop_closed());
            worker_ctx.release();
        });
    });
    promise
}

/// Fold interceptor factories right-to-left over the bare invoker, so the
/// first listed factory produces the outermost wrapper. Each factory runs
/// exactly once.
pub(crate) fn build_chain(
    interceptors: &[UnaryInterceptor],
    inner: UnaryInvoker,
) -> Result<UnaryInvoker, RpcError> {
    let mut next = inner;
    for factory in interceptors.iter().rev() {
        next = factory(next)
            .map_err(|e| RpcError::internal(format!("interceptor chain: {}", e.message)))?;
    }
    Ok(next)
}

fn release_slot(slot: &Arc<Mutex<Option<CallContext>>>) {
    if let Some(ctx) = lock_plain(slot).take() {
        ctx.release();
    }
}

fn lock_plain<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn new_grpc(channel: &Channel) -> Grpc<Channel> {
    Grpc::new(channel.clone()).accept_compressed(CompressionEncoding::Gzip)
}

fn service_not_ready(e: tonic::transport::Error) -> Status {
    Status::unavailable(format!("service not ready: {e}"))
}

// -- Stream reading ------------------------------------------------------------

enum ReadTerminal {
    Open,
    Eof,
    Failed(RpcError),
}

struct ReaderShared {
    core: Core,
    ctx: Arc<CallContext>,
    stream: tokio::sync::Mutex<Option<Streaming<DynamicMessage>>>,
    terminal: Mutex<ReadTerminal>,
    trailer_once: OnceGuard,
    on_trailer: Option<MetadataCallback>,
}

/// Receiving half of server-stream and bidi calls. `recv()` resolves with
/// `{value, done:false}` per message, `{done:true}` at end of stream, and
/// rejects with the mapped status on failure. The trailer callback fires at
/// most once, before the final settlement.
#[derive(Clone)]
pub struct StreamReader {
    shared: Arc<ReaderShared>,
}

impl StreamReader {
    fn new(core: Core, ctx: Arc<CallContext>, stream: Streaming<DynamicMessage>) -> StreamReader {
        let on_trailer = ctx.on_trailer.clone();
        StreamReader {
            shared: Arc::new(ReaderShared {
                core,
                ctx,
                stream: tokio::sync::Mutex::new(Some(stream)),
                terminal: Mutex::new(ReadTerminal::Open),
                trailer_once: OnceGuard::new(),
                on_trailer,
            }),
        }
    }

    pub fn recv(&self) -> Promise<StreamItem> {
        let (promise, completer) = Promise::new();
        match &*lock_plain(&self.shared.terminal) {
            ReadTerminal::Eof => {
                completer.resolve(StreamItem::finished());
                return promise;
            }
            ReadTerminal::Failed(err) => {
                completer.reject(err.clone());
                return promise;
            }
            ReadTerminal::Open => {}
        }
        let shared = Arc::clone(&self.shared);
        self.shared
            .core
            .runtime
            .clone()
            .spawn(async move { recv_worker(shared, completer).await });
        promise
    }
}

async fn recv_worker(shared: Arc<ReaderShared>, completer: Completer<StreamItem>) {
    let mut slot = shared.stream.lock().await;

    // A concurrent recv may have hit the terminal while we waited.
    match &*lock_plain(&shared.terminal) {
        ReadTerminal::Eof => {
            completer.resolve(StreamItem::finished());
            return;
        }
        ReadTerminal::Failed(err) => {
            completer.reject(err.clone());
            return;
        }
        ReadTerminal::Open => {}
    }

    let Some(stream) = slot.as_mut() else {
        completer.reject(RpcError::cancelled("call cancelled"));
        return;
    };

    let result = shared.ctx.guard(stream.message()).await;
    match result {
        Ok(Some(msg)) => {
            drop(slot);
            let item = StreamItem::message(MessageValue::from_dynamic(msg));
            let c2 = completer.clone();
            shared
                .core
                .submit_or_else(Box::new(move || c2.resolve(item)), || {
                    completer.reject(RpcError::loop_closed());
                });
        }
        Ok(None) => {
            // End of stream: fetch trailers once, then fire the trailer
            // callback and resolve the done marker on the loop.
            let trailer_md = match stream.trailers().await {
                Ok(Some(md)) => md,
                _ => Default::default(),
            };
            *lock_plain(&shared.terminal) = ReadTerminal::Eof;
            drop(slot);
            finish_recv(&shared, completer, Ok(StreamItem::finished()), trailer_md);
        }
        Err(status) => {
            // Terminal failure; drop the transport stream so the peer
            // observes the reset on explicit cancellation.
            *slot = None;
            let err = RpcError::from_status(&status, Some(&shared.core.pool));
            *lock_plain(&shared.terminal) = ReadTerminal::Failed(err.clone());
            drop(slot);
            let trailer_md = status.metadata().clone();
            finish_recv(&shared, completer, Err(err), trailer_md);
        }
    }
}

/// Shared terminal path for recv: trailer callback (once), settle, release.
fn finish_recv(
    shared: &Arc<ReaderShared>,
    completer: Completer<StreamItem>,
    outcome: Result<StreamItem, RpcError>,
    trailer_md: tonic::metadata::MetadataMap,
) {
    let fire_trailer = shared.trailer_once.first();
    let on_trailer = shared.on_trailer.clone();
    let ctx = Arc::clone(&shared.ctx);
    let c2 = completer.clone();
    let ctx_fallback = Arc::clone(&shared.ctx);
    shared.core.submit_or_else(
        Box::new(move || {
            if fire_trailer {
                if let Some(cb) = &on_trailer {
                    let md = Metadata::from_tonic_filtered(&trailer_md);
                    cb(&md.read_only_view());
                }
            }
            c2.settle(outcome);
            ctx.release();
        }),
        move || {
            completer.reject(RpcError::loop_closed());
            ctx_fallback.release();
        },
    );
}

// -- Stream sending ------------------------------------------------------------

enum SendOp {
    Msg(DynamicMessage, Completer<()>),
    Close(Completer<()>),
}

/// Send side shared by client-stream and bidi calls: a bounded queue drained
/// by the outbound stream adapter, preserving script send order.
#[derive(Clone)]
struct SendHalf {
    tx: mpsc::Sender<SendOp>,
    input: prost_reflect::MessageDescriptor,
    closed: Arc<AtomicBool>,
    terminal: Arc<Mutex<Option<RpcError>>>,
}

impl SendHalf {
    fn send(&self, msg: &MessageValue) -> Promise<()> {
        let (promise, completer) = Promise::new();
        if self.closed.load(Ordering::SeqCst) {
            // After closeSend the sender has terminated; the op would sit in
            // the queue forever, so the promise simply never settles.
            return promise;
        }
        let dynamic = match msg.to_message(&self.input) {
            Ok(dynamic) => dynamic,
            Err(err) => {
                completer.reject(err);
                return promise;
            }
        };
        self.enqueue(SendOp::Msg(dynamic, completer));
        promise
    }

    fn close_send(&self) -> Promise<()> {
        let (promise, completer) = Promise::new();
        if self.closed.swap(true, Ordering::SeqCst) {
            return promise;
        }
        self.enqueue(SendOp::Close(completer));
        promise
    }

    /// Queue an op; a full queue blocks the caller (the queue is the only
    /// cross-thread mutable structure and is strictly bounded). When the RPC
    /// is already over, the op observes the terminal error.
    fn enqueue(&self, op: SendOp) {
        if let Err(failed) = self.tx.blocking_send(op) {
            let completer = match failed.0 {
                SendOp::Msg(_, completer) => completer,
                SendOp::Close(completer) => completer,
            };
            let err = lock_plain(&self.terminal)
                .clone()
                .unwrap_or_else(|| RpcError::unavailable("stream closed"));
            completer.reject(err);
        }
    }
}

/// Outbound request stream: yields queued messages in order, settling each
/// send as its message is handed to the transport; ends at the close marker.
struct OutboundQueue {
    rx: mpsc::Receiver<SendOp>,
    core: Core,
    done: bool,
}

impl OutboundQueue {
    fn new(rx: mpsc::Receiver<SendOp>, core: Core) -> OutboundQueue {
        OutboundQueue {
            rx,
            core,
            done: false,
        }
    }

    fn settle(&self, completer: Completer<()>) {
        let c2 = completer.clone();
        self.core
            .submit_or_else(Box::new(move || c2.resolve(())), || {
                completer.reject(RpcError::loop_closed());
            });
    }
}

impl Stream for OutboundQueue {
    type Item = DynamicMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(SendOp::Msg(msg, completer))) => {
                self.settle(completer);
                Poll::Ready(Some(msg))
            }
            Poll::Ready(Some(SendOp::Close(completer))) => {
                self.done = true;
                self.settle(completer);
                Poll::Ready(None)
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Client-streaming call object: queued sends plus the lazily-settled
/// response promise.
#[derive(Clone)]
pub struct ClientStreamCall {
    sender: SendHalf,
    response: Promise<MessageValue>,
}

impl ClientStreamCall {
    pub fn send(&self, msg: &MessageValue) -> Promise<()> {
        self.sender.send(msg)
    }

    pub fn close_send(&self) -> Promise<()> {
        self.sender.close_send()
    }

    pub fn response(&self) -> Promise<MessageValue> {
        self.response.clone()
    }
}

/// Bidi call object: the send queue plus a stream reader.
#[derive(Clone)]
pub struct BidiCall {
    sender: SendHalf,
    reader: StreamReader,
}

impl BidiCall {
    pub fn send(&self, msg: &MessageValue) -> Promise<()> {
        self.sender.send(msg)
    }

    pub fn close_send(&self) -> Promise<()> {
        self.sender.close_send()
    }

    pub fn recv(&self) -> Promise<StreamItem> {
        self.reader.recv()
    }
}

/// gRPC method names are UpperCamelCase; scripts see lowerCamelCase keys.
fn lower_camel(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn empty_message() -> MessageValue {
        let fds = prost_types::FileDescriptorSet {
            file: vec![prost_types::FileDescriptorProto {
                name: Some("client_test.proto".into()),
                package: Some("clienttest".into()),
                message_type: vec![prost_types::DescriptorProto {
                    name: Some("Empty".into()),
                    ..Default::default()
                }],
                syntax: Some("proto3".into()),
                ..Default::default()
            }],
        };
        let pool = prost_reflect::DescriptorPool::from_file_descriptor_set(fds).unwrap();
        MessageValue::new(pool.get_message_by_name("clienttest.Empty").unwrap())
    }

    #[test]
    fn lower_camel_keys() {
        assert_eq!(lower_camel("SayHello"), "sayHello");
        assert_eq!(lower_camel("Echo"), "echo");
        assert_eq!(lower_camel(""), "");
    }

    #[test]
    fn chain_folds_right_to_left() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let trace = |label: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| -> UnaryInterceptor {
            let order = Arc::clone(order);
            Arc::new(move |next: UnaryInvoker| {
                let order = Arc::clone(&order);
                Ok(Arc::new(move |payload: UnaryPayload| {
                    order.lock().unwrap().push(label);
                    next(payload)
                }) as UnaryInvoker)
            })
        };
        let interceptors = vec![trace("outer", &order), trace("inner", &order)];

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let bare: UnaryInvoker = Arc::new(move |_payload| {
            calls2.fetch_add(1, Ordering::SeqCst);
            let (promise, completer) = Promise::new();
            completer.resolve(empty_message());
            Ok(promise)
        });

        let next = build_chain(&interceptors, bare).unwrap();
        let payload = UnaryPayload {
            method: "/t.S/M".into(),
            message: empty_message(),
            header: Metadata::new(),
        };
        next(payload).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn chain_factory_errors_propagate() {
        let failing: UnaryInterceptor =
            Arc::new(|_next| Err(RpcError::internal("factory exploded")));
        let bare: UnaryInvoker = Arc::new(|_payload| {
            let (promise, _completer) = Promise::new();
            Ok(promise)
        });
        let err = match build_chain(&[failing], bare) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.code, crate::status::code::INTERNAL);
        assert!(err.message.contains("interceptor chain"));
    }

    #[test]
    fn factories_run_once_at_build_time() {
        let built = Arc::new(AtomicUsize::new(0));
        let built2 = Arc::clone(&built);
        let counting: UnaryInterceptor = Arc::new(move |next: UnaryInvoker| {
            built2.fetch_add(1, Ordering::SeqCst);
            Ok(next)
        });
        let bare: UnaryInvoker = Arc::new(|_payload| {
            let (promise, _completer) = Promise::new();
            Ok(promise)
        });
        let _next = build_chain(&[counting.clone(), counting], bare).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }
}
