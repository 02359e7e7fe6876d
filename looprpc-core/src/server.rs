use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::metadata::MetadataMap;
use tonic::server::Grpc;
use tonic::{Status, Streaming};
use tower::Service;
use tracing::{debug, info, warn};

use crate::call_options::AbortSignal;
use crate::client::{MethodShape, StreamItem};
use crate::codec::DynamicCodec;
use crate::event_loop::LoopTask;
use crate::message::MessageValue;
use crate::metadata::Metadata;
use crate::options::Core;
use crate::promise::{Completer, Promise};
use crate::status::RpcError;

/// Outbound message buffer between a handler's `send` and the transport.
const SEND_BUFFER: usize = 16;

const REFLECTION_PREFIX: &str = "/grpc.reflection.v1.ServerReflection/";

/// What a handler hands back: a value now, or a promise of one. Stream
/// shapes ignore the value itself and only use settlement as the finish
/// signal.
pub enum HandlerReply {
    Ready(Option<MessageValue>),
    Pending(Promise<Option<MessageValue>>),
}

pub type HandlerResult = Result<HandlerReply, RpcError>;

/// Handler for shapes that take a request message (unary, server-stream).
pub type RequestHandler =
    Arc<dyn Fn(MessageValue, Arc<ServerCall>) -> HandlerResult + Send + Sync>;

/// Handler for stream-consuming shapes (client-stream, bidi).
pub type CallHandler = Arc<dyn Fn(Arc<ServerCall>) -> HandlerResult + Send + Sync>;

pub enum Handler {
    Unary(RequestHandler),
    ServerStream(RequestHandler),
    ClientStream(CallHandler),
    Bidi(CallHandler),
}

impl Handler {
    fn shape(&self) -> MethodShape {
        match self {
            Handler::Unary(_) => MethodShape::Unary,
            Handler::ServerStream(_) => MethodShape::ServerStream,
            Handler::ClientStream(_) => MethodShape::ClientStream,
            Handler::Bidi(_) => MethodShape::Bidi,
        }
    }
}

/// The `next` function of the server interceptor chain.
pub type ServerNext = Arc<dyn Fn(Arc<ServerCall>) -> HandlerResult + Send + Sync>;

/// Server interceptor factory; chains fold right-to-left, first added is
/// outermost, every factory runs once at server start.
pub type ServerInterceptor = Arc<dyn Fn(ServerNext) -> Result<ServerNext, RpcError> + Send + Sync>;

/// Method-name → handler table for one service registration.
#[derive(Default)]
pub struct ServiceHandlers {
    handlers: HashMap<String, Handler>,
}

impl ServiceHandlers {
    pub fn new() -> ServiceHandlers {
        ServiceHandlers::default()
    }

    pub fn unary(
        mut self,
        method: &str,
        f: impl Fn(MessageValue, Arc<ServerCall>) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.handlers
            .insert(method.to_string(), Handler::Unary(Arc::new(f)));
        self
    }

    pub fn server_streaming(
        mut self,
        method: &str,
        f: impl Fn(MessageValue, Arc<ServerCall>) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.handlers
            .insert(method.to_string(), Handler::ServerStream(Arc::new(f)));
        self
    }

    pub fn client_streaming(
        mut self,
        method: &str,
        f: impl Fn(Arc<ServerCall>) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.handlers
            .insert(method.to_string(), Handler::ClientStream(Arc::new(f)));
        self
    }

    pub fn bidi(
        mut self,
        method: &str,
        f: impl Fn(Arc<ServerCall>) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.handlers
            .insert(method.to_string(), Handler::Bidi(Arc::new(f)));
        self
    }
}

struct MethodEntry {
    full_method: String,
    input: MessageDescriptor,
    output: MessageDescriptor,
    shape: MethodShape,
    handler: Option<Handler>,
}

/// Builder returned by `createServer`.
pub struct ServerBuilder {
    core: Core,
    methods: HashMap<String, Arc<MethodEntry>>,
    interceptors: Vec<ServerInterceptor>,
    reflection: bool,
}

impl ServerBuilder {
    pub(crate) fn new(core: Core, reflection: bool) -> ServerBuilder {
        ServerBuilder {
            core,
            methods: HashMap::new(),
            interceptors: Vec::new(),
            reflection,
        }
    }

    /// Register handlers for a service by its fully-qualified name. Every
    /// method of the descriptor gets a transport route; methods without a
    /// handler answer `Unimplemented`.
    pub fn add_service(
        &mut self,
        full_name: &str,
        mut handlers: ServiceHandlers,
    ) -> Result<(), RpcError> {
        let desc = self
            .core
            .pool
            .get_service_by_name(full_name)
            .ok_or_else(|| RpcError::not_found(format!("service {full_name} not found in pool")))?;

        for method in desc.methods() {
            let shape = MethodShape::of(&method);
            let handler = handlers.handlers.remove(method.name());
            if let Some(handler) = &handler {
                if handler.shape() != shape {
                    return Err(RpcError::invalid_argument(format!(
                        "handler for {full_name}.{} is registered as {}, method is {shape}",
                        method.name(),
                        handler.shape(),
                    )));
                }
            }
            let full_method = format!("/{}/{}", desc.full_name(), method.name());
            self.methods.insert(
                full_method.clone(),
                Arc::new(MethodEntry {
                    full_method,
                    input: method.input(),
                    output: method.output(),
                    shape,
                    handler,
                }),
            );
        }

        if let Some(stray) = handlers.handlers.keys().next() {
            return Err(RpcError::invalid_argument(format!(
                "service {full_name} has no method named {stray}"
            )));
        }
        Ok(())
    }

    pub fn add_interceptor(&mut self, interceptor: ServerInterceptor) {
        self.interceptors.push(interceptor);
    }

    /// Host gRPC v1 reflection for the registered pool.
    pub fn enable_reflection(&mut self) {
        self.reflection = true;
    }

    /// Bind and serve. The address is `host:port`; port 0 picks an
    /// ephemeral port, available from the returned handle.
    pub fn start(self, addr: &str) -> Result<ServerHandle, RpcError> {
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| RpcError::unavailable(format!("failed to bind {addr}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| RpcError::unavailable(format!("failed to configure listener: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RpcError::unavailable(format!("failed to read local address: {e}")))?;

        let chain = build_server_chain(&self.interceptors);
        let reflection = if self.reflection {
            Some(build_reflection_service(&self.core)?)
        } else {
            None
        };
        let inner = Arc::new(ServerInner {
            core: self.core.clone(),
            methods: self.methods,
            chain,
            reflection,
        });

        let shutdown = CancellationToken::new();
        let accept_shutdown = shutdown.clone();
        self.core.runtime.spawn(async move {
            let listener = match TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("failed to register listener: {e}");
                    return;
                }
            };
            info!(%local_addr, "server listening");
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                warn!("accept failed: {e}");
                                continue;
                            }
                        };
                        debug!(%peer, "connection accepted");
                        let service = BridgeService {
                            inner: Arc::clone(&inner),
                        };
                        let conn_shutdown = accept_shutdown.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let builder = hyper_util::server::conn::auto::Builder::new(
                                TokioExecutor::new(),
                            );
                            let conn =
                                builder.serve_connection(io, TowerToHyperService::new(service));
                            tokio::pin!(conn);
                            tokio::select! {
                                result = &mut conn => {
                                    if let Err(e) = result {
                                        debug!("connection ended: {e}");
                                    }
                                }
                                _ = conn_shutdown.cancelled() => {}
                            }
                        });
                    }
                }
            }
            info!(%local_addr, "server stopped");
        });

        Ok(ServerHandle {
            local_addr,
            shutdown,
        })
    }
}

/// A running server: bound address plus shutdown.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dialable `host:port` string for the bound listener.
    pub fn target(&self) -> String {
        self.local_addr.to_string()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

type ReflectionService =
    tower::util::BoxCloneService<http::Request<Incoming>, http::Response<Body>, Infallible>;

struct ServerInner {
    core: Core,
    methods: HashMap<String, Arc<MethodEntry>>,
    /// Folded once at start; a factory failure poisons every call with the
    /// same `Internal` status.
    chain: Result<ServerNext, RpcError>,
    reflection: Option<Mutex<ReflectionService>>,
}

/// Fold the interceptor chain over the handler dispatcher.
fn build_server_chain(interceptors: &[ServerInterceptor]) -> Result<ServerNext, RpcError> {
    let mut next: ServerNext = Arc::new(|call: Arc<ServerCall>| dispatch_handler(&call));
    for factory in interceptors.iter().rev() {
        next = factory(next)
            .map_err(|e| RpcError::internal(format!("interceptor chain: {}", e.message)))?;
    }
    Ok(next)
}

/// The innermost `next`: run the registered handler for the call's method.
fn dispatch_handler(call: &Arc<ServerCall>) -> HandlerResult {
    match &call.entry.handler {
        None => Err(RpcError::unimplemented(format!(
            "method {} has no handler",
            call.entry.full_method
        ))),
        Some(Handler::Unary(f)) | Some(Handler::ServerStream(f)) => {
            let request = call
                .request
                .clone()
                .ok_or_else(|| RpcError::internal("missing request message"))?;
            f(request, Arc::clone(call))
        }
        Some(Handler::ClientStream(f)) | Some(Handler::Bidi(f)) => f(Arc::clone(call)),
    }
}

fn build_reflection_service(core: &Core) -> Result<Mutex<ReflectionService>, RpcError> {
    let fds = prost_types::FileDescriptorSet {
        file: core
            .pool
            .files()
            .map(|f| f.file_descriptor_proto().clone())
            .collect(),
    };
    let service = tonic_reflection::server::Builder::configure()
        .register_file_descriptor_set(fds)
        .build_v1()
        .map_err(|e| RpcError::internal(format!("reflection registry: {e}")))?;
    Ok(Mutex::new(tower::util::BoxCloneService::new(service)))
}

// -- The per-call object -------------------------------------------------------

struct HeaderState {
    buffered: Metadata,
    flushed: bool,
}

struct OutboundHalf {
    tx: Mutex<Option<mpsc::Sender<Result<DynamicMessage, Status>>>>,
    flush_tx: Mutex<Option<oneshot::Sender<MetadataMap>>>,
}

struct InboundHalf {
    pull_tx: mpsc::UnboundedSender<Completer<StreamItem>>,
}

/// The handler-side call object, built on the loop thread per request.
///
/// Header state machine: `set_header` buffers until the first flush (an
/// explicit `send_header`, the first `send`, or finalization); mutating
/// headers after the flush is an error at the call site.
pub struct ServerCall {
    entry: Arc<MethodEntry>,
    request: Option<MessageValue>,
    request_header: Metadata,
    header: Mutex<HeaderState>,
    trailer: Metadata,
    outbound: Option<OutboundHalf>,
    inbound: Option<InboundHalf>,
    cancel: CancellationToken,
}

impl ServerCall {
    pub fn method(&self) -> &str {
        &self.entry.full_method
    }

    pub fn shape(&self) -> MethodShape {
        self.entry.shape
    }

    /// Read-only view of the request metadata.
    pub fn request_header(&self) -> Metadata {
        self.request_header.clone()
    }

    /// Buffer response headers. Fails once headers have been flushed.
    pub fn set_header(&self, md: &Metadata) -> Result<(), RpcError> {
        let mut state = lock(&self.header);
        if state.flushed {
            return Err(RpcError::invalid_argument("headers already sent"));
        }
        state.buffered.merge_from(md);
        Ok(())
    }

    /// Flush buffered headers immediately. Fails when already flushed.
    pub fn send_header(&self) -> Result<(), RpcError> {
        let mut state = lock(&self.header);
        if state.flushed {
            return Err(RpcError::invalid_argument("headers already sent"));
        }
        state.flushed = true;
        let md = state.buffered.to_tonic();
        drop(state);
        if let Some(outbound) = &self.outbound {
            if let Some(flush_tx) = lock(&outbound.flush_tx).take() {
                let _ = flush_tx.send(md);
            }
        }
        Ok(())
    }

    /// Merge entries into the trailer metadata.
    pub fn set_trailer(&self, md: &Metadata) {
        self.trailer.merge_from(md);
    }

    /// Send one message on a stream-producing call. Flushes headers on the
    /// first send. Raises synchronously on type mismatches and on transport
    /// failure (peer gone, call cancelled).
    pub fn send(&self, msg: &MessageValue) -> Result<(), RpcError> {
        let outbound = self.outbound.as_ref().ok_or_else(|| {
            RpcError::invalid_argument(format!(
                "{} is a {} method, send is not available",
                self.entry.full_method, self.entry.shape
            ))
        })?;
        let dynamic = msg.to_message(&self.entry.output)?;
        self.ensure_flushed();
        let tx = lock(&outbound.tx).clone();
        let Some(tx) = tx else {
            return Err(RpcError::unavailable("stream already finished"));
        };
        tx.blocking_send(Ok(dynamic)).map_err(|_| {
            if self.cancel.is_cancelled() {
                RpcError::cancelled("call cancelled")
            } else {
                RpcError::unavailable("stream closed")
            }
        })
    }

    /// Receive one message on a stream-consuming call.
    pub fn recv(&self) -> Promise<StreamItem> {
        let (promise, completer) = Promise::new();
        let Some(inbound) = self.inbound.as_ref() else {
            completer.reject(RpcError::invalid_argument(format!(
                "{} is a {} method, recv is not available",
                self.entry.full_method, self.entry.shape
            )));
            return promise;
        };
        if inbound.pull_tx.send(completer.clone()).is_err() {
            completer.reject(RpcError::cancelled("call cancelled"));
        }
        promise
    }

    /// Signal that fires when the peer disconnects or cancels the call.
    pub fn abort_signal(&self) -> AbortSignal {
        AbortSignal::from_token(self.cancel.clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn ensure_flushed(&self) {
        let _ = self.send_header();
    }

    /// Response metadata for unary shapes: flushes the header buffer and
    /// appends trailer entries (tonic has no separate trailer channel for
    /// single-message responses).
    fn unary_response_metadata(&self) -> MetadataMap {
        {
            let mut state = lock(&self.header);
            state.flushed = true;
        }
        let mut md = lock(&self.header).buffered.to_tonic();
        self.trailer.merge_into_tonic(&mut md);
        md
    }

    /// Terminal for stream-producing shapes: flush headers, then either end
    /// cleanly, end with an explicit OK status carrying trailer metadata, or
    /// end with the mapped error status.
    fn finish_stream(&self, outcome: Result<(), RpcError>, blocking: bool) {
        self.ensure_flushed();
        let Some(outbound) = self.outbound.as_ref() else {
            return;
        };
        let Some(tx) = lock(&outbound.tx).take() else {
            return;
        };
        let trailer_md = self.trailer.to_tonic();
        let status = match outcome {
            Err(err) => {
                let mut status = err.to_status();
                merge_metadata(status.metadata_mut(), &trailer_md);
                Some(status)
            }
            Ok(()) if !trailer_md.is_empty() => Some(Status::with_metadata(
                tonic::Code::Ok,
                String::new(),
                trailer_md,
            )),
            Ok(()) => None,
        };
        if let Some(status) = status {
            if blocking {
                let _ = tx.blocking_send(Err(status));
            } else {
                let _ = tx.try_send(Err(status));
            }
        }
        // Dropping the sender closes the response stream.
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn merge_metadata(dst: &mut MetadataMap, src: &MetadataMap) {
    for kv in src.iter() {
        match kv {
            tonic::metadata::KeyAndValueRef::Ascii(key, value) => {
                dst.append(key.clone(), value.clone());
            }
            tonic::metadata::KeyAndValueRef::Binary(key, value) => {
                dst.append_bin(key.clone(), value.clone());
            }
        }
    }
}

// -- Finalization --------------------------------------------------------------

/// Drive a handler result for single-response shapes into the transport
/// oneshot: unwrap the message, attach header/trailer metadata, map errors.
fn finalize_single(
    call: Arc<ServerCall>,
    result: HandlerResult,
    tx: oneshot::Sender<Result<tonic::Response<DynamicMessage>, Status>>,
) {
    match result {
        Err(err) => send_error(&call, err, tx),
        Ok(HandlerReply::Ready(value)) => complete_single(&call, value, tx),
        Ok(HandlerReply::Pending(promise)) => {
            let call2 = Arc::clone(&call);
            promise.on_settle(move |settled| match settled {
                Ok(value) => complete_single(&call2, value.clone(), tx),
                Err(err) => send_error(&call2, err.clone(), tx),
            });
        }
    }
}

fn complete_single(
    call: &Arc<ServerCall>,
    value: Option<MessageValue>,
    tx: oneshot::Sender<Result<tonic::Response<DynamicMessage>, Status>>,
) {
    let Some(value) = value else {
        return send_error(
            call,
            RpcError::internal("handler response nil/undefined"),
            tx,
        );
    };
    match value.to_message(&call.entry.output) {
        Ok(msg) => {
            let mut response = tonic::Response::new(msg);
            *response.metadata_mut() = call.unary_response_metadata();
            let _ = tx.send(Ok(response));
        }
        Err(err) => send_error(
            call,
            RpcError::internal(format!("handler response {}", err.message)),
            tx,
        ),
    }
}

fn send_error(
    call: &Arc<ServerCall>,
    err: RpcError,
    tx: oneshot::Sender<Result<tonic::Response<DynamicMessage>, Status>>,
) {
    let mut status = err.to_status();
    let trailer_md = call.trailer.to_tonic();
    merge_metadata(status.metadata_mut(), &trailer_md);
    let _ = tx.send(Err(status));
}

/// Drive a handler result for stream-producing shapes: the return value is
/// ignored, settlement (or the synchronous return) finishes the stream.
fn finalize_stream(call: Arc<ServerCall>, result: HandlerResult) {
    match result {
        Err(err) => call.finish_stream(Err(err), true),
        Ok(HandlerReply::Ready(_)) => call.finish_stream(Ok(()), true),
        Ok(HandlerReply::Pending(promise)) => {
            let call2 = Arc::clone(&call);
            promise.on_settle(move |settled| match settled {
                Ok(_) => call2.finish_stream(Ok(()), true),
                Err(err) => call2.finish_stream(Err(err.clone()), true),
            });
        }
    }
}

/// Run the interceptor chain and hand the result to the finalizer, on the
/// loop thread.
fn run_call(inner: &Arc<ServerInner>, call: Arc<ServerCall>, finalize: impl FnOnce(Arc<ServerCall>, HandlerResult) + Send + 'static) -> LoopTask {
    let chain = inner.chain.clone();
    Box::new(move || {
        let result = match chain {
            Ok(next) => next(Arc::clone(&call)),
            Err(err) => Err(err),
        };
        finalize(call, result);
    })
}

// -- Inbound pump --------------------------------------------------------------

/// Serve script `recv()` pulls from the transport stream, one at a time.
/// Terminal results latch: every pull after EOF resolves done, every pull
/// after a failure rejects with the same error.
async fn recv_pump(
    core: Core,
    mut streaming: Streaming<DynamicMessage>,
    mut pull_rx: mpsc::UnboundedReceiver<Completer<StreamItem>>,
    cancel: CancellationToken,
) {
    let mut terminal: Option<Result<StreamItem, RpcError>> = None;
    while let Some(completer) = pull_rx.recv().await {
        if let Some(latched) = &terminal {
            settle_on_loop(&core, completer, latched.clone());
            continue;
        }
        let result = tokio::select! {
            result = streaming.message() => result,
            _ = cancel.cancelled() => Err(Status::cancelled("call cancelled")),
        };
        let outcome = match result {
            Ok(Some(msg)) => Ok(StreamItem {
                value: Some(MessageValue::from_dynamic(msg)),
                done: false,
            }),
            Ok(None) => {
                let done = Ok(StreamItem {
                    value: None,
                    done: true,
                });
                terminal = Some(done.clone());
                done
            }
            Err(status) => {
                cancel.cancel();
                let err = RpcError::from_status(&status, Some(&core.pool));
                terminal = Some(Err(err.clone()));
                Err(err)
            }
        };
        settle_on_loop(&core, completer, outcome);
    }
}

fn settle_on_loop(core: &Core, completer: Completer<StreamItem>, outcome: Result<StreamItem, RpcError>) {
    let c2 = completer.clone();
    core.submit_or_else(Box::new(move || c2.settle(outcome)), || {
        completer.reject(RpcError::loop_closed());
    });
}

// -- Transport dispatch --------------------------------------------------------

type DispatchFuture<T> =
    Pin<Box<dyn Future<Output = Result<tonic::Response<T>, Status>> + Send + 'static>>;

struct UnaryDispatch {
    inner: Arc<ServerInner>,
    entry: Arc<MethodEntry>,
}

impl tonic::server::UnaryService<DynamicMessage> for UnaryDispatch {
    type Response = DynamicMessage;
    type Future = DispatchFuture<DynamicMessage>;

    fn call(&mut self, request: tonic::Request<DynamicMessage>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        let entry = Arc::clone(&self.entry);
        Box::pin(async move {
            let (meta, _ext, msg) = request.into_parts();
            let cancel = CancellationToken::new();
            let _disconnect = cancel.clone().drop_guard();
            let call = Arc::new(ServerCall {
                entry,
                request: Some(MessageValue::from_dynamic(msg)),
                request_header: Metadata::from_tonic(&meta).read_only_view(),
                header: Mutex::new(HeaderState {
                    buffered: Metadata::new(),
                    flushed: false,
                }),
                trailer: Metadata::new(),
                outbound: None,
                inbound: None,
                cancel,
            });
            let (tx, rx) = oneshot::channel();
            let task = run_call(&inner, call, |call, result| finalize_single(call, result, tx));
            // A dropped task drops the sender, which the await below reads
            // as the loop being gone.
            inner.core.submit_or_else(task, || {});
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Status::unavailable("event loop not running")),
            }
        })
    }
}

struct ServerStreamDispatch {
    inner: Arc<ServerInner>,
    entry: Arc<MethodEntry>,
}

impl tonic::server::ServerStreamingService<DynamicMessage> for ServerStreamDispatch {
    type Response = DynamicMessage;
    type ResponseStream = ReceiverStream<Result<DynamicMessage, Status>>;
    type Future = DispatchFuture<Self::ResponseStream>;

    fn call(&mut self, request: tonic::Request<DynamicMessage>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        let entry = Arc::clone(&self.entry);
        Box::pin(async move {
            let (meta, _ext, msg) = request.into_parts();
            let (msg_tx, msg_rx) = mpsc::channel(SEND_BUFFER);
            let (flush_tx, flush_rx) = oneshot::channel();
            let cancel = CancellationToken::new();

            // The receiver lives inside the response body; its drop (client
            // gone or stream complete) is the cancellation signal.
            let watch = msg_tx.clone();
            let watch_cancel = cancel.clone();
            tokio::spawn(async move {
                watch.closed().await;
                watch_cancel.cancel();
            });

            let call = Arc::new(ServerCall {
                entry,
                request: Some(MessageValue::from_dynamic(msg)),
                request_header: Metadata::from_tonic(&meta).read_only_view(),
                header: Mutex::new(HeaderState {
                    buffered: Metadata::new(),
                    flushed: false,
                }),
                trailer: Metadata::new(),
                outbound: Some(OutboundHalf {
                    tx: Mutex::new(Some(msg_tx)),
                    flush_tx: Mutex::new(Some(flush_tx)),
                }),
                inbound: None,
                cancel,
            });
            let fallback = Arc::clone(&call);
            let task = run_call(&inner, call, |call, result| finalize_stream(call, result));
            inner.core.submit_or_else(task, move || {
                fallback.finish_stream(Err(RpcError::loop_closed()), false);
            });

            match flush_rx.await {
                Ok(md) => {
                    let mut response = tonic::Response::new(ReceiverStream::new(msg_rx));
                    *response.metadata_mut() = md;
                    Ok(response)
                }
                Err(_) => Err(Status::unavailable("event loop not running")),
            }
        })
    }
}

struct ClientStreamDispatch {
    inner: Arc<ServerInner>,
    entry: Arc<MethodEntry>,
}

impl tonic::server::ClientStreamingService<DynamicMessage> for ClientStreamDispatch {
    type Response = DynamicMessage;
    type Future = DispatchFuture<DynamicMessage>;

    fn call(&mut self, request: tonic::Request<Streaming<DynamicMessage>>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        let entry = Arc::clone(&self.entry);
        Box::pin(async move {
            let (meta, _ext, streaming) = request.into_parts();
            let (pull_tx, pull_rx) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            let _disconnect = cancel.clone().drop_guard();
            tokio::spawn(recv_pump(
                inner.core.clone(),
                streaming,
                pull_rx,
                cancel.clone(),
            ));

            let call = Arc::new(ServerCall {
                entry,
                request: None,
                request_header: Metadata::from_tonic(&meta).read_only_view(),
                header: Mutex::new(HeaderState {
                    buffered: Metadata::new(),
                    flushed: false,
                }),
                trailer: Metadata::new(),
                outbound: None,
                inbound: Some(InboundHalf { pull_tx }),
                cancel,
            });
            let (tx, rx) = oneshot::channel();
            let task = run_call(&inner, call, |call, result| finalize_single(call, result, tx));
            inner.core.submit_or_else(task, || {});
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Status::unavailable("event loop not running")),
            }
        })
    }
}

struct BidiDispatch {
    inner: Arc<ServerInner>,
    entry: Arc<MethodEntry>,
}

impl tonic::server::StreamingService<DynamicMessage> for BidiDispatch {
    type Response = DynamicMessage;
    type ResponseStream = ReceiverStream<Result<DynamicMessage, Status>>;
    type Future = DispatchFuture<Self::ResponseStream>;

    fn call(&mut self, request: tonic::Request<Streaming<DynamicMessage>>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        let entry = Arc::clone(&self.entry);
        Box::pin(async move {
            let (meta, _ext, streaming) = request.into_parts();
            let (pull_tx, pull_rx) = mpsc::unbounded_channel();
            let (msg_tx, msg_rx) = mpsc::channel(SEND_BUFFER);
            let (flush_tx, flush_rx) = oneshot::channel();
            let cancel = CancellationToken::new();

            let watch = msg_tx.clone();
            let watch_cancel = cancel.clone();
            tokio::spawn(async move {
                watch.closed().await;
                watch_cancel.cancel();
            });
            tokio::spawn(recv_pump(
                inner.core.clone(),
                streaming,
                pull_rx,
                cancel.clone(),
            ));

            let call = Arc::new(ServerCall {
                entry,
                request: None,
                request_header: Metadata::from_tonic(&meta).read_only_view(),
                header: Mutex::new(HeaderState {
                    buffered: Metadata::new(),
                    flushed: false,
                }),
                trailer: Metadata::new(),
                outbound: Some(OutboundHalf {
                    tx: Mutex::new(Some(msg_tx)),
                    flush_tx: Mutex::new(Some(flush_tx)),
                }),
                inbound: Some(InboundHalf { pull_tx }),
                cancel,
            });
            let fallback = Arc::clone(&call);
            let task = run_call(&inner, call, |call, result| finalize_stream(call, result));
            inner.core.submit_or_else(task, move || {
                fallback.finish_stream(Err(RpcError::loop_closed()), false);
            });

            match flush_rx.await {
                Ok(md) => {
                    let mut response = tonic::Response::new(ReceiverStream::new(msg_rx));
                    *response.metadata_mut() = md;
                    Ok(response)
                }
                Err(_) => Err(Status::unavailable("event loop not running")),
            }
        })
    }
}

/// Path-routed dynamic gRPC service covering every registered method plus
/// the optional reflection service.
#[derive(Clone)]
struct BridgeService {
    inner: Arc<ServerInner>,
}

impl Service<http::Request<Incoming>> for BridgeService {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Incoming>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        let path = req.uri().path().to_string();

        if path.starts_with(REFLECTION_PREFIX) {
            if let Some(reflection) = &inner.reflection {
                let mut service = lock(reflection).clone();
                return Box::pin(async move { service.call(req).await });
            }
        }

        let Some(entry) = inner.methods.get(&path).cloned() else {
            debug!(%path, "unimplemented method");
            return Box::pin(async move { Ok(unimplemented_response()) });
        };

        Box::pin(async move {
            let codec = DynamicCodec::server(entry.input.clone(), entry.output.clone());
            let mut grpc = Grpc::new(codec);
            let response = match entry.shape {
                MethodShape::Unary => grpc.unary(UnaryDispatch { inner, entry }, req).await,
                MethodShape::ServerStream => {
                    grpc.server_streaming(ServerStreamDispatch { inner, entry }, req)
                        .await
                }
                MethodShape::ClientStream => {
                    grpc.client_streaming(ClientStreamDispatch { inner, entry }, req)
                        .await
                }
                MethodShape::Bidi => grpc.streaming(BidiDispatch { inner, entry }, req).await,
            };
            Ok(response)
        })
    }
}

fn unimplemented_response() -> http::Response<Body> {
    let mut response = http::Response::new(Body::default());
    let headers = response.headers_mut();
    headers.insert(
        Status::GRPC_STATUS,
        (tonic::Code::Unimplemented as i32).into(),
    );
    headers.insert(
        http::header::CONTENT_TYPE,
        tonic::metadata::GRPC_CONTENT_TYPE,
    );
    response
}
