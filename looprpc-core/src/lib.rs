//! gRPC client and server surface for an embedded, single-threaded script
//! runtime.
//!
//! The crate is a concurrency and marshalling bridge: script-visible objects
//! (clients, servers, metadata, status errors, promises) live on one
//! dedicated loop thread, while all transport I/O runs on a tokio worker
//! runtime. Background workers never touch script state directly; every
//! crossing back onto the loop goes through the fallible `submit` of an
//! [`event_loop::EventLoop`].
//!
//! Entry point: [`module::RpcModule`], the script-global object exposing
//! `create_client`, `create_server`, `create_reflection_client`,
//! `enable_reflection`, and `dial`.

pub mod call_options;
pub mod client;
pub mod codec;
pub mod connection;
pub mod event_loop;
pub mod message;
pub mod metadata;
pub mod module;
pub mod options;
pub mod promise;
pub mod reflection;
pub mod server;
pub mod status;

pub use call_options::{AbortController, AbortSignal, CallOptions};
pub use client::{
    BidiCall, ClientHandle, ClientMethod, ClientOptions, ClientStreamCall, MethodShape,
    StreamItem, StreamReader, UnaryInterceptor, UnaryInvoker, UnaryPayload,
};
pub use connection::{ChannelHandle, DialOptions};
pub use event_loop::{EventLoop, LoopClosed, LoopTask, ScriptLoop};
pub use message::MessageValue;
pub use metadata::Metadata;
pub use module::{compile_proto_files, ModuleOptions, RpcModule};
pub use promise::{Completer, Promise};
pub use reflection::{ReflectionClient, ServiceDescription, TypeDescription};
pub use server::{
    Handler, HandlerReply, HandlerResult, ServerBuilder, ServerCall, ServerHandle,
    ServerInterceptor, ServerNext, ServiceHandlers,
};
pub use status::{code, RpcError};
