#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use looprpc_core::{
    compile_proto_files, ChannelHandle, ClientHandle, ClientOptions, DialOptions, MessageValue,
    ModuleOptions, Promise, RpcError, RpcModule, ScriptLoop, ServerBuilder, ServerHandle,
    StreamItem, StreamReader,
};
use prost_reflect::{DescriptorPool, Value};

/// Schema used by all integration tests: one service covering the four call
/// shapes, split across two files so reflection has a dependency to chase.
const COMMON_PROTO: &str = r#"syntax = "proto3";
package echo.v1;

message Payload {
  string data = 1;
}
"#;

const ECHO_PROTO: &str = r#"syntax = "proto3";
package echo.v1;

import "common.proto";

message EchoRequest {
  string message = 1;
  Payload payload = 2;
}

message EchoResponse {
  string message = 1;
}

service EchoService {
  rpc Echo(EchoRequest) returns (EchoResponse);
  rpc Expand(EchoRequest) returns (stream EchoResponse);
  rpc Collect(stream EchoRequest) returns (EchoResponse);
  rpc Chat(stream EchoRequest) returns (stream EchoResponse);
}
"#;

pub fn test_pool() -> DescriptorPool {
    let dir = tempfile::tempdir().expect("tempdir");
    let common = dir.path().join("common.proto");
    let echo = dir.path().join("echo.proto");
    std::fs::File::create(&common)
        .and_then(|mut f| f.write_all(COMMON_PROTO.as_bytes()))
        .expect("write common.proto");
    std::fs::File::create(&echo)
        .and_then(|mut f| f.write_all(ECHO_PROTO.as_bytes()))
        .expect("write echo.proto");
    compile_proto_files(&[echo], &[dir.path().to_path_buf()]).expect("compile test protos")
}

/// A served bridge plus a second module dialed back at it, sharing one loop.
pub struct Harness {
    pub pool: DescriptorPool,
    pub channel: ChannelHandle,
    pub server: ServerHandle,
    pub client_module: RpcModule,
    pub server_module: RpcModule,
    pub looper: ScriptLoop,
    pub runtime: tokio::runtime::Runtime,
}

impl Harness {
    pub fn start(configure: impl FnOnce(&mut ServerBuilder, &DescriptorPool)) -> Harness {
        Harness::start_with_reflection(false, configure)
    }

    pub fn start_with_reflection(
        reflection: bool,
        configure: impl FnOnce(&mut ServerBuilder, &DescriptorPool),
    ) -> Harness {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime");
        let looper = ScriptLoop::start().expect("loop");
        let pool = test_pool();

        let (server_module, server, channel, client_module) = {
            // Channel construction needs the runtime context.
            let _guard = runtime.enter();

            // The serving module never dials out; its mandatory default
            // channel is a lazy placeholder.
            let server_module = RpcModule::new(ModuleOptions {
                channel: Some(
                    tonic::transport::Channel::from_static("http://127.0.0.1:1").connect_lazy(),
                ),
                pool: Some(pool.clone()),
                event_loop: Some(Arc::new(looper.handle())),
                runtime: Some(runtime.handle().clone()),
            })
            .expect("server module");
            if reflection {
                server_module.enable_reflection();
            }

            let mut builder = server_module.create_server();
            configure(&mut builder, &pool);
            let server = builder.start("127.0.0.1:0").expect("server start");

            let channel = server_module
                .dial(
                    &server.target(),
                    &DialOptions {
                        insecure: true,
                        ..Default::default()
                    },
                )
                .expect("dial");
            let client_module = RpcModule::new(ModuleOptions {
                channel: Some(channel.channel().expect("channel")),
                pool: Some(pool.clone()),
                event_loop: Some(Arc::new(looper.handle())),
                runtime: Some(runtime.handle().clone()),
            })
            .expect("client module");
            (server_module, server, channel, client_module)
        };

        Harness {
            pool,
            channel,
            server,
            client_module,
            server_module,
            looper,
            runtime,
        }
    }

    pub fn client(&self) -> ClientHandle {
        self.client_module
            .create_client("echo.v1.EchoService", ClientOptions::default())
            .expect("client")
    }

    pub fn client_with(&self, opts: ClientOptions) -> ClientHandle {
        self.client_module
            .create_client("echo.v1.EchoService", opts)
            .expect("client")
    }

    pub fn request(&self, message: &str) -> MessageValue {
        let desc = self
            .pool
            .get_message_by_name("echo.v1.EchoRequest")
            .expect("request descriptor");
        let msg = MessageValue::new(desc);
        msg.set("message", Value::String(message.into())).unwrap();
        msg
    }

    pub fn response(&self, message: &str) -> MessageValue {
        let desc = self
            .pool
            .get_message_by_name("echo.v1.EchoResponse")
            .expect("response descriptor");
        let msg = MessageValue::new(desc);
        msg.set("message", Value::String(message.into())).unwrap();
        msg
    }

    pub fn payload(&self, data: &str) -> MessageValue {
        let desc = self
            .pool
            .get_message_by_name("echo.v1.Payload")
            .expect("payload descriptor");
        let msg = MessageValue::new(desc);
        msg.set("data", Value::String(data.into())).unwrap();
        msg
    }
}

/// Build an `echo.v1.EchoResponse` from any pool holding the test schema;
/// handlers capture a pool clone and use this.
pub fn response_msg(pool: &DescriptorPool, text: &str) -> MessageValue {
    let desc = pool
        .get_message_by_name("echo.v1.EchoResponse")
        .expect("response descriptor");
    let msg = MessageValue::new(desc);
    msg.set("message", Value::String(text.into())).unwrap();
    msg
}

pub const WAIT: Duration = Duration::from_secs(10);

pub fn wait_ok<T: Clone + Send + 'static>(promise: &Promise<T>) -> T {
    promise
        .wait(WAIT)
        .expect("promise settled in time")
        .expect("promise resolved")
}

pub fn wait_err<T: Clone + Send + 'static + std::fmt::Debug>(promise: &Promise<T>) -> RpcError {
    promise
        .wait(WAIT)
        .expect("promise settled in time")
        .expect_err("promise rejected")
}

/// Drain a stream reader until the done marker, collecting `message` fields.
pub fn recv_all(reader: &StreamReader) -> Vec<String> {
    let mut out = Vec::new();
    loop {
        let item: StreamItem = wait_ok(&reader.recv());
        if item.done {
            return out;
        }
        let value = item.value.expect("non-done item carries a message");
        out.push(value.get_string("message").unwrap_or_default());
    }
}
