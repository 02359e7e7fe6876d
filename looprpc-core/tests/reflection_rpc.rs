mod common;

use common::{response_msg, wait_err, wait_ok, Harness};
use looprpc_core::{code, HandlerReply, ServiceHandlers};

fn echo_handlers(pool: &prost_reflect::DescriptorPool) -> ServiceHandlers {
    let pool = pool.clone();
    ServiceHandlers::new().unary("Echo", move |_req, _call| {
        Ok(HandlerReply::Ready(Some(response_msg(&pool, "ok"))))
    })
}

#[test]
fn list_services_includes_registered_and_reflection_services() {
    let harness = Harness::start_with_reflection(true, |builder, pool| {
        builder
            .add_service("echo.v1.EchoService", echo_handlers(pool))
            .unwrap();
    });

    let reflection = harness
        .client_module
        .create_reflection_client_on(harness.channel.channel().unwrap());
    let services = wait_ok(&reflection.list_services());
    assert!(services.contains(&"echo.v1.EchoService".to_string()));
    assert!(services
        .iter()
        .any(|s| s.starts_with("grpc.reflection.v1")));
}

#[test]
fn describe_service_projects_methods_with_streaming_flags() {
    let harness = Harness::start_with_reflection(true, |builder, pool| {
        builder
            .add_service("echo.v1.EchoService", echo_handlers(pool))
            .unwrap();
    });

    let reflection = harness
        .client_module
        .create_reflection_client_on(harness.channel.channel().unwrap());
    let description = wait_ok(&reflection.describe_service("echo.v1.EchoService"));
    assert_eq!(description.name, "echo.v1.EchoService");
    assert_eq!(description.methods.len(), 4);

    let by_name = |name: &str| {
        description
            .methods
            .iter()
            .find(|m| m.name == name)
            .unwrap_or_else(|| panic!("missing method {name}"))
            .clone()
    };
    let echo = by_name("Echo");
    assert!(!echo.client_streaming && !echo.server_streaming);
    assert_eq!(echo.full_method, "/echo.v1.EchoService/Echo");
    assert_eq!(echo.input_type, "echo.v1.EchoRequest");

    let expand = by_name("Expand");
    assert!(!expand.client_streaming && expand.server_streaming);
    let collect = by_name("Collect");
    assert!(collect.client_streaming && !collect.server_streaming);
    let chat = by_name("Chat");
    assert!(chat.client_streaming && chat.server_streaming);
}

#[test]
fn describe_type_resolves_transitive_file_dependencies() {
    let harness = Harness::start_with_reflection(true, |builder, pool| {
        builder
            .add_service("echo.v1.EchoService", echo_handlers(pool))
            .unwrap();
    });

    let reflection = harness
        .client_module
        .create_reflection_client_on(harness.channel.channel().unwrap());
    // EchoRequest lives in echo.proto and references Payload from
    // common.proto; resolving it exercises the dependency-fetch loop.
    let description = wait_ok(&reflection.describe_type("echo.v1.EchoRequest"));
    assert_eq!(description.name, "echo.v1.EchoRequest");

    let payload = description
        .fields
        .iter()
        .find(|f| f.name == "payload")
        .expect("payload field");
    assert_eq!(payload.kind, "message");
    assert_eq!(payload.message_type.as_deref(), Some("echo.v1.Payload"));

    let message = description
        .fields
        .iter()
        .find(|f| f.name == "message")
        .expect("message field");
    assert_eq!(message.kind, "string");
    assert!(message.default_value.is_none());
}

#[test]
fn describe_type_on_a_service_reports_kind_mismatch() {
    let harness = Harness::start_with_reflection(true, |builder, pool| {
        builder
            .add_service("echo.v1.EchoService", echo_handlers(pool))
            .unwrap();
    });

    let reflection = harness
        .client_module
        .create_reflection_client_on(harness.channel.channel().unwrap());
    let err = wait_err(&reflection.describe_type("echo.v1.EchoService"));
    assert_eq!(err.code, code::INVALID_ARGUMENT);
    assert!(err.message.contains("not a message type"));

    let err = wait_err(&reflection.describe_service("echo.v1.EchoRequest"));
    assert_eq!(err.code, code::INVALID_ARGUMENT);
    assert!(err.message.contains("not a service"));
}

#[test]
fn unknown_symbol_fails() {
    let harness = Harness::start_with_reflection(true, |builder, pool| {
        builder
            .add_service("echo.v1.EchoService", echo_handlers(pool))
            .unwrap();
    });

    let reflection = harness
        .client_module
        .create_reflection_client_on(harness.channel.channel().unwrap());
    let err = wait_err(&reflection.describe_type("echo.v1.NoSuchThing"));
    assert_ne!(err.code, code::OK);
}

#[test]
fn reflection_disabled_server_rejects_reflection_calls() {
    let harness = Harness::start(|builder, pool| {
        builder
            .add_service("echo.v1.EchoService", echo_handlers(pool))
            .unwrap();
    });

    let reflection = harness
        .client_module
        .create_reflection_client_on(harness.channel.channel().unwrap());
    let err = wait_err(&reflection.list_services());
    assert_eq!(err.code, code::UNIMPLEMENTED);
}
