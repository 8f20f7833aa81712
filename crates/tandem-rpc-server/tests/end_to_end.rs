//! In-process client/server round trips over `tokio::io::duplex` pipes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use tandem_rpc_client::{ClientConfig, RpcClient};
use tandem_rpc_server::{HandlerOutcome, RpcServer, StateTransition};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn connect(server: &RpcServer) -> Arc<RpcClient> {
    init_tracing();
    let (near, far) = tokio::io::duplex(4096);
    server.accept(far);
    let client = Arc::new(RpcClient::from_stream(near, ClientConfig::default()));
    client.start_listening();
    client
}

#[derive(Deserialize)]
struct HelloParams {
    custom: String,
}

#[tokio::test]
async fn test_typed_call_round_trip() {
    let server = RpcServer::builder()
        .typed_handler::<HelloParams, _>("test.hello", |params| {
            Box::pin(async move {
                assert_eq!(params.custom, "hello");
                Ok(HandlerOutcome::result(json!("response from server")))
            })
        })
        .build();
    let client = connect(&server);

    let response = client
        .call("test.hello", Some(json!({"custom": "hello"})))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.id, Some(1));
    assert!(response.is_success());
    assert_eq!(
        response.result_as::<String>().unwrap().unwrap(),
        "response from server"
    );

    client.close().await.unwrap();
    server.close_all().await;
}

#[tokio::test]
async fn test_unknown_method_call_and_notification() {
    let server = RpcServer::builder()
        .handler_fn("known", |_| {
            Box::pin(async { Ok(HandlerOutcome::result(json!(null))) })
        })
        .build();
    let client = connect(&server);

    let response = client.call("missing", None).await.unwrap().unwrap();
    assert_eq!(response.id, Some(1));
    let error = response.error.unwrap();
    assert_eq!(error.code, -32601);
    assert!(error.message.contains("missing"));

    // Unknown notifications produce no reply at all; the next call's
    // response must be the very next message the client sees.
    client.notify("also.missing", None).await.unwrap();
    let response = client.call("known", None).await.unwrap().unwrap();
    assert_eq!(response.id, Some(2));
    assert!(response.is_success());

    client.close().await.unwrap();
    server.close_all().await;
}

#[tokio::test]
async fn test_typed_decode_failure_does_not_stop_fanout() {
    let second_ran = Arc::new(AtomicBool::new(false));
    let flag = second_ran.clone();

    let server = RpcServer::builder()
        .typed_handler::<HelloParams, _>("m", |params| {
            Box::pin(async move { Ok(HandlerOutcome::result(json!(params.custom))) })
        })
        .handler_fn("m", move |_| {
            let flag = flag.clone();
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(HandlerOutcome::result(json!("untyped ok")))
            })
        })
        .build();
    let client = connect(&server);

    // Params that don't fit HelloParams: the typed entry answers
    // InvalidParams naming its type, the untyped entry still runs.
    let response = client.call("m", Some(json!(42))).await.unwrap().unwrap();
    let error = response.error.unwrap();
    assert_eq!(error.code, -32602);
    assert!(error.message.contains("HelloParams"));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(second_ran.load(Ordering::SeqCst));

    client.close().await.unwrap();
    server.close_all().await;
}

#[tokio::test]
async fn test_context_stack_push_and_pop() {
    let server = RpcServer::builder()
        .handler_fn("begin", |_| {
            Box::pin(async {
                Ok(HandlerOutcome::result(json!("begun")).with_transition(
                    StateTransition::push(vec![("next".to_string(), None)]),
                ))
            })
        })
        .handler_fn("next", |_| {
            Box::pin(async {
                Ok(HandlerOutcome::result(json!("done"))
                    .with_transition(StateTransition::pop()))
            })
        })
        .handler_fn("sibling", |_| {
            Box::pin(async { Ok(HandlerOutcome::result(json!("should not run"))) })
        })
        .allowed_methods(["begin", "sibling"])
        .build();
    let client = connect(&server);

    // Root frame: "begin" callable, pushing a frame that only allows "next".
    let response = client.call("begin", None).await.unwrap().unwrap();
    assert!(response.is_success());

    // "sibling" was callable at the root but is not in the pushed frame.
    let response = client.call("sibling", None).await.unwrap().unwrap();
    assert_eq!(response.error.unwrap().code, -32601);

    // "next" pops, restoring the root frame.
    let response = client.call("next", None).await.unwrap().unwrap();
    assert!(response.is_success());

    let response = client.call("sibling", None).await.unwrap().unwrap();
    assert!(response.is_success());
    assert_eq!(
        response.result_as::<String>().unwrap().unwrap(),
        "should not run"
    );

    // And "next" is no longer reachable from the root.
    let response = client.call("next", None).await.unwrap().unwrap();
    assert_eq!(response.error.unwrap().code, -32601);

    client.close().await.unwrap();
    server.close_all().await;
}

#[tokio::test]
async fn test_handler_failure_becomes_internal_error() {
    let server = RpcServer::builder()
        .handler_fn("fragile", |_| {
            Box::pin(async { Err("disk on fire".into()) })
        })
        .build();
    let client = connect(&server);

    let response = client.call("fragile", None).await.unwrap().unwrap();
    let error = response.error.unwrap();
    assert_eq!(error.code, -32603);
    assert!(error.message.contains("method 'fragile' failed: disk on fire"));

    client.close().await.unwrap();
    server.close_all().await;
}

#[tokio::test]
async fn test_notification_transition_applies() {
    let server = RpcServer::builder()
        .handler_fn("arm", |_| {
            Box::pin(async {
                Ok(HandlerOutcome::result(json!(null)).with_transition(
                    StateTransition::push(vec![("fire".to_string(), None)]),
                ))
            })
        })
        .handler_fn("fire", |_| {
            Box::pin(async { Ok(HandlerOutcome::result(json!("fired"))) })
        })
        .allowed_methods(["arm"])
        .build();
    let client = connect(&server);

    // "fire" is gated behind the frame pushed by the "arm" notification.
    let response = client.call("fire", None).await.unwrap().unwrap();
    assert_eq!(response.error.unwrap().code, -32601);

    client.notify("arm", None).await.unwrap();
    // Dispatch is sequential per connection, so the call below is only
    // processed after the notification's transition took effect.
    let response = client.call("fire", None).await.unwrap().unwrap();
    assert!(response.is_success());

    client.close().await.unwrap();
    server.close_all().await;
}

#[tokio::test]
async fn test_close_releases_dispatch_resources() {
    init_tracing();
    let server = RpcServer::builder().build();
    let (_near, far) = tokio::io::duplex(4096);
    let connection = server.accept(far);

    server.close_all().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The dispatch task and the connection list were the only other
    // holders; once closed, the caller's handle must be the last one.
    assert_eq!(Arc::strong_count(&connection), 1);
}

#[tokio::test]
async fn test_peer_disconnect_prunes_connections() {
    init_tracing();
    let server = RpcServer::builder().build();
    let (near, far) = tokio::io::duplex(4096);
    let _connection = server.accept(far);
    assert_eq!(server.connection_count(), 1);

    drop(near);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_server_can_call_back_into_client() {
    init_tracing();
    let server = RpcServer::builder().build();
    let (near, far) = tokio::io::duplex(4096);
    let connection = server.accept(far);

    let client = Arc::new(RpcClient::from_stream(near, ClientConfig::default()));
    client.on_request({
        let client = client.clone();
        move |request| {
            let client = client.clone();
            tokio::spawn(async move {
                let id = request.id.unwrap();
                client.reply(id, json!("pong")).await.unwrap();
            });
        }
    });
    client.start_listening();

    let response = connection.call("ping", None).await.unwrap().unwrap();
    assert_eq!(response.result_as::<String>().unwrap().unwrap(), "pong");

    client.close().await.unwrap();
    server.close_all().await;
}
