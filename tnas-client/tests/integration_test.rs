//! Integration tests for tnas-client
//!
//! These tests run the real session state machine against an in-process
//! stub of the TrueNAS middleware: a WebSocket server that speaks just
//! enough JSON-RPC to authenticate and answer queries.

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use tnas_client::{ClientError, ConnState, Session, SessionConfig, TruenasClient};

/// Spawn a stub middleware that accepts any API key and answers a small set
/// of methods. Returns the ws:// URL to connect to.
async fn spawn_stub_middleware(accept_auth: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };

                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Text(text) => {
                            let frame: Value = match serde_json::from_str(&text) {
                                Ok(frame) => frame,
                                Err(_) => continue,
                            };
                            let id = frame["id"].clone();
                            let method = frame["method"].as_str().unwrap_or_default();

                            let reply = match method {
                                "auth.login_with_api_key" if accept_auth => {
                                    json!({"jsonrpc": "2.0", "id": id, "result": true})
                                }
                                "auth.login_with_api_key" => json!({
                                    "jsonrpc": "2.0",
                                    "id": id,
                                    "error": {"code": 13, "message": "invalid API key"}
                                }),
                                "core.ping" => {
                                    json!({"jsonrpc": "2.0", "id": id, "result": "pong"})
                                }
                                "pool.dataset.query" => {
                                    json!({"jsonrpc": "2.0", "id": id, "result": []})
                                }
                                _ => json!({
                                    "jsonrpc": "2.0",
                                    "id": id,
                                    "error": {"code": -32601, "message": "method not found"}
                                }),
                            };

                            if ws
                                .send(Message::Text(reply.to_string().into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Message::Ping(payload) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    format!("ws://{addr}")
}

#[tokio::test]
async fn test_session_authenticates_and_calls() {
    let url = spawn_stub_middleware(true).await;

    let session = Session::connect(SessionConfig::new(url, "1-test-key"))
        .await
        .unwrap();

    assert_eq!(session.state(), ConnState::Authenticated);

    let pong = session.call("core.ping", json!([])).await.unwrap();
    assert_eq!(pong, json!("pong"));
}

#[tokio::test]
async fn test_rejected_api_key_fails_startup() {
    let url = spawn_stub_middleware(false).await;

    let result = Session::connect(SessionConfig::new(url, "1-bad-key")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_concurrent_calls_multiplex_by_request_id() {
    let url = spawn_stub_middleware(true).await;
    let session = Session::connect(SessionConfig::new(url, "1-test-key"))
        .await
        .unwrap();

    let mut handles = vec![];
    for _ in 0..16 {
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            session.call("core.ping", json!([])).await
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, json!("pong"));
    }
}

#[tokio::test]
async fn test_unknown_method_is_a_permanent_fault() {
    let url = spawn_stub_middleware(true).await;
    let session = Session::connect(SessionConfig::new(url, "1-test-key"))
        .await
        .unwrap();

    let err = session
        .call("no.such.method", json!([]))
        .await
        .expect_err("unknown method should fault");
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_client_reports_missing_dataset_as_not_found() {
    let url = spawn_stub_middleware(true).await;
    let session = Session::connect(SessionConfig::new(url, "1-test-key"))
        .await
        .unwrap();
    let client = TruenasClient::new(session);

    let err = client
        .dataset_get("tank/csi/missing")
        .await
        .expect_err("empty query result should be NotFound");
    assert!(matches!(err, ClientError::NotFound(_)));
}

#[tokio::test]
async fn test_client_rejects_malformed_names_locally() {
    let url = spawn_stub_middleware(true).await;
    let session = Session::connect(SessionConfig::new(url, "1-test-key"))
        .await
        .unwrap();
    let client = TruenasClient::new(session);

    // Never reaches the backend: validation fails first.
    let err = client
        .dataset_get("tank/../etc")
        .await
        .expect_err("traversal-style names must be rejected");
    assert!(matches!(err, ClientError::InvalidName(_)));
}
