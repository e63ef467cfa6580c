//! End-to-end gateway tests against an in-process mock gateway.
//!
//! The mock speaks the real wire protocol: it issues a `connect.challenge`,
//! verifies the signed device assertion byte-for-byte, answers `chat.send`
//! with a delta and a final, and can push heartbeat events after connect.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use warden_core::config::CoreConfig;
use warden_core::container::ContainerManager;
use warden_core::gateway::protocol::Frame;
use warden_core::gateway::ConnectionRegistry;
use warden_core::identity::IdentityStore;
use warden_core::outbound::{OutboundRoute, OutboundSource};
use warden_core::queue::TurnTransport;

const TEST_TOKEN: &str = "test-token";

/// Gateway double: accepts connections, runs the challenge handshake, echoes
/// chat, pushes the given events after each successful connect.
async fn spawn_mock_gateway(push_after_connect: Vec<Frame>) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicUsize::new(0));
    let accepts_handle = accepts.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            accepts_handle.fetch_add(1, Ordering::SeqCst);
            let push = push_after_connect.clone();
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let nonce = "nonce-12345";
                let challenge = Frame::Event {
                    event: "connect.challenge".to_string(),
                    payload: json!({ "nonce": nonce }),
                };
                ws.send(frame_text(&challenge)).await.unwrap();

                while let Some(Ok(message)) = ws.next().await {
                    let text = match message {
                        tokio_tungstenite::tungstenite::Message::Text(text) => text,
                        tokio_tungstenite::tungstenite::Message::Close(_) => break,
                        _ => continue,
                    };
                    let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                        continue;
                    };
                    let Frame::Req { id, method, params } = frame else {
                        continue;
                    };
                    match method.as_str() {
                        "connect" => {
                            let response = if verify_connect(&params, nonce) {
                                Frame::Res {
                                    id,
                                    ok: true,
                                    payload: Some(json!({
                                        "policy": { "tickIntervalMs": 60000 }
                                    })),
                                    error: None,
                                }
                            } else {
                                Frame::Res {
                                    id,
                                    ok: false,
                                    payload: None,
                                    error: Some(serde_json::from_value(json!({
                                        "code": "UNAUTHORIZED",
                                        "message": "bad signature"
                                    }))
                                    .unwrap()),
                                }
                            };
                            let authenticated = matches!(response, Frame::Res { ok: true, .. });
                            ws.send(frame_text(&response)).await.unwrap();
                            if authenticated {
                                for event in &push {
                                    ws.send(frame_text(event)).await.unwrap();
                                }
                            }
                        }
                        "chat.send" => {
                            let message = params["message"].as_str().unwrap_or_default().to_string();
                            ws.send(frame_text(&Frame::Res {
                                id,
                                ok: true,
                                payload: Some(json!({})),
                                error: None,
                            }))
                            .await
                            .unwrap();
                            ws.send(frame_text(&Frame::Event {
                                event: "chat".to_string(),
                                payload: json!({
                                    "state": "delta",
                                    "runId": "run-1",
                                    "message": { "content": "thinking... " },
                                }),
                            }))
                            .await
                            .unwrap();
                            ws.send(frame_text(&Frame::Event {
                                event: "chat".to_string(),
                                payload: json!({
                                    "state": "final",
                                    "runId": "run-1",
                                    "message": { "content": format!("echo: {}", message) },
                                }),
                            }))
                            .await
                            .unwrap();
                        }
                        "status" => {
                            ws.send(frame_text(&Frame::Res {
                                id,
                                ok: true,
                                payload: Some(json!({})),
                                error: None,
                            }))
                            .await
                            .unwrap();
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    (port, accepts)
}

fn frame_text(frame: &Frame) -> tokio_tungstenite::tungstenite::Message {
    tokio_tungstenite::tungstenite::Message::Text(serde_json::to_string(frame).unwrap())
}

/// Check the signed assertion exactly the way a real gateway would.
fn verify_connect(params: &Value, nonce: &str) -> bool {
    let device = &params["device"];
    if device["nonce"].as_str() != Some(nonce) {
        return false;
    }
    if params["auth"]["token"].as_str() != Some(TEST_TOKEN) {
        return false;
    }

    let scopes: Vec<String> = params["scopes"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let payload = format!(
        "v2|{}|{}|{}|{}|{}|{}|{}|{}",
        device["id"].as_str().unwrap_or_default(),
        params["client"]["id"].as_str().unwrap_or_default(),
        params["client"]["mode"].as_str().unwrap_or_default(),
        params["role"].as_str().unwrap_or_default(),
        scopes.join(","),
        device["signedAt"].as_i64().unwrap_or_default(),
        TEST_TOKEN,
        nonce,
    );

    let public: [u8; 32] = match URL_SAFE_NO_PAD
        .decode(device["publicKey"].as_str().unwrap_or_default())
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
    {
        Some(bytes) => bytes,
        None => return false,
    };
    let signature: [u8; 64] = match URL_SAFE_NO_PAD
        .decode(device["signature"].as_str().unwrap_or_default())
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
    {
        Some(bytes) => bytes,
        None => return false,
    };
    let Ok(verifying) = VerifyingKey::from_bytes(&public) else {
        return false;
    };
    verifying
        .verify(payload.as_bytes(), &Signature::from_bytes(&signature))
        .is_ok()
}

fn build_registry(data_dir: &std::path::Path, idle_timeout: Duration) -> ConnectionRegistry {
    let token = SecretString::from(TEST_TOKEN.to_string());
    let mut config = CoreConfig::new(token.clone(), data_dir);
    config.connect_timeout = Duration::from_secs(5);
    config.idle_timeout = idle_timeout;
    let containers = Arc::new(
        ContainerManager::new(config.sandbox_image.clone(), token).expect("docker client"),
    );
    ConnectionRegistry::new(config, IdentityStore::new(data_dir), containers)
}

struct RecordingRoute {
    delivered: Arc<Mutex<Vec<(String, OutboundSource)>>>,
}

#[async_trait::async_trait]
impl OutboundRoute for RecordingRoute {
    async fn deliver(&self, _sandbox_id: &str, text: &str, source: OutboundSource) {
        self.delivered.lock().await.push((text.to_string(), source));
    }
}

#[tokio::test]
async fn handshake_and_turn_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let (port, accepts) = spawn_mock_gateway(Vec::new()).await;
    let registry = build_registry(tmp.path(), Duration::from_secs(1800));

    let response = registry
        .run_turn("sb-1", port, None, "hello gateway", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(response, "echo: hello gateway");
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
    assert_eq!(registry.connection_count(), 1);
}

#[tokio::test]
async fn rapid_get_or_create_yields_one_connection() {
    let tmp = tempfile::tempdir().unwrap();
    let (port, accepts) = spawn_mock_gateway(Vec::new()).await;
    let registry = build_registry(tmp.path(), Duration::from_secs(1800));

    let (first, second) = tokio::join!(
        registry.get_or_create("sb-1", port, None),
        registry.get_or_create("sb-1", port, None),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
    assert_eq!(registry.connection_count(), 1);
}

#[tokio::test]
async fn heartbeats_route_per_suppression_rules() {
    let tmp = tempfile::tempdir().unwrap();
    let (port, _accepts) = spawn_mock_gateway(vec![
        Frame::Event {
            event: "heartbeat".to_string(),
            payload: json!({ "status": "ok", "reason": "tick", "preview": "all good" }),
        },
        Frame::Event {
            event: "heartbeat".to_string(),
            payload: json!({ "status": "delivered", "reason": "task", "preview": "build finished" }),
        },
        Frame::Event {
            event: "cron".to_string(),
            payload: json!({ "action": "finished", "jobId": "job-1", "summary": "backup complete" }),
        },
    ])
    .await;
    let registry = build_registry(tmp.path(), Duration::from_secs(1800));

    let delivered = Arc::new(Mutex::new(Vec::new()));
    registry.set_outbound(
        "sb-1",
        Arc::new(RecordingRoute {
            delivered: delivered.clone(),
        }),
    );
    registry.get_or_create("sb-1", port, None).await.unwrap();

    for _ in 0..50 {
        if delivered.lock().await.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let delivered = delivered.lock().await.clone();
    assert_eq!(
        delivered,
        vec![
            ("build finished".to_string(), OutboundSource::Heartbeat),
            ("backup complete".to_string(), OutboundSource::Cron),
        ]
    );
}

#[tokio::test]
async fn idle_connections_are_swept() {
    let tmp = tempfile::tempdir().unwrap();
    let (port, _accepts) = spawn_mock_gateway(Vec::new()).await;
    let registry = build_registry(tmp.path(), Duration::from_millis(100));

    registry.get_or_create("sb-1", port, None).await.unwrap();
    assert_eq!(registry.connection_count(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    registry.sweep_idle().await;
    assert_eq!(registry.connection_count(), 0);
}

#[tokio::test]
async fn turn_times_out_without_a_terminal_event() {
    let tmp = tempfile::tempdir().unwrap();
    let (port, _accepts) = spawn_mock_gateway(Vec::new()).await;
    let registry = build_registry(tmp.path(), Duration::from_secs(1800));
    registry.get_or_create("sb-1", port, None).await.unwrap();

    let err = registry
        .run_turn("sb-1", port, None, "hello", Duration::from_millis(0))
        .await
        .unwrap_err();
    assert!(matches!(err, warden_core::Error::TurnTimeout));
}
