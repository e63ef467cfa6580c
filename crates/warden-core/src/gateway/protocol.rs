//! Gateway wire protocol.
//!
//! Every message on the sandbox control channel is one of three JSON frames:
//! `req` (method, id, params), `res` (id, ok, payload|error) and `event`
//! (event name, payload). Inbound events of interest are lifted into the
//! [`GatewayEvent`] union so the connection manager dispatches through a
//! single entry point instead of ad-hoc payload digging.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Heartbeat status meaning "nothing to report"; such heartbeats are never
/// delivered to the user.
pub const HEARTBEAT_IDLE_STATUS: &str = "ok";

/// One frame on the gateway channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Method invocation (either direction; we only send these)
    Req {
        /// Locally generated correlation id
        id: String,
        /// Method name: `connect`, `chat.send`, `status`
        method: String,
        /// Method parameters
        #[serde(default)]
        params: Value,
    },
    /// Response correlated to a request by id
    Res {
        /// Matches the request id
        id: String,
        /// Whether the request succeeded
        #[serde(default)]
        ok: bool,
        /// Success payload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        /// Failure detail
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    /// Unsolicited server event
    Event {
        /// Event name
        event: String,
        /// Event payload
        #[serde(default)]
        payload: Value,
    },
}

/// Error detail inside a failed `res` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// Machine-readable code, e.g. `NOT_PAIRED`
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
    /// Free-form details (`details.requestId` carries the pending pairing id)
    #[serde(default)]
    pub details: Value,
}

impl WireError {
    /// The pending pairing request id, when the gateway reported one.
    pub fn pairing_request_id(&self) -> Option<String> {
        self.details
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Classified inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// `connect.challenge` — the server wants a signed assertion over `nonce`
    Challenge {
        /// Challenge nonce
        nonce: String,
    },
    /// Streaming partial chat content
    ChatDelta {
        /// Content fragment
        content: String,
        /// Run this fragment belongs to
        run_id: String,
    },
    /// Terminal chat content
    ChatFinal {
        /// Full response text
        content: String,
        /// Run this response belongs to
        run_id: String,
    },
    /// Terminal chat error
    ChatError {
        /// Error text
        message: String,
    },
    /// Agent-initiated heartbeat
    Heartbeat {
        /// Heartbeat status (`ok` means idle)
        status: String,
        /// User-facing preview text
        preview: String,
    },
    /// Scheduled job completed with a summary
    CronFinished {
        /// Job identifier
        job_id: String,
        /// User-facing summary
        summary: String,
    },
}

/// Lift a raw event frame into a [`GatewayEvent`], if it is one we care about.
pub fn classify_event(event: &str, payload: &Value) -> Option<GatewayEvent> {
    match event {
        "connect.challenge" => Some(GatewayEvent::Challenge {
            nonce: str_field(payload, "nonce"),
        }),
        "chat" => {
            let content = extract_content(payload.get("message")?.get("content"));
            let run_id = str_field(payload, "runId");
            match payload.get("state").and_then(Value::as_str)? {
                "delta" => Some(GatewayEvent::ChatDelta { content, run_id }),
                "final" => Some(GatewayEvent::ChatFinal { content, run_id }),
                "error" => Some(GatewayEvent::ChatError {
                    message: if content.is_empty() {
                        "agent error".to_string()
                    } else {
                        content
                    },
                }),
                _ => None,
            }
        }
        "heartbeat" => Some(GatewayEvent::Heartbeat {
            status: str_field(payload, "status"),
            preview: str_field(payload, "preview"),
        }),
        "cron" => {
            if payload.get("action").and_then(Value::as_str) != Some("finished") {
                return None;
            }
            Some(GatewayEvent::CronFinished {
                job_id: str_field(payload, "jobId"),
                summary: str_field(payload, "summary"),
            })
        }
        _ => None,
    }
}

/// Whether a heartbeat is worth delivering: non-empty preview and a status
/// other than the idle sentinel.
pub fn heartbeat_needs_delivery(status: &str, preview: &str) -> bool {
    !preview.trim().is_empty() && status != HEARTBEAT_IDLE_STATUS
}

fn str_field(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Chat content is either a plain string or an array of text blocks.
fn extract_content(raw: Option<&Value>) -> String {
    match raw {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_round_trip_the_wire_shape() {
        let req = Frame::Req {
            id: "chat-1".to_string(),
            method: "chat.send".to_string(),
            params: json!({"sessionKey": "main"}),
        };
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire["type"], "req");
        assert_eq!(wire["method"], "chat.send");

        let parsed: Frame = serde_json::from_str(
            r#"{"type":"res","id":"connect-1","ok":false,"error":{"code":"NOT_PAIRED","message":"device not paired","details":{"requestId":"req-9"}}}"#,
        )
        .unwrap();
        match parsed {
            Frame::Res { id, ok, error, .. } => {
                assert_eq!(id, "connect-1");
                assert!(!ok);
                let err = error.unwrap();
                assert_eq!(err.code.as_deref(), Some("NOT_PAIRED"));
                assert_eq!(err.pairing_request_id().as_deref(), Some("req-9"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn chat_states_classify() {
        let delta = classify_event(
            "chat",
            &json!({"state": "delta", "runId": "r1", "message": {"content": "par"}}),
        );
        assert_eq!(
            delta,
            Some(GatewayEvent::ChatDelta {
                content: "par".to_string(),
                run_id: "r1".to_string()
            })
        );

        let fin = classify_event(
            "chat",
            &json!({"state": "final", "runId": "r1", "message": {"content": [
                {"type": "text", "text": "hello "},
                {"type": "text", "text": "world"}
            ]}}),
        );
        assert_eq!(
            fin,
            Some(GatewayEvent::ChatFinal {
                content: "hello world".to_string(),
                run_id: "r1".to_string()
            })
        );

        let err = classify_event(
            "chat",
            &json!({"state": "error", "runId": "r1", "message": {"content": ""}}),
        );
        assert_eq!(
            err,
            Some(GatewayEvent::ChatError {
                message: "agent error".to_string()
            })
        );
    }

    #[test]
    fn challenge_carries_nonce() {
        let ev = classify_event("connect.challenge", &json!({"nonce": "abc123"}));
        assert_eq!(
            ev,
            Some(GatewayEvent::Challenge {
                nonce: "abc123".to_string()
            })
        );
    }

    #[test]
    fn heartbeat_suppression_rules() {
        assert!(!heartbeat_needs_delivery("ok", "all systems nominal"));
        assert!(!heartbeat_needs_delivery("delivered", "  "));
        assert!(heartbeat_needs_delivery("delivered", "your build finished"));
    }

    #[test]
    fn only_finished_cron_events_classify() {
        assert_eq!(
            classify_event("cron", &json!({"action": "started", "jobId": "j1"})),
            None
        );
        assert_eq!(
            classify_event(
                "cron",
                &json!({"action": "finished", "jobId": "j1", "summary": "done"})
            ),
            Some(GatewayEvent::CronFinished {
                job_id: "j1".to_string(),
                summary: "done".to_string()
            })
        );
    }

    #[test]
    fn unknown_events_are_ignored() {
        assert_eq!(classify_event("health", &json!({})), None);
    }
}
