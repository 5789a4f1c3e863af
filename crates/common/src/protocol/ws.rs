// WebSocket frame types for the handoff subscription protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// All frame types exchanged over a subscription connection.
///
/// Close codes are the only other signalling surface after upgrade:
/// 4001 token expired, 4002 token invalid or already used, 4003 key revoked,
/// 4004 per-key connection limit, 4005 workspace at capacity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WsFrame {
    /// Server -> Client: sent once after a successful upgrade.
    Connected {
        connection_id: Uuid,
        /// Event names this connection will receive, per its key tier.
        events: Vec<String>,
        /// Path prefix this connection is scoped to (`/` = whole workspace).
        scope: String,
    },

    /// Server -> Client: one log-change event.
    ///
    /// Every recipient of a given logical event sees the same
    /// `{eventId, sequence}` pair, so observers can detect gaps.
    Event {
        event_id: Uuid,
        sequence: i64,
        event: String,
        path: String,
        data: Value,
    },

    /// Client -> Server: liveness probe.
    Ping,

    /// Server -> Client: reply to a ping.
    Pong,

    /// Server -> Client: echo for any unrecognized client frame.
    Ack { received: Value },
}

/// Close codes used when an upgrade or established connection is refused.
pub mod close_code {
    pub const TOKEN_EXPIRED: u16 = 4001;
    pub const TOKEN_INVALID: u16 = 4002;
    pub const KEY_REVOKED: u16 = 4003;
    pub const KEY_CONNECTION_LIMIT: u16 = 4004;
    pub const WORKSPACE_BUSY: u16 = 4005;
}

#[cfg(test)]
mod tests {
    use super::WsFrame;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn connected_frame_uses_camel_case_fields() {
        let frame = WsFrame::Connected {
            connection_id: Uuid::nil(),
            events: vec!["append.created".to_string()],
            scope: "/tasks".to_string(),
        };

        let value = serde_json::to_value(frame).expect("frame should serialize");
        assert_eq!(value["type"], "connected");
        assert!(value.get("connectionId").is_some());
        assert_eq!(value["scope"], "/tasks");
    }

    #[test]
    fn event_frame_carries_id_and_sequence() {
        let frame = WsFrame::Event {
            event_id: Uuid::nil(),
            sequence: 42,
            event: "task.created".to_string(),
            path: "/pr.md".to_string(),
            data: json!({ "appendId": "a5" }),
        };

        let value = serde_json::to_value(frame).expect("frame should serialize");
        assert_eq!(value["type"], "event");
        assert_eq!(value["sequence"], 42);
        assert!(value.get("eventId").is_some());
        assert_eq!(value["data"]["appendId"], "a5");
    }

    #[test]
    fn ping_round_trips_from_client_json() {
        let frame: WsFrame =
            serde_json::from_str(r#"{"type":"ping"}"#).expect("ping should deserialize");
        assert_eq!(frame, WsFrame::Ping);
    }

    #[test]
    fn ack_echoes_arbitrary_payloads() {
        let frame = WsFrame::Ack { received: json!({ "type": "mystery", "n": 1 }) };
        let value = serde_json::to_value(frame).expect("frame should serialize");
        assert_eq!(value["type"], "ack");
        assert_eq!(value["received"]["n"], 1);
    }
}
