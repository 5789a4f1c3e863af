use handoff_common::protocol::ws::{close_code, WsFrame};
use uuid::Uuid;

const WS_MOD_SOURCE: &str = include_str!("../src/ws/mod.rs");
const WS_TOKEN_SOURCE: &str = include_str!("../src/ws/token.rs");
const WS_REGISTRY_SOURCE: &str = include_str!("../src/ws/registry.rs");

#[test]
fn websocket_contract_close_codes_are_stable() {
    assert_eq!(close_code::TOKEN_EXPIRED, 4001);
    assert_eq!(close_code::TOKEN_INVALID, 4002);
    assert_eq!(close_code::KEY_REVOKED, 4003);
    assert_eq!(close_code::KEY_CONNECTION_LIMIT, 4004);
    assert_eq!(close_code::WORKSPACE_BUSY, 4005);

    // reused tokens close as invalid, with the distinct reason string
    assert!(WS_MOD_SOURCE.contains("TOKEN_ALREADY_USED"));
    assert!(WS_MOD_SOURCE.contains("KEY_REVOKED"));
}

#[test]
fn websocket_contract_token_ttl_is_short() {
    let ttl = parse_u64_const(WS_TOKEN_SOURCE, "TOKEN_TTL_SECONDS");
    assert!(ttl <= 300, "subscription tokens must be short-lived, got {ttl}s");
}

#[test]
fn websocket_contract_tokens_are_single_use() {
    assert!(
        WS_REGISTRY_SOURCE.contains("redeem_token"),
        "the registry must track redeemed token ids"
    );
    assert!(
        WS_MOD_SOURCE.contains("redeem_token"),
        "the upgrade path must consume the token before registering"
    );
}

#[test]
fn websocket_contract_frame_shapes() {
    let connection_id = Uuid::new_v4();
    let event_id = Uuid::new_v4();

    let samples = [
        (
            WsFrame::Connected {
                connection_id,
                events: vec!["append.created".to_string()],
                scope: "/tasks".to_string(),
            },
            "connected",
            &["type", "connectionId", "events", "scope"][..],
        ),
        (
            WsFrame::Event {
                event_id,
                sequence: 7,
                event: "task.created".to_string(),
                path: "/tasks/today.md".to_string(),
                data: serde_json::json!({ "appendId": "a1" }),
            },
            "event",
            &["type", "eventId", "sequence", "event", "path", "data"][..],
        ),
        (WsFrame::Pong, "pong", &["type"][..]),
        (
            WsFrame::Ack { received: serde_json::json!({ "type": "mystery" }) },
            "ack",
            &["type", "received"][..],
        ),
    ];

    for (frame, expected_type, expected_keys) in samples {
        let value = serde_json::to_value(frame).expect("ws frame should serialize");
        assert_eq!(value["type"], expected_type);
        for key in expected_keys {
            assert!(
                value.get(key).is_some(),
                "serialized `{expected_type}` frame must include `{key}`",
            );
        }
    }
}

#[test]
fn websocket_contract_ping_parses_from_client_json() {
    let frame: WsFrame =
        serde_json::from_str(r#"{"type":"ping"}"#).expect("ping should deserialize");
    assert_eq!(frame, WsFrame::Ping);
}

fn parse_u64_const(source: &str, name: &str) -> u64 {
    let needle = format!("const {name}:");
    let index = source.find(&needle).expect("constant must be declared");
    let line = source[index..].lines().next().expect("constant declaration line must exist");
    let raw_value = line
        .split('=')
        .nth(1)
        .expect("constant must have assignment")
        .trim()
        .trim_end_matches(';')
        .replace('_', "");
    raw_value
        .parse::<u64>()
        .unwrap_or_else(|error| panic!("failed to parse `{name}` from `{line}`: {error}"))
}
