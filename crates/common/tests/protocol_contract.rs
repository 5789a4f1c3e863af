use handoff_common::path::{normalize_folder, normalize_path, scope_contains};
use handoff_common::protocol::ws::{close_code, WsFrame};
use handoff_common::types::{TaskStatus, Tier};
use serde_json::json;
use uuid::Uuid;

#[test]
fn protocol_contract_close_codes_are_stable() {
    // Close codes are a wire contract with every deployed client; renumber
    // only with a protocol version bump.
    assert_eq!(close_code::TOKEN_EXPIRED, 4001);
    assert_eq!(close_code::TOKEN_INVALID, 4002);
    assert_eq!(close_code::KEY_REVOKED, 4003);
    assert_eq!(close_code::KEY_CONNECTION_LIMIT, 4004);
    assert_eq!(close_code::WORKSPACE_BUSY, 4005);
}

#[test]
fn protocol_contract_connected_frame_shape() {
    let frame = WsFrame::Connected {
        connection_id: Uuid::nil(),
        events: vec!["file.updated".to_string()],
        scope: "/".to_string(),
    };

    let value = serde_json::to_value(frame).expect("frame should serialize");
    assert_eq!(
        value,
        json!({
            "type": "connected",
            "connectionId": "00000000-0000-0000-0000-000000000000",
            "events": ["file.updated"],
            "scope": "/",
        })
    );
}

#[test]
fn protocol_contract_status_strings_are_lowercase() {
    for status in TaskStatus::ALL {
        let serialized =
            serde_json::to_string(&status).expect("status should serialize");
        assert_eq!(serialized, format!("\"{}\"", status.as_str()));
        assert_eq!(status.as_str(), status.as_str().to_lowercase());
    }
}

#[test]
fn protocol_contract_tier_ordering_matches_url_prefixes() {
    // /r < /a < /w
    assert!(Tier::Read < Tier::Append);
    assert!(Tier::Append < Tier::Write);
}

#[test]
fn protocol_contract_scope_matching_examples() {
    // the canonical examples from the subscription docs
    assert!(scope_contains("/tasks", "/tasks/today.md"));
    assert!(!scope_contains("/tasks", "/notes/today.md"));
    assert!(scope_contains("/", "/notes/today.md"));
    assert!(scope_contains("", "/notes/today.md"));
}

#[test]
fn protocol_contract_paths_are_canonicalized_consistently() {
    assert_eq!(normalize_path("pr.md").expect("path should normalize"), "/pr.md");
    assert_eq!(
        normalize_folder("/tasks/").expect("folder should normalize"),
        "/tasks"
    );
    assert!(normalize_path("/a/../b").is_err(), "traversal must never canonicalize");
}
