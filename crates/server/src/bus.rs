// In-process event bus between the append log and the WebSocket fan-out.
//
// Each publish assigns one event id and one sequence number per logical
// event — not per recipient — so every connection that receives a given
// event observes the same `{eventId, sequence}` and can detect gaps.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use handoff_common::types::{EventKind, Tier};

/// One logical log-change event.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub event_id: Uuid,
    pub sequence: i64,
    pub workspace_id: String,
    pub event: String,
    pub path: String,
    pub data: Value,
}

/// Event names visible at the read tier.
pub const READ_EVENTS: &[&str] =
    &["file.created", "file.updated", "append.created", "folder.changed"];

/// Additional event names visible at the append tier.
pub const APPEND_EVENTS: &[&str] = &[
    "task.created",
    "task.completed",
    "task.cancelled",
    "claim.created",
    "claim.renewed",
    "claim.completed",
    "claim.cancelled",
    "claim.blocked",
    "heartbeat.updated",
];

/// Additional event names visible at the write tier.
pub const WRITE_EVENTS: &[&str] = &["webhook.updated", "settings.updated"];

/// The event set a tier may subscribe to. Strictly nested supersets.
pub fn events_for_tier(tier: Tier) -> Vec<String> {
    let mut events: Vec<String> = READ_EVENTS.iter().map(|s| s.to_string()).collect();
    if tier.allows(Tier::Append) {
        events.extend(APPEND_EVENTS.iter().map(|s| s.to_string()));
    }
    if tier.allows(Tier::Write) {
        events.extend(WRITE_EVENTS.iter().map(|s| s.to_string()));
    }
    events
}

/// The lifecycle event name an append emits, if any.
///
/// `cancel` is the one kind whose meaning depends on its target: a cancel
/// referencing a claim releases the claim, one referencing the task cancels
/// the task.
pub fn lifecycle_event(kind: &EventKind, ref_kind: Option<&EventKind>) -> Option<&'static str> {
    match kind {
        EventKind::Task => Some("task.created"),
        EventKind::Claim => Some("claim.created"),
        EventKind::Renew => Some("claim.renewed"),
        EventKind::Blocked => Some("claim.blocked"),
        EventKind::Response => Some("task.completed"),
        EventKind::Cancel => match ref_kind {
            Some(EventKind::Claim) => Some("claim.cancelled"),
            _ => Some("task.cancelled"),
        },
        EventKind::Heartbeat => Some("heartbeat.updated"),
        EventKind::Comment | EventKind::Answer | EventKind::Vote | EventKind::Other(_) => None,
    }
}

/// Broadcast-channel event bus, shared by mutation handlers and the fan-out
/// task. Constructed at service start and injected — never a global.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LogEvent>,
    sequence: Arc<AtomicI64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, sequence: Arc::new(AtomicI64::new(0)) }
    }

    /// Publish one logical event. Returns the stamped event; delivery to
    /// subscribers is best-effort (no receiver is not an error).
    pub fn publish(
        &self,
        workspace_id: &str,
        event: &str,
        path: &str,
        data: Value,
    ) -> LogEvent {
        let stamped = LogEvent {
            event_id: Uuid::new_v4(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            workspace_id: workspace_id.to_string(),
            event: event.to_string(),
            path: path.to_string(),
            data,
        };

        let _ = self.sender.send(stamped.clone());
        stamped
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
