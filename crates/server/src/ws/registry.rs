// Connection registry and admission control.
//
// Tracks live WebSocket connections with per-key and per-workspace counts,
// plus the redeemed-token set that makes subscription tokens single-use.
// The registry is constructed at service start and injected into handlers;
// `reset` gives tests a clean slate. Counts are updated atomically with
// open/close so admission slots cannot leak.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use handoff_common::path::scope_contains;
use handoff_common::protocol::ws::WsFrame;
use handoff_common::types::Tier;

use crate::bus::LogEvent;
use crate::config::LimitsConfig;

/// The narrow socket capability the fan-out loop needs: send a frame,
/// report liveness. Lets broadcast be tested with a fake transport.
pub trait EventSink: Send + Sync {
    /// Attempt delivery. Returns false when the peer is gone.
    fn send(&self, frame: &WsFrame) -> bool;
    fn is_open(&self) -> bool;
}

/// One registered connection.
#[derive(Clone)]
pub struct WsConnection {
    pub id: Uuid,
    pub workspace_id: String,
    pub key_hash: String,
    pub tier: Tier,
    pub scope: String,
    pub events: HashSet<String>,
    pub sink: Arc<dyn EventSink>,
}

/// Why admission was refused; maps onto close codes 4004/4005.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    KeyLimit,
    WorkspaceBusy,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<Uuid, WsConnection>,
    per_key: HashMap<String, usize>,
    per_workspace: HashMap<String, usize>,
}

pub struct ConnectionRegistry {
    limits: LimitsConfig,
    inner: Mutex<RegistryInner>,
    used_tokens: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ConnectionRegistry {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits,
            inner: Mutex::new(RegistryInner::default()),
            used_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Redeem a token id. Returns false when it was already used.
    pub fn redeem_token(&self, jti: &str, expires_at: DateTime<Utc>) -> bool {
        let mut used = self.used_tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if used.contains_key(jti) {
            return false;
        }
        used.insert(jti.to_string(), expires_at);
        true
    }

    /// Drop redeemed-token entries past their natural expiry; replay of an
    /// expired token already fails signature validation.
    pub fn purge_expired_tokens(&self, now: DateTime<Utc>) -> usize {
        let mut used = self.used_tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = used.len();
        used.retain(|_, expires_at| *expires_at > now);
        before - used.len()
    }

    /// Register a connection, enforcing both admission limits atomically.
    pub fn register(&self, connection: WsConnection) -> Result<(), AdmissionError> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let key_count = inner.per_key.get(&connection.key_hash).copied().unwrap_or(0);
        if key_count >= self.limits.max_key_connections {
            return Err(AdmissionError::KeyLimit);
        }

        let workspace_count =
            inner.per_workspace.get(&connection.workspace_id).copied().unwrap_or(0);
        if workspace_count >= self.limits.max_workspace_connections {
            return Err(AdmissionError::WorkspaceBusy);
        }

        *inner.per_key.entry(connection.key_hash.clone()).or_default() += 1;
        *inner.per_workspace.entry(connection.workspace_id.clone()).or_default() += 1;
        inner.connections.insert(connection.id, connection);
        Ok(())
    }

    /// Unregister a connection, releasing both admission slots.
    pub fn unregister(&self, connection_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(connection) = inner.connections.remove(&connection_id) else {
            return;
        };

        decrement(&mut inner.per_key, &connection.key_hash);
        decrement(&mut inner.per_workspace, &connection.workspace_id);
    }

    /// Fan one logical event out to every matching connection.
    ///
    /// Delivery is best-effort: a dead sink is logged and skipped, never
    /// allowed to abort delivery to the remaining connections.
    pub fn deliver(&self, event: &LogEvent) -> usize {
        let recipients: Vec<WsConnection> = {
            let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inner
                .connections
                .values()
                .filter(|connection| {
                    connection.workspace_id == event.workspace_id
                        && connection.events.contains(&event.event)
                        && scope_contains(&connection.scope, &event.path)
                })
                .cloned()
                .collect()
        };

        let frame = WsFrame::Event {
            event_id: event.event_id,
            sequence: event.sequence,
            event: event.event.clone(),
            path: event.path.clone(),
            data: event.data.clone(),
        };

        let mut delivered = 0;
        for connection in recipients {
            if !connection.sink.is_open() || !connection.sink.send(&frame) {
                warn!(
                    connection_id = %connection.id,
                    event = %event.event,
                    "dropping event for closed connection"
                );
                continue;
            }
            delivered += 1;
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).connections.len()
    }

    pub fn key_connection_count(&self, key_hash: &str) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .per_key
            .get(key_hash)
            .copied()
            .unwrap_or(0)
    }

    pub fn workspace_connection_count(&self, workspace_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .per_workspace
            .get(workspace_id)
            .copied()
            .unwrap_or(0)
    }

    /// Clear every connection and redeemed token for test isolation.
    pub fn reset(&self) {
        *self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            RegistryInner::default();
        self.used_tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
    }
}

fn decrement(counts: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = counts.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(key);
        }
    }
}
