// Core domain types shared across all Handoff crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Permission tier carried by a capability key.
///
/// Tiers are strictly nested: `write` implies `append` implies `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Read,
    Append,
    Write,
}

impl Tier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Append => "append",
            Self::Write => "write",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "read" => Some(Self::Read),
            "append" => Some(Self::Append),
            "write" => Some(Self::Write),
            _ => None,
        }
    }

    /// Whether this tier satisfies a required tier.
    pub fn allows(self, required: Tier) -> bool {
        self >= required
    }
}

/// What a capability key or subscription is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Workspace,
    Folder,
    File,
}

impl ScopeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Folder => "folder",
            Self::File => "file",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "workspace" => Some(Self::Workspace),
            "folder" => Some(Self::Folder),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// The kind of an append event.
///
/// Stored as an open string — agents may define new kinds — but modeled as a
/// closed enum for the kinds the engines understand, with a catch-all for
/// forward compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Task,
    Claim,
    Response,
    Cancel,
    Blocked,
    Renew,
    Comment,
    Answer,
    Vote,
    Heartbeat,
    Other(String),
}

impl EventKind {
    pub fn parse(value: &str) -> Self {
        match value {
            "task" => Self::Task,
            "claim" => Self::Claim,
            "response" => Self::Response,
            "cancel" => Self::Cancel,
            "blocked" => Self::Blocked,
            "renew" => Self::Renew,
            "comment" => Self::Comment,
            "answer" => Self::Answer,
            "vote" => Self::Vote,
            "heartbeat" => Self::Heartbeat,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Task => "task",
            Self::Claim => "claim",
            Self::Response => "response",
            Self::Cancel => "cancel",
            Self::Blocked => "blocked",
            Self::Renew => "renew",
            Self::Comment => "comment",
            Self::Answer => "answer",
            Self::Vote => "vote",
            Self::Heartbeat => "heartbeat",
            Self::Other(raw) => raw,
        }
    }
}

/// Derived task status. Never stored — always recomputed from the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Stalled,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Claimed,
        TaskStatus::Stalled,
        TaskStatus::Completed,
        TaskStatus::Cancelled,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Stalled => "stalled",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "stalled" => Some(Self::Stalled),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Derived claim status. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Active,
    Expired,
    Blocked,
    Completed,
    Cancelled,
}

impl ClaimStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A task derived from a `task` append and the events referencing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DerivedTask {
    /// The task append's human-visible id within its file (e.g. `a5`).
    pub id: String,
    pub file: String,
    pub content: String,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim: Option<DerivedClaim>,
}

/// A claim derived from a `claim` append and the events referencing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DerivedClaim {
    pub id: String,
    /// The `appendId` of the task this claim is against.
    pub task_id: String,
    pub file: String,
    pub author: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in_seconds: i64,
    pub status: ClaimStatus,
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_force_expire: Option<bool>,
}

/// An agent's presence derived from its heartbeat row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentPresence {
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    pub seen_at: DateTime<Utc>,
    pub stale: bool,
}

/// Per-author workload figures for the board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadEntry {
    pub author: String,
    pub active_claims: i64,
    pub completed_today: i64,
}

/// Count of tasks per derived status over the filtered set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BoardSummary {
    pub pending: i64,
    pub claimed: i64,
    pub stalled: i64,
    pub completed: i64,
    pub cancelled: i64,
}

impl BoardSummary {
    pub fn bump(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Claimed => self.claimed += 1,
            TaskStatus::Stalled => self.stalled += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Keyset pagination state for board queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// The assembled orchestration board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub summary: BoardSummary,
    pub tasks: Vec<DerivedTask>,
    pub claims: Vec<DerivedClaim>,
    pub agents: Vec<AgentPresence>,
    pub workload: Vec<WorkloadEntry>,
    pub pagination: Pagination,
}

#[cfg(test)]
mod tests {
    use super::{EventKind, ScopeType, TaskStatus, Tier};

    #[test]
    fn tiers_are_strictly_nested() {
        assert!(Tier::Write.allows(Tier::Write));
        assert!(Tier::Write.allows(Tier::Append));
        assert!(Tier::Write.allows(Tier::Read));
        assert!(Tier::Append.allows(Tier::Read));
        assert!(!Tier::Append.allows(Tier::Write));
        assert!(!Tier::Read.allows(Tier::Append));
    }

    #[test]
    fn tier_round_trips_through_strings() {
        for tier in [Tier::Read, Tier::Append, Tier::Write] {
            assert_eq!(Tier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(Tier::parse("admin"), None);
    }

    #[test]
    fn scope_type_round_trips_through_strings() {
        for scope in [ScopeType::Workspace, ScopeType::Folder, ScopeType::File] {
            assert_eq!(ScopeType::parse(scope.as_str()), Some(scope));
        }
        assert_eq!(ScopeType::parse("global"), None);
    }

    #[test]
    fn event_kind_keeps_unknown_kinds_verbatim() {
        assert_eq!(EventKind::parse("task"), EventKind::Task);
        assert_eq!(EventKind::parse("vote"), EventKind::Vote);

        let custom = EventKind::parse("retrospective");
        assert_eq!(custom, EventKind::Other("retrospective".to_string()));
        assert_eq!(custom.as_str(), "retrospective");
    }

    #[test]
    fn task_status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Stalled).expect("status should serialize");
        assert_eq!(json, "\"stalled\"");
    }
}
