// Read-time status derivation.
//
// Task and claim status are never stored. They are pure functions of the
// append set for a file plus an injected `now`, keyed by `ref` chains:
//
// task:  completed > cancelled > claimed/stalled > pending
// claim: completed > cancelled > blocked > expired > active
//
// Completion and cancellation always win over claim/expiry state — a task
// can be resolved after its claim nominally expired. A `response` that
// references a claim also completes the claim's task; a `cancel` that
// references a claim only releases the claim (the task drops back to
// pending once no live claim remains).

use chrono::{DateTime, Utc};

use handoff_common::types::{ClaimStatus, DerivedClaim, DerivedTask, EventKind, TaskStatus};

use crate::appends::AppendRow;

/// Derived task state plus the claim that currently owns the task, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState<'a> {
    pub status: TaskStatus,
    pub owning_claim: Option<&'a AppendRow>,
}

/// Derived claim state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimState {
    pub status: ClaimStatus,
    pub blocked: bool,
    pub block_reason: Option<String>,
}

/// Compute a task's status from the file's append set.
pub fn task_status<'a>(
    appends: &'a [AppendRow],
    task: &AppendRow,
    now: DateTime<Utc>,
) -> TaskState<'a> {
    let claim_ids: Vec<&str> = appends
        .iter()
        .filter(|row| {
            matches!(row.kind, EventKind::Claim) && row.ref_id.as_deref() == Some(&task.append_id)
        })
        .map(|row| row.append_id.as_str())
        .collect();

    let resolves_task = |row: &AppendRow| {
        row.ref_id.as_deref() == Some(&task.append_id)
            || row.ref_id.as_deref().is_some_and(|r| claim_ids.contains(&r))
    };

    // A response referencing the task or any of its claims completes it.
    if appends.iter().any(|row| matches!(row.kind, EventKind::Response) && resolves_task(row)) {
        return TaskState { status: TaskStatus::Completed, owning_claim: None };
    }

    // Only a cancel referencing the task itself cancels it; a cancel
    // referencing a claim merely releases that claim.
    if appends.iter().any(|row| {
        matches!(row.kind, EventKind::Cancel) && row.ref_id.as_deref() == Some(&task.append_id)
    }) {
        return TaskState { status: TaskStatus::Cancelled, owning_claim: None };
    }

    // The newest unresolved storage-`active` claim owns the task.
    let owning_claim = appends
        .iter()
        .filter(|row| {
            matches!(row.kind, EventKind::Claim)
                && row.ref_id.as_deref() == Some(&task.append_id)
                && row.status.as_deref() == Some("active")
                && !is_resolved(appends, &row.append_id)
        })
        .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

    match owning_claim {
        Some(claim) => {
            let expired = claim.expires_at.is_some_and(|deadline| deadline <= now);
            let status = if expired { TaskStatus::Stalled } else { TaskStatus::Claimed };
            TaskState { status, owning_claim: Some(claim) }
        }
        None => TaskState { status: TaskStatus::Pending, owning_claim: None },
    }
}

/// Compute a claim's status from the file's append set.
pub fn claim_status(appends: &[AppendRow], claim: &AppendRow, now: DateTime<Utc>) -> ClaimState {
    if references(appends, EventKind::Response, &claim.append_id) {
        return ClaimState { status: ClaimStatus::Completed, blocked: false, block_reason: None };
    }

    if references(appends, EventKind::Cancel, &claim.append_id) {
        return ClaimState { status: ClaimStatus::Cancelled, blocked: false, block_reason: None };
    }

    // Blocking is recorded against the task, visible on whichever claim
    // currently owns it.
    let block = claim.ref_id.as_deref().and_then(|task_id| {
        appends
            .iter()
            .filter(|row| {
                matches!(row.kind, EventKind::Blocked) && row.ref_id.as_deref() == Some(task_id)
            })
            .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
    });
    if let Some(block) = block {
        return ClaimState {
            status: ClaimStatus::Blocked,
            blocked: true,
            block_reason: Some(block.content_preview.clone()),
        };
    }

    if claim.expires_at.is_some_and(|deadline| deadline < now) {
        return ClaimState { status: ClaimStatus::Expired, blocked: false, block_reason: None };
    }

    ClaimState { status: ClaimStatus::Active, blocked: false, block_reason: None }
}

/// Whether a claim is still live for board purposes: not expired, not
/// already responded to or cancelled.
pub fn claim_is_live(appends: &[AppendRow], claim: &AppendRow, now: DateTime<Utc>) -> bool {
    matches!(
        claim_status(appends, claim, now).status,
        ClaimStatus::Active | ClaimStatus::Blocked
    )
}

/// Build the board-facing task, with its owning claim embedded.
pub fn derive_task(
    appends: &[AppendRow],
    task: &AppendRow,
    file_path: &str,
    now: DateTime<Utc>,
) -> DerivedTask {
    let state = task_status(appends, task, now);
    let claim = state
        .owning_claim
        .map(|claim| derive_claim(appends, claim, file_path, now));

    DerivedTask {
        id: task.append_id.clone(),
        file: file_path.to_string(),
        content: task.content_preview.clone(),
        author: task.author.clone(),
        priority: task.priority.clone(),
        labels: task.labels.clone(),
        created_at: task.created_at,
        due: task.due_at,
        status: state.status,
        claim,
    }
}

/// Build the board-facing claim.
pub fn derive_claim(
    appends: &[AppendRow],
    claim: &AppendRow,
    file_path: &str,
    now: DateTime<Utc>,
) -> DerivedClaim {
    let state = claim_status(appends, claim, now);
    let expires_at = claim.expires_at.unwrap_or(claim.created_at);

    DerivedClaim {
        id: claim.append_id.clone(),
        task_id: claim.ref_id.clone().unwrap_or_default(),
        file: file_path.to_string(),
        author: claim.author.clone(),
        expires_at,
        expires_in_seconds: (expires_at - now).num_seconds().max(0),
        status: state.status,
        blocked: state.blocked,
        block_reason: state.block_reason,
        can_force_expire: None,
    }
}

fn references(appends: &[AppendRow], kind: EventKind, append_id: &str) -> bool {
    appends
        .iter()
        .any(|row| row.kind == kind && row.ref_id.as_deref() == Some(append_id))
}

fn is_resolved(appends: &[AppendRow], claim_append_id: &str) -> bool {
    appends.iter().any(|row| {
        matches!(row.kind, EventKind::Response | EventKind::Cancel)
            && row.ref_id.as_deref() == Some(claim_append_id)
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use handoff_common::types::{ClaimStatus, EventKind, TaskStatus};

    use super::{claim_is_live, claim_status, derive_task, task_status};
    use crate::appends::AppendRow;

    fn ts(seconds: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).single().expect("timestamp should be valid")
    }

    fn row(append_id: &str, kind: EventKind, ref_id: Option<&str>, at: i64) -> AppendRow {
        AppendRow {
            id: format!("row-{append_id}"),
            file_id: "f1".to_string(),
            append_id: append_id.to_string(),
            author: "john".to_string(),
            kind,
            ref_id: ref_id.map(ToOwned::to_owned),
            status: None,
            priority: None,
            labels: Vec::new(),
            due_at: None,
            expires_at: None,
            created_at: ts(at),
            content_preview: String::new(),
            content_hash: None,
        }
    }

    fn claim(append_id: &str, task: &str, at: i64, expires: i64) -> AppendRow {
        let mut c = row(append_id, EventKind::Claim, Some(task), at);
        c.status = Some("active".to_string());
        c.expires_at = Some(ts(expires));
        c
    }

    #[test]
    fn unreferenced_task_is_pending() {
        let appends = vec![row("a1", EventKind::Task, None, 100)];
        let state = task_status(&appends, &appends[0], ts(200));
        assert_eq!(state.status, TaskStatus::Pending);
        assert!(state.owning_claim.is_none());
    }

    #[test]
    fn active_claim_makes_task_claimed_then_stalled() {
        let appends = vec![
            row("a1", EventKind::Task, None, 100),
            claim("a2", "a1", 110, 400),
        ];

        let before = task_status(&appends, &appends[0], ts(300));
        assert_eq!(before.status, TaskStatus::Claimed);
        assert_eq!(before.owning_claim.map(|c| c.append_id.as_str()), Some("a2"));

        // deadline passed, nothing resolved it
        let after = task_status(&appends, &appends[0], ts(400));
        assert_eq!(after.status, TaskStatus::Stalled);
    }

    #[test]
    fn response_on_task_completes_it() {
        let appends = vec![
            row("a1", EventKind::Task, None, 100),
            row("a2", EventKind::Response, Some("a1"), 150),
        ];
        assert_eq!(task_status(&appends, &appends[0], ts(200)).status, TaskStatus::Completed);
    }

    #[test]
    fn response_on_claim_also_completes_the_task() {
        let appends = vec![
            row("a1", EventKind::Task, None, 100),
            claim("a2", "a1", 110, 400),
            row("a3", EventKind::Response, Some("a2"), 150),
        ];
        assert_eq!(task_status(&appends, &appends[0], ts(200)).status, TaskStatus::Completed);
        assert_eq!(claim_status(&appends, &appends[1], ts(200)).status, ClaimStatus::Completed);
    }

    #[test]
    fn completion_wins_over_a_later_cancel() {
        let appends = vec![
            row("a1", EventKind::Task, None, 100),
            row("a2", EventKind::Response, Some("a1"), 150),
            row("a3", EventKind::Cancel, Some("a1"), 160),
        ];
        assert_eq!(task_status(&appends, &appends[0], ts(200)).status, TaskStatus::Completed);
    }

    #[test]
    fn completion_wins_even_after_claim_expiry() {
        let appends = vec![
            row("a1", EventKind::Task, None, 100),
            claim("a2", "a1", 110, 120),
            row("a3", EventKind::Response, Some("a2"), 500),
        ];
        assert_eq!(task_status(&appends, &appends[0], ts(600)).status, TaskStatus::Completed);
    }

    #[test]
    fn cancel_on_task_cancels_it() {
        let appends = vec![
            row("a1", EventKind::Task, None, 100),
            row("a2", EventKind::Cancel, Some("a1"), 150),
        ];
        assert_eq!(task_status(&appends, &appends[0], ts(200)).status, TaskStatus::Cancelled);
    }

    #[test]
    fn cancel_on_claim_releases_the_task_to_pending() {
        // Stalled claim cancelled: no active claim remains, task is pending.
        let appends = vec![
            row("a1", EventKind::Task, None, 100),
            claim("a2", "a1", 110, 120),
            row("a3", EventKind::Cancel, Some("a2"), 500),
        ];
        assert_eq!(claim_status(&appends, &appends[1], ts(600)).status, ClaimStatus::Cancelled);
        assert_eq!(task_status(&appends, &appends[0], ts(600)).status, TaskStatus::Pending);
    }

    #[test]
    fn expired_unresolved_claim_is_expired_and_task_stalled() {
        let appends = vec![
            row("a1", EventKind::Task, None, 100),
            claim("a2", "a1", 110, 120),
        ];
        assert_eq!(claim_status(&appends, &appends[1], ts(500)).status, ClaimStatus::Expired);
        assert_eq!(task_status(&appends, &appends[0], ts(500)).status, TaskStatus::Stalled);
        assert!(!claim_is_live(&appends, &appends[1], ts(500)));
    }

    #[test]
    fn block_is_recorded_against_the_task_but_shows_on_the_claim() {
        let appends = vec![
            row("a1", EventKind::Task, None, 100),
            claim("a2", "a1", 110, 900),
            {
                let mut b = row("a3", EventKind::Blocked, Some("a1"), 150);
                b.content_preview = "waiting on CI".to_string();
                b
            },
        ];

        let state = claim_status(&appends, &appends[1], ts(200));
        assert_eq!(state.status, ClaimStatus::Blocked);
        assert!(state.blocked);
        assert_eq!(state.block_reason.as_deref(), Some("waiting on CI"));
        assert!(claim_is_live(&appends, &appends[1], ts(200)));
    }

    #[test]
    fn blocked_beats_expiry_but_loses_to_resolution() {
        let mut appends = vec![
            row("a1", EventKind::Task, None, 100),
            claim("a2", "a1", 110, 120),
            row("a3", EventKind::Blocked, Some("a1"), 150),
        ];

        // blocked even though the deadline passed
        assert_eq!(claim_status(&appends, &appends[1], ts(500)).status, ClaimStatus::Blocked);

        appends.push(row("a4", EventKind::Response, Some("a2"), 600));
        assert_eq!(claim_status(&appends, &appends[1], ts(700)).status, ClaimStatus::Completed);
    }

    #[test]
    fn newest_unresolved_claim_owns_a_reclaimed_task() {
        let appends = vec![
            row("a1", EventKind::Task, None, 100),
            claim("a2", "a1", 110, 120),
            claim("a3", "a1", 300, 900),
        ];

        let state = task_status(&appends, &appends[0], ts(400));
        assert_eq!(state.status, TaskStatus::Claimed);
        assert_eq!(state.owning_claim.map(|c| c.append_id.as_str()), Some("a3"));
    }

    #[test]
    fn derivation_is_deterministic() {
        let appends = vec![
            row("a1", EventKind::Task, None, 100),
            claim("a2", "a1", 110, 400),
            row("a3", EventKind::Blocked, Some("a1"), 150),
        ];
        let now = ts(350);

        let first = derive_task(&appends, &appends[0], "/pr.md", now);
        let second = derive_task(&appends, &appends[0], "/pr.md", now);
        assert_eq!(first, second);

        let claim = first.claim.expect("owning claim should be embedded");
        assert_eq!(claim.task_id, "a1");
        assert_eq!(claim.expires_in_seconds, 50);
        assert_eq!(claim.status, ClaimStatus::Blocked);
    }

    #[test]
    fn expires_in_seconds_never_goes_negative() {
        let appends = vec![
            row("a1", EventKind::Task, None, 100),
            claim("a2", "a1", 110, 120),
        ];
        let derived = super::derive_claim(&appends, &appends[1], "/pr.md", ts(500));
        assert_eq!(derived.expires_in_seconds, 0);
        assert_eq!(derived.status, ClaimStatus::Expired);
    }
}
