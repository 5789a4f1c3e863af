// Claim mutation engine.
//
// Legal transitions:
//   active  -> completed | cancelled | blocked
//   active  -> expired        (time-driven, never an explicit transition)
//   expired -> cancelled      (a stale claim may still be cancelled)
//   expired -> active         (renew, always forward in time)
//
// Every operation re-derives the claim's current status from the log before
// acting — caller-supplied status is never trusted. Two racing mutations on
// one claim serialize on the store; the loser observes a non-active status
// and fails with INVALID_REQUEST instead of double-applying.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;

use handoff_common::types::{ClaimStatus, DerivedClaim, EventKind};

use crate::appends::{
    extend_claim_expiry, find_file, load_appends, record_append, AppendRequest, AppendRow,
    FileRow, DEFAULT_CLAIM_SECONDS,
};
use crate::auth::CapabilityKey;
use crate::derive;
use crate::error::{ApiError, ErrorCode};

/// Outcome of a successful claim mutation: the claim in its new derived
/// state plus the audit append that advanced it.
#[derive(Debug, Clone)]
pub struct ClaimMutation {
    pub claim: DerivedClaim,
    pub file: FileRow,
    pub audit: AppendRow,
}

/// Resolve a claim by its human-visible id.
///
/// `path` disambiguates when the same append id exists in several files the
/// key can see; without it the id must match exactly one claim in scope.
pub fn resolve_claim(
    conn: &Connection,
    key: &CapabilityKey,
    claim_id: &str,
    path: Option<&str>,
) -> Result<(FileRow, AppendRow), ApiError> {
    if let Some(path) = path {
        if !key.permits_path(path) {
            return Err(ApiError::from_code(ErrorCode::NotFound));
        }
        let file = find_file(conn, &key.workspace_id, path)
            .map_err(crate::error::storage_error)?
            .ok_or_else(|| ApiError::from_code(ErrorCode::NotFound))?;
        let claim = crate::appends::find_append(conn, &file.id, claim_id)
            .map_err(crate::error::storage_error)?
            .filter(|row| matches!(row.kind, EventKind::Claim))
            .ok_or_else(|| ApiError::from_code(ErrorCode::AppendNotFound))?;
        return Ok((file, claim));
    }

    let matches = find_claims_by_append_id(conn, &key.workspace_id, claim_id)
        .map_err(crate::error::storage_error)?;
    let mut in_scope: Vec<(FileRow, AppendRow)> = matches
        .into_iter()
        .filter(|(file, _)| key.permits_path(&file.path))
        .collect();

    match in_scope.len() {
        0 => Err(ApiError::from_code(ErrorCode::AppendNotFound)),
        1 => Ok(in_scope.remove(0)),
        _ => Err(ApiError::new(
            ErrorCode::InvalidRequest,
            format!("claim id `{claim_id}` is ambiguous; supply a path"),
        )),
    }
}

/// Extend a claim's deadline in place and append a `renew` audit event.
pub fn renew(
    conn: &Connection,
    key: &CapabilityKey,
    file: &FileRow,
    claim: &AppendRow,
    expires_in_seconds: Option<i64>,
    now: DateTime<Utc>,
) -> Result<ClaimMutation, ApiError> {
    let seconds = expires_in_seconds.unwrap_or(DEFAULT_CLAIM_SECONDS);
    if seconds <= 0 {
        return Err(ApiError::new(ErrorCode::InvalidRequest, "expiresInSeconds must be positive"));
    }

    require_status(
        conn,
        file,
        claim,
        &[ClaimStatus::Active, ClaimStatus::Expired],
        "renew",
        now,
    )?;

    // Renewal only ever moves the deadline forward from now; it can never
    // shorten a claim into the past.
    let new_deadline = now + Duration::seconds(seconds);
    extend_claim_expiry(conn, &claim.id, new_deadline).map_err(crate::error::storage_error)?;

    append_audit(conn, key, file, claim, EventKind::Renew, String::new(), &claim.append_id, now)
}

/// Complete a claim: append a `response` referencing it. Also completes the
/// claim's task on the next derivation.
pub fn complete(
    conn: &Connection,
    key: &CapabilityKey,
    file: &FileRow,
    claim: &AppendRow,
    content: Option<String>,
    now: DateTime<Utc>,
) -> Result<ClaimMutation, ApiError> {
    require_status(conn, file, claim, &[ClaimStatus::Active], "complete", now)?;
    append_audit(
        conn,
        key,
        file,
        claim,
        EventKind::Response,
        content.unwrap_or_default(),
        &claim.append_id,
        now,
    )
}

/// Cancel a claim: append a `cancel` referencing it. Legal while active or
/// already expired; the task drops back to pending.
pub fn cancel(
    conn: &Connection,
    key: &CapabilityKey,
    file: &FileRow,
    claim: &AppendRow,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<ClaimMutation, ApiError> {
    require_status(
        conn,
        file,
        claim,
        &[ClaimStatus::Active, ClaimStatus::Expired],
        "cancel",
        now,
    )?;
    append_audit(
        conn,
        key,
        file,
        claim,
        EventKind::Cancel,
        reason.unwrap_or_default(),
        &claim.append_id,
        now,
    )
}

/// Block a claim: append a `blocked` event referencing the *task*
/// (`claim.ref`), not the claim itself, so the block stays visible on
/// whichever claim later owns the task.
pub fn block(
    conn: &Connection,
    key: &CapabilityKey,
    file: &FileRow,
    claim: &AppendRow,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<ClaimMutation, ApiError> {
    if reason.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::InvalidRequest, "a block reason is required"));
    }

    require_status(conn, file, claim, &[ClaimStatus::Active], "block", now)?;

    let task_id = claim
        .ref_id
        .clone()
        .ok_or_else(|| ApiError::new(ErrorCode::InvalidRequest, "claim has no task reference"))?;

    append_audit(conn, key, file, claim, EventKind::Blocked, reason.to_string(), &task_id, now)
}

fn require_status(
    conn: &Connection,
    file: &FileRow,
    claim: &AppendRow,
    allowed: &[ClaimStatus],
    operation: &str,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let appends = load_appends(conn, &file.id).map_err(crate::error::storage_error)?;
    let current = derive::claim_status(&appends, claim, now).status;

    if allowed.contains(&current) {
        return Ok(());
    }

    Err(ApiError::new(
        ErrorCode::InvalidRequest,
        format!("cannot {operation} a {} claim", current.as_str()),
    ))
}

#[allow(clippy::too_many_arguments)]
fn append_audit(
    conn: &Connection,
    key: &CapabilityKey,
    file: &FileRow,
    claim: &AppendRow,
    kind: EventKind,
    content: String,
    ref_id: &str,
    now: DateTime<Utc>,
) -> Result<ClaimMutation, ApiError> {
    let author = key.bound_author.clone().unwrap_or_else(|| claim.author.clone());
    let request = AppendRequest {
        path: file.path.clone(),
        kind,
        content,
        ref_id: Some(ref_id.to_string()),
        priority: None,
        labels: Vec::new(),
        due_at: None,
        expires_in_seconds: None,
        author: Some(author),
    };

    let (file, audit) = record_append(conn, key, &request, now)?;

    // Re-derive so the returned claim reflects the mutation just applied
    // (and the renewed deadline, which changed in place).
    let appends = load_appends(conn, &file.id).map_err(crate::error::storage_error)?;
    let claim_row = appends
        .iter()
        .find(|row| row.append_id == claim.append_id)
        .ok_or_else(|| ApiError::from_code(ErrorCode::AppendNotFound))?;
    let claim = derive::derive_claim(&appends, claim_row, &file.path, now);

    Ok(ClaimMutation { claim, file, audit })
}

fn find_claims_by_append_id(
    conn: &Connection,
    workspace_id: &str,
    claim_id: &str,
) -> anyhow::Result<Vec<(FileRow, AppendRow)>> {
    use anyhow::Context;

    let mut stmt = conn
        .prepare(
            "SELECT f.id FROM appends AS a \
             INNER JOIN files AS f ON f.id = a.file_id \
             WHERE f.workspace_id = ?1 AND f.deleted_at IS NULL \
               AND a.append_id = ?2 AND a.type = 'claim'",
        )
        .context("failed to prepare claim lookup")?;
    let file_ids = stmt
        .query_map([workspace_id, claim_id], |row| row.get::<_, String>(0))
        .context("failed to query claim lookup")?
        .collect::<Result<Vec<String>, _>>()
        .context("failed to decode claim lookup rows")?;

    let mut found = Vec::new();
    for file_id in file_ids {
        let file = find_file_by_id(conn, &file_id)?;
        let Some(file) = file else { continue };
        if let Some(claim) = crate::appends::find_append(conn, &file.id, claim_id)? {
            found.push((file, claim));
        }
    }
    Ok(found)
}

fn find_file_by_id(conn: &Connection, file_id: &str) -> anyhow::Result<Option<FileRow>> {
    use anyhow::Context;
    use rusqlite::OptionalExtension;

    conn.query_row(
        "SELECT id, workspace_id, path, content, created_at, updated_at \
         FROM files WHERE id = ?1 AND deleted_at IS NULL",
        [file_id],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        },
    )
    .optional()
    .context("failed to query file by id")?
    .map(|(id, workspace_id, path, content, created_raw, updated_raw)| {
        Ok(FileRow {
            id,
            workspace_id,
            path,
            content,
            created_at: created_raw
                .parse()
                .with_context(|| format!("invalid timestamp `{created_raw}` in file row"))?,
            updated_at: updated_raw
                .parse()
                .with_context(|| format!("invalid timestamp `{updated_raw}` in file row"))?,
        })
    })
    .transpose()
}
