// The append-only event log.
//
// Every task, claim, comment, heartbeat, etc. is one row in `appends`. A row
// is immutable after insert except `expires_at`, which claim renewal extends
// in place. Everything else — task status, claim liveness — is derived at
// read time from the set of rows (see `derive`).

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use handoff_common::types::{EventKind, TaskStatus};

use crate::auth::CapabilityKey;
use crate::derive;
use crate::error::{ApiError, ErrorCode};

/// Claims default to a five minute deadline.
pub const DEFAULT_CLAIM_SECONDS: i64 = 300;

const PREVIEW_CHARS: usize = 160;

/// One stored file row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
    pub id: String,
    pub workspace_id: String,
    pub path: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One stored append row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRow {
    pub id: String,
    pub file_id: String,
    pub append_id: String,
    pub author: String,
    pub kind: EventKind,
    pub ref_id: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub labels: Vec<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub content_preview: String,
    pub content_hash: Option<String>,
}

/// A validated request to append one event.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub path: String,
    pub kind: EventKind,
    pub content: String,
    pub ref_id: Option<String>,
    pub priority: Option<String>,
    pub labels: Vec<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub expires_in_seconds: Option<i64>,
    pub author: Option<String>,
}

/// Append one event to a file's log, creating the file on first touch.
///
/// Enforces the key's scope, bound author, allowed types, WIP limit, and the
/// one-active-claim-per-task invariant. Runs inside the caller's write
/// transaction so the derived-status check and the insert are atomic.
pub fn record_append(
    conn: &Connection,
    key: &CapabilityKey,
    request: &AppendRequest,
    now: DateTime<Utc>,
) -> Result<(FileRow, AppendRow), ApiError> {
    if !key.permits_path(&request.path) {
        return Err(ApiError::from_code(ErrorCode::NotFound));
    }
    if !key.permits_type(request.kind.as_str()) {
        return Err(ApiError::new(
            ErrorCode::InvalidRequest,
            format!("append type `{}` is not allowed for this key", request.kind.as_str()),
        ));
    }

    let author = match (&request.author, &key.bound_author) {
        (_, Some(bound)) => bound.clone(),
        (Some(author), None) if !author.is_empty() => author.clone(),
        _ => {
            return Err(ApiError::new(ErrorCode::InvalidRequest, "author is required"));
        }
    };

    let file = ensure_file(conn, &key.workspace_id, &request.path, now)
        .map_err(crate::error::storage_error)?;

    let appends = load_appends(conn, &file.id).map_err(crate::error::storage_error)?;

    if matches!(request.kind, EventKind::Claim) {
        check_claim_preconditions(conn, key, &file, &appends, request, &author, now)?;
    }
    if let Some(ref_id) = &request.ref_id {
        if !appends.iter().any(|row| row.append_id == *ref_id) {
            return Err(ApiError::new(
                ErrorCode::AppendNotFound,
                format!("referenced append `{ref_id}` does not exist in this file"),
            ));
        }
    }

    let expires_at = match request.kind {
        EventKind::Claim => Some(
            now + Duration::seconds(request.expires_in_seconds.unwrap_or(DEFAULT_CLAIM_SECONDS)),
        ),
        _ => request.expires_in_seconds.map(|secs| now + Duration::seconds(secs)),
    };

    // The one sanctioned storage-level status tag: `claim` rows are born
    // `active` and never flipped. Liveness is derived thereafter.
    let status = matches!(request.kind, EventKind::Claim).then(|| "active".to_string());

    let new_content = if file.content.is_empty() {
        request.content.clone()
    } else {
        format!("{}\n\n{}", file.content, request.content)
    };

    let row = AppendRow {
        id: Uuid::new_v4().to_string(),
        file_id: file.id.clone(),
        append_id: next_append_id(conn, &file.id).map_err(crate::error::storage_error)?,
        author,
        kind: request.kind.clone(),
        ref_id: request.ref_id.clone(),
        status,
        priority: request.priority.clone(),
        labels: request.labels.clone(),
        due_at: request.due_at,
        expires_at,
        created_at: now,
        content_preview: preview_of(&request.content),
        content_hash: Some(content_hash(&new_content)),
    };

    insert_append(conn, &row).map_err(crate::error::storage_error)?;
    let grown_by = new_content.len().saturating_sub(file.content.len()) as i64;
    write_file_content(conn, &file.id, &new_content, grown_by, now)
        .map_err(crate::error::storage_error)?;

    if matches!(request.kind, EventKind::Heartbeat) {
        upsert_heartbeat(
            conn,
            &key.workspace_id,
            &row.author,
            Some(request.content.as_str()).filter(|c| !c.is_empty()),
            request.ref_id.as_deref(),
            now,
        )
        .map_err(crate::error::storage_error)?;
    }

    let file = FileRow { content: new_content, updated_at: now, ..file };
    Ok((file, row))
}

fn check_claim_preconditions(
    conn: &Connection,
    key: &CapabilityKey,
    file: &FileRow,
    appends: &[AppendRow],
    request: &AppendRequest,
    author: &str,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let Some(task_id) = &request.ref_id else {
        return Err(ApiError::new(ErrorCode::InvalidRequest, "a claim must reference a task"));
    };

    let Some(task) = appends
        .iter()
        .find(|row| row.append_id == *task_id && matches!(row.kind, EventKind::Task))
    else {
        return Err(ApiError::new(
            ErrorCode::AppendNotFound,
            format!("task `{task_id}` does not exist in this file"),
        ));
    };

    // Closing the read-side gap explicitly: at most one unresolved active
    // claim per task, checked inside the write transaction.
    match derive::task_status(appends, task, now).status {
        TaskStatus::Claimed => {
            return Err(ApiError::new(
                ErrorCode::InvalidRequest,
                format!("task `{task_id}` already has an active claim"),
            ));
        }
        TaskStatus::Completed | TaskStatus::Cancelled => {
            return Err(ApiError::new(
                ErrorCode::InvalidRequest,
                format!("task `{task_id}` is already resolved"),
            ));
        }
        TaskStatus::Pending | TaskStatus::Stalled => {}
    }

    if let Some(limit) = key.wip_limit {
        let active = count_active_claims_for_author(conn, &file.workspace_id, author, now)
            .map_err(crate::error::storage_error)?;
        if active >= limit {
            return Err(ApiError::new(
                ErrorCode::InvalidRequest,
                format!("WIP limit of {limit} active claims reached"),
            ));
        }
    }

    Ok(())
}

/// Find a file by workspace and normalized path.
pub fn find_file(conn: &Connection, workspace_id: &str, path: &str) -> Result<Option<FileRow>> {
    conn.query_row(
        "SELECT id, workspace_id, path, content, created_at, updated_at \
         FROM files WHERE workspace_id = ?1 AND path = ?2 AND deleted_at IS NULL",
        params![workspace_id, path],
        file_from_row,
    )
    .optional()
    .context("failed to query file")?
    .transpose()
}

fn file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<FileRow>> {
    let tuple = (
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, String>(2)?,
        row.get::<_, String>(3)?,
        row.get::<_, String>(4)?,
        row.get::<_, String>(5)?,
    );
    let (id, workspace_id, path, content, created_raw, updated_raw) = tuple;
    Ok((|| -> Result<FileRow> {
        Ok(FileRow {
            id,
            workspace_id,
            path,
            content,
            created_at: parse_ts(&created_raw)?,
            updated_at: parse_ts(&updated_raw)?,
        })
    })())
}

/// Find a file (or create it) for an append that targets a fresh path.
///
/// The `(workspace_id, path)` unique index is the only create-race
/// primitive: when two concurrent appends race on a new path, exactly one
/// insert is admitted and the loser re-reads the winner's row.
pub fn ensure_file(
    conn: &Connection,
    workspace_id: &str,
    path: &str,
    now: DateTime<Utc>,
) -> Result<FileRow> {
    if let Some(existing) = find_file(conn, workspace_id, path)? {
        return Ok(existing);
    }

    let file = FileRow {
        id: Uuid::new_v4().to_string(),
        workspace_id: workspace_id.to_string(),
        path: path.to_string(),
        content: String::new(),
        created_at: now,
        updated_at: now,
    };

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO files (id, workspace_id, path, content, created_at, updated_at) \
         VALUES (?1, ?2, ?3, '', ?4, ?4)",
        params![file.id, file.workspace_id, file.path, now.to_rfc3339()],
    )
    .context("failed to insert file")?;

    if inserted == 0 {
        // Lost the create race; the unique index admitted the other writer.
        return find_file(conn, workspace_id, path)?
            .context("file vanished after losing create race");
    }

    Ok(file)
}

/// All appends for a file, oldest first.
pub fn load_appends(conn: &Connection, file_id: &str) -> Result<Vec<AppendRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, file_id, append_id, author, type, ref, status, priority, labels, \
                    due_at, expires_at, created_at, content_preview, content_hash \
             FROM appends WHERE file_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .context("failed to prepare append query")?;

    let rows = stmt
        .query_map(params![file_id], append_from_row)
        .context("failed to query appends")?;

    let mut appends = Vec::new();
    for row in rows {
        appends.push(row.context("failed to decode append row")??);
    }
    Ok(appends)
}

/// Find one append by its human-visible id within a file.
pub fn find_append(conn: &Connection, file_id: &str, append_id: &str) -> Result<Option<AppendRow>> {
    conn.query_row(
        "SELECT id, file_id, append_id, author, type, ref, status, priority, labels, \
                due_at, expires_at, created_at, content_preview, content_hash \
         FROM appends WHERE file_id = ?1 AND append_id = ?2",
        params![file_id, append_id],
        append_from_row,
    )
    .optional()
    .context("failed to query append")?
    .transpose()
}

/// The one sanctioned in-place mutation: extend a claim's deadline.
pub fn extend_claim_expiry(
    conn: &Connection,
    row_id: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE appends SET expires_at = ?2 WHERE id = ?1",
            params![row_id, expires_at.to_rfc3339()],
        )
        .context("failed to extend claim expiry")?;
    anyhow::ensure!(changed == 1, "claim row `{row_id}` not found for expiry extension");
    Ok(())
}

/// Upsert an agent's liveness row.
pub fn upsert_heartbeat(
    conn: &Connection,
    workspace_id: &str,
    author: &str,
    status: Option<&str>,
    current_task: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO heartbeats (workspace_id, author, status, current_task, seen_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(workspace_id, author) DO UPDATE SET \
           status = excluded.status, \
           current_task = excluded.current_task, \
           seen_at = excluded.seen_at",
        params![workspace_id, author, status, current_task, now.to_rfc3339()],
    )
    .context("failed to upsert heartbeat")?;
    Ok(())
}

fn count_active_claims_for_author(
    conn: &Connection,
    workspace_id: &str,
    author: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    // A storage-`active` claim counts against WIP while unexpired and not
    // yet responded to or cancelled.
    conn.query_row(
        "SELECT COUNT(*) \
         FROM appends AS c \
         INNER JOIN files AS f ON f.id = c.file_id \
         WHERE f.workspace_id = ?1 \
           AND c.type = 'claim' AND c.status = 'active' AND c.author = ?2 \
           AND c.expires_at > ?3 \
           AND NOT EXISTS ( \
               SELECT 1 FROM appends AS r \
               WHERE r.file_id = c.file_id \
                 AND r.type IN ('response', 'cancel') \
                 AND r.ref = c.append_id)",
        params![workspace_id, author, now.to_rfc3339()],
        |row| row.get(0),
    )
    .context("failed to count active claims")
}

fn insert_append(conn: &Connection, row: &AppendRow) -> Result<()> {
    let labels_json = if row.labels.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&row.labels).context("failed to encode labels")?)
    };

    conn.execute(
        "INSERT INTO appends \
         (id, file_id, append_id, author, type, ref, status, priority, labels, due_at, \
          expires_at, created_at, content_preview, content_hash) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            row.id,
            row.file_id,
            row.append_id,
            row.author,
            row.kind.as_str(),
            row.ref_id.as_deref(),
            row.status.as_deref(),
            row.priority.as_deref(),
            labels_json.as_deref(),
            row.due_at.map(|t| t.to_rfc3339()),
            row.expires_at.map(|t| t.to_rfc3339()),
            row.created_at.to_rfc3339(),
            row.content_preview,
            row.content_hash.as_deref(),
        ],
    )
    .context("failed to insert append")?;
    Ok(())
}

fn write_file_content(
    conn: &Connection,
    file_id: &str,
    content: &str,
    grown_by: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE files SET content = ?2, updated_at = ?3 WHERE id = ?1",
        params![file_id, content, now.to_rfc3339()],
    )
    .context("failed to update file content")?;
    conn.execute(
        "UPDATE workspaces SET storage_used = storage_used + ?2 \
         WHERE id = (SELECT workspace_id FROM files WHERE id = ?1)",
        params![file_id, grown_by],
    )
    .context("failed to update workspace storage counter")?;
    Ok(())
}

fn next_append_id(conn: &Connection, file_id: &str) -> Result<String> {
    conn.execute(
        "INSERT INTO append_counters (file_id, next) VALUES (?1, 1) \
         ON CONFLICT(file_id) DO NOTHING",
        params![file_id],
    )
    .context("failed to seed append counter")?;

    let next: i64 = conn
        .query_row("SELECT next FROM append_counters WHERE file_id = ?1", params![file_id], |row| {
            row.get(0)
        })
        .context("failed to read append counter")?;

    conn.execute(
        "UPDATE append_counters SET next = next + 1 WHERE file_id = ?1",
        params![file_id],
    )
    .context("failed to advance append counter")?;

    Ok(format!("a{next}"))
}

fn preview_of(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= PREVIEW_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().take(PREVIEW_CHARS).collect()
}

/// Hash of the full file body at append time, used to detect staleness
/// after a later full-file rewrite.
fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

type AppendRowTuple = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<String>,
);

fn append_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<AppendRow>> {
    let tuple: AppendRowTuple = (
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    );
    Ok(decode_append_row(tuple))
}

fn decode_append_row(tuple: AppendRowTuple) -> Result<AppendRow> {
    let (
        id,
        file_id,
        append_id,
        author,
        kind_raw,
        ref_id,
        status,
        priority,
        labels_raw,
        due_raw,
        expires_raw,
        created_raw,
        content_preview,
        content_hash,
    ) = tuple;

    let labels = decode_labels_or_default(labels_raw.as_deref());

    Ok(AppendRow {
        id,
        file_id,
        append_id,
        author,
        kind: EventKind::parse(&kind_raw),
        ref_id,
        status,
        priority,
        labels,
        due_at: due_raw.as_deref().map(parse_ts).transpose()?,
        expires_at: expires_raw.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(&created_raw)?,
        content_preview,
        content_hash,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .with_context(|| format!("invalid timestamp `{raw}` in stored row"))
}

/// Decode a stored labels JSON array, tolerating rows written before the
/// column was validated.
pub fn decode_labels_or_default(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(labels) => labels,
        Err(error) => {
            tracing::warn!(error = ?error, "ignoring malformed labels column");
            Vec::new()
        }
    }
}

/// JSON payload describing an append for WebSocket event frames.
pub fn append_event_payload(file: &FileRow, row: &AppendRow) -> serde_json::Value {
    json!({
        "appendId": row.append_id,
        "path": file.path,
        "author": row.author,
        "type": row.kind.as_str(),
        "ref": row.ref_id,
        "createdAt": row.created_at.to_rfc3339(),
        "preview": row.content_preview,
    })
}
