// The orchestration query engine.
//
// Assembles a consistent board view — summary, tasks, live claims, agents,
// workload, pagination — from the append log under caller-supplied filters.
// Path-shaped filter values reach SQL strictly as bound parameters; the
// status/priority/agent filters apply after derivation, which cannot be
// expressed in SQL because status is never stored.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{types::Value as SqlValue, Connection};

use handoff_common::types::{
    AgentPresence, Board, BoardSummary, DerivedClaim, DerivedTask, EventKind, Pagination,
    ScopeType, TaskStatus, WorkloadEntry,
};

use crate::appends::{decode_labels_or_default, AppendRow};
use crate::auth::CapabilityKey;
use crate::derive;
use crate::error::{ApiError, ErrorCode};

/// Hard ceiling on page size.
pub const MAX_LIMIT: usize = 1000;
/// Default page size.
pub const DEFAULT_LIMIT: usize = 50;
/// Default staleness threshold for agent heartbeats.
pub const DEFAULT_STALE_SECONDS: i64 = 300;

/// Parsed board filters. Construction validates everything up front so the
/// query itself cannot fail on user input.
#[derive(Debug, Clone)]
pub struct BoardFilters {
    pub status: Option<HashSet<TaskStatus>>,
    pub priority: Option<HashSet<String>>,
    pub agent: Option<String>,
    pub file: Option<String>,
    pub folder: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
    pub cursor: Option<Cursor>,
    pub stale_after_seconds: i64,
}

impl Default for BoardFilters {
    fn default() -> Self {
        Self {
            status: None,
            priority: None,
            agent: None,
            file: None,
            folder: None,
            since: None,
            limit: DEFAULT_LIMIT,
            cursor: None,
            stale_after_seconds: DEFAULT_STALE_SECONDS,
        }
    }
}

/// Composite keyset cursor: `(created_at, append row id)`, newest-first.
/// Opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub append_id: String,
}

impl Cursor {
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}|{}", self.created_at.to_rfc3339(), self.append_id))
    }

    pub fn decode(raw: &str) -> Result<Self, ApiError> {
        let invalid = || ApiError::new(ErrorCode::InvalidRequest, "cursor is invalid");

        let bytes = URL_SAFE_NO_PAD.decode(raw).map_err(|_| invalid())?;
        let text = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (created_raw, append_id) = text.split_once('|').ok_or_else(invalid)?;
        let created_at = created_raw.parse::<DateTime<Utc>>().map_err(|_| invalid())?;

        if append_id.is_empty() {
            return Err(invalid());
        }

        Ok(Self { created_at, append_id: append_id.to_string() })
    }

    fn is_after(&self, row: &AppendRow) -> bool {
        // Descending order: a row is on a later page when it sorts strictly
        // below the cursor position.
        (row.created_at, row.id.as_str()) < (self.created_at, self.append_id.as_str())
    }
}

/// Assemble the board for a capability key.
///
/// The write-tier (admin) variant is behaviorally identical except that
/// every claim is marked `canForceExpire`.
pub fn build_board(
    conn: &Connection,
    key: &CapabilityKey,
    filters: &BoardFilters,
    admin: bool,
    now: DateTime<Utc>,
) -> Result<Board, ApiError> {
    let by_file = load_scoped_appends(conn, key, filters).map_err(crate::error::storage_error)?;

    // Tasks, newest first across all files in scope.
    let mut task_rows: Vec<(&FileAppends, &AppendRow)> = Vec::new();
    for file in by_file.values() {
        for row in &file.appends {
            if !matches!(row.kind, EventKind::Task) {
                continue;
            }
            if let Some(since) = filters.since {
                if row.created_at < since {
                    continue;
                }
            }
            if let Some(priorities) = &filters.priority {
                match &row.priority {
                    Some(priority) if priorities.contains(priority) => {}
                    _ => continue,
                }
            }
            task_rows.push((file, row));
        }
    }
    task_rows.sort_by(|(_, a), (_, b)| {
        (b.created_at, b.id.as_str()).cmp(&(a.created_at, a.id.as_str()))
    });

    let mut summary = BoardSummary::default();
    let mut matching: Vec<(&AppendRow, DerivedTask)> = Vec::new();
    for (file, row) in task_rows {
        let mut task = derive::derive_task(&file.appends, row, &file.path, now);

        if let Some(statuses) = &filters.status {
            if !statuses.contains(&task.status) {
                continue;
            }
        }
        if let Some(agent) = &filters.agent {
            let claim_author = task.claim.as_ref().map(|claim| claim.author.as_str());
            if task.author != *agent && claim_author != Some(agent.as_str()) {
                continue;
            }
        }

        if admin {
            if let Some(claim) = task.claim.as_mut() {
                claim.can_force_expire = Some(true);
            }
        }

        summary.bump(task.status);
        matching.push((row, task));
    }

    // Keyset pagination over the filtered, ordered set.
    let start = match &filters.cursor {
        Some(cursor) => matching
            .iter()
            .position(|(row, _)| cursor.is_after(row))
            .unwrap_or(matching.len()),
        None => 0,
    };
    let page: Vec<(&AppendRow, DerivedTask)> =
        matching.drain(..).skip(start).take(filters.limit + 1).collect();

    let has_more = page.len() > filters.limit;
    let page = &page[..page.len().min(filters.limit)];
    let cursor = page.last().map(|(row, _)| {
        Cursor { created_at: row.created_at, append_id: row.id.clone() }.encode()
    });
    let tasks: Vec<DerivedTask> = page.iter().map(|(_, task)| task.clone()).collect();

    // Live claims across the scoped files, newest first.
    let mut claims: Vec<DerivedClaim> = Vec::new();
    for file in by_file.values() {
        for row in &file.appends {
            if !matches!(row.kind, EventKind::Claim) {
                continue;
            }
            if !derive::claim_is_live(&file.appends, row, now) {
                continue;
            }
            if let Some(agent) = &filters.agent {
                if row.author != *agent {
                    continue;
                }
            }
            let mut claim = derive::derive_claim(&file.appends, row, &file.path, now);
            if admin {
                claim.can_force_expire = Some(true);
            }
            claims.push(claim);
        }
    }
    claims.sort_by(|a, b| b.expires_at.cmp(&a.expires_at));

    let agents = load_agents(conn, &key.workspace_id, filters.stale_after_seconds, now)
        .map_err(crate::error::storage_error)?;
    let workload = build_workload(&by_file, now);

    Ok(Board {
        summary,
        tasks,
        claims,
        agents,
        workload,
        pagination: Pagination { has_more, cursor },
    })
}

struct FileAppends {
    path: String,
    appends: Vec<AppendRow>,
}

/// Load every append for files inside the key's scope and the caller's
/// folder/file filters, grouped by file. One bounded pass; all values bound.
fn load_scoped_appends(
    conn: &Connection,
    key: &CapabilityKey,
    filters: &BoardFilters,
) -> Result<BTreeMap<String, FileAppends>> {
    let mut sql = String::from(
        "SELECT a.id, a.file_id, a.append_id, a.author, a.type, a.ref, a.status, a.priority, \
                a.labels, a.due_at, a.expires_at, a.created_at, a.content_preview, \
                a.content_hash, f.path \
         FROM appends AS a \
         INNER JOIN files AS f ON f.id = a.file_id \
         WHERE f.workspace_id = ?1 AND f.deleted_at IS NULL",
    );
    let mut params: Vec<SqlValue> = vec![SqlValue::from(key.workspace_id.clone())];

    let push_folder_constraint = |sql: &mut String, params: &mut Vec<SqlValue>, folder: &str| {
        if folder == "/" {
            return;
        }
        params.push(SqlValue::from(folder.to_string()));
        let exact_idx = params.len();
        params.push(SqlValue::from(format!("{}/%", escape_like(folder))));
        let prefix_idx = params.len();
        sql.push_str(&format!(
            " AND (f.path = ?{exact_idx} OR f.path LIKE ?{prefix_idx} ESCAPE '\\')"
        ));
    };

    // Key scope constrains first; the caller's folder filter narrows further.
    match key.scope_type {
        ScopeType::Workspace => {}
        ScopeType::Folder => {
            push_folder_constraint(&mut sql, &mut params, key.effective_scope());
        }
        ScopeType::File => {
            params.push(SqlValue::from(key.effective_scope().to_string()));
            sql.push_str(&format!(" AND f.path = ?{}", params.len()));
        }
    }

    if let Some(folder) = &filters.folder {
        push_folder_constraint(&mut sql, &mut params, folder);
    }

    if let Some(fragment) = &filters.file {
        params.push(SqlValue::from(fragment.clone()));
        sql.push_str(&format!(" AND instr(f.path, ?{}) > 0", params.len()));
    }

    sql.push_str(" ORDER BY a.created_at ASC, a.id ASC");

    let mut stmt = conn.prepare(&sql).context("failed to prepare board append query")?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, String>(11)?,
                row.get::<_, String>(12)?,
                row.get::<_, Option<String>>(13)?,
                row.get::<_, String>(14)?,
            ))
        })
        .context("failed to query board appends")?;

    let mut by_file: BTreeMap<String, FileAppends> = BTreeMap::new();
    for row in rows {
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
            path,
        ) = row.context("failed to decode board append row")?;

        let append = AppendRow {
            id,
            file_id: file_id.clone(),
            append_id,
            author,
            kind: EventKind::parse(&kind_raw),
            ref_id,
            status,
            priority,
            labels: decode_labels_or_default(labels_raw.as_deref()),
            due_at: parse_ts_opt(due_raw.as_deref())?,
            expires_at: parse_ts_opt(expires_raw.as_deref())?,
            created_at: created_raw
                .parse::<DateTime<Utc>>()
                .with_context(|| format!("invalid timestamp `{created_raw}` in append row"))?,
            content_preview,
            content_hash,
        };

        by_file
            .entry(file_id)
            .or_insert_with(|| FileAppends { path, appends: Vec::new() })
            .appends
            .push(append);
    }

    Ok(by_file)
}

fn load_agents(
    conn: &Connection,
    workspace_id: &str,
    stale_after_seconds: i64,
    now: DateTime<Utc>,
) -> Result<Vec<AgentPresence>> {
    let mut stmt = conn
        .prepare(
            "SELECT author, status, current_task, seen_at \
             FROM heartbeats WHERE workspace_id = ?1 ORDER BY author ASC",
        )
        .context("failed to prepare heartbeat query")?;

    let rows = stmt
        .query_map([workspace_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .context("failed to query heartbeats")?;

    let threshold = now - Duration::seconds(stale_after_seconds);
    let mut agents = Vec::new();
    for row in rows {
        let (author, status, current_task, seen_raw) =
            row.context("failed to decode heartbeat row")?;
        let seen_at = seen_raw
            .parse::<DateTime<Utc>>()
            .with_context(|| format!("invalid timestamp `{seen_raw}` in heartbeat row"))?;
        agents.push(AgentPresence { author, status, current_task, seen_at, stale: seen_at < threshold });
    }

    Ok(agents)
}

fn build_workload(by_file: &BTreeMap<String, FileAppends>, now: DateTime<Utc>) -> Vec<WorkloadEntry> {
    let day_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now);

    let mut active: HashMap<String, i64> = HashMap::new();
    let mut completed: HashMap<String, i64> = HashMap::new();

    for file in by_file.values() {
        for row in &file.appends {
            match row.kind {
                EventKind::Claim => {
                    if derive::claim_is_live(&file.appends, row, now) {
                        *active.entry(row.author.clone()).or_default() += 1;
                    }
                }
                EventKind::Response => {
                    if row.created_at >= day_start {
                        *completed.entry(row.author.clone()).or_default() += 1;
                    }
                }
                _ => {}
            }
        }
    }

    let authors: HashSet<&String> = active.keys().chain(completed.keys()).collect();
    let mut workload: Vec<WorkloadEntry> = authors
        .into_iter()
        .map(|author| WorkloadEntry {
            author: author.clone(),
            active_claims: active.get(author).copied().unwrap_or(0),
            completed_today: completed.get(author).copied().unwrap_or(0),
        })
        .collect();
    workload.sort_by(|a, b| a.author.cmp(&b.author));
    workload
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn parse_ts_opt(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|value| {
        value
            .parse::<DateTime<Utc>>()
            .with_context(|| format!("invalid timestamp `{value}` in append row"))
    })
    .transpose()
}
