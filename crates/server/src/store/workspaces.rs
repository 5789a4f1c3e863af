// Workspace rows: bootstrap creation and soft-delete.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRow {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub storage_used: i64,
}

pub fn create_workspace(conn: &Connection, name: &str, now: DateTime<Utc>) -> Result<WorkspaceRow> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO workspaces (id, name, created_at) VALUES (?1, ?2, ?3)",
        params![id, name, now.to_rfc3339()],
    )
    .context("failed to insert workspace")?;

    Ok(WorkspaceRow {
        id,
        name: name.to_string(),
        created_at: now,
        claimed_at: None,
        deleted_at: None,
        storage_used: 0,
    })
}

pub fn find_workspace(conn: &Connection, workspace_id: &str) -> Result<Option<WorkspaceRow>> {
    conn.query_row(
        "SELECT id, name, created_at, claimed_at, deleted_at, storage_used \
         FROM workspaces WHERE id = ?1",
        params![workspace_id],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        },
    )
    .optional()
    .context("failed to query workspace")?
    .map(|(id, name, created_raw, claimed_raw, deleted_raw, storage_used)| {
        Ok(WorkspaceRow {
            id,
            name,
            created_at: parse_ts(&created_raw)?,
            claimed_at: claimed_raw.as_deref().map(parse_ts).transpose()?,
            deleted_at: deleted_raw.as_deref().map(parse_ts).transpose()?,
            storage_used,
        })
    })
    .transpose()
}

pub fn soft_delete_workspace(
    conn: &Connection,
    workspace_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE workspaces SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![workspace_id, now.to_rfc3339()],
        )
        .context("failed to soft-delete workspace")?;
    Ok(changed > 0)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .with_context(|| format!("invalid timestamp `{raw}` in workspace row"))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{create_workspace, find_workspace, soft_delete_workspace};
    use crate::store::Db;

    fn ts(seconds: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).single().expect("timestamp should be valid")
    }

    #[test]
    fn create_and_reload_round_trips() {
        let db = Db::open_in_memory().expect("db should open");
        let conn = db.lock();
        let now = ts(1_700_000_000);

        let created = create_workspace(&conn, "alpha", now).expect("workspace should be created");
        let loaded = find_workspace(&conn, &created.id)
            .expect("lookup should succeed")
            .expect("workspace should exist");

        assert_eq!(loaded, created);
    }

    #[test]
    fn soft_delete_marks_without_removing() {
        let db = Db::open_in_memory().expect("db should open");
        let conn = db.lock();
        let now = ts(1_700_000_100);

        let ws = create_workspace(&conn, "beta", now).expect("workspace should be created");
        assert!(soft_delete_workspace(&conn, &ws.id, now).expect("delete should succeed"));
        // second delete is a no-op
        assert!(!soft_delete_workspace(&conn, &ws.id, now).expect("delete should succeed"));

        let loaded = find_workspace(&conn, &ws.id)
            .expect("lookup should succeed")
            .expect("row should still exist");
        assert_eq!(loaded.deleted_at, Some(now));
    }
}
