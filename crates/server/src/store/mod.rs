// SQLite store: schema migrations and the shared connection handle.
//
// One embedded database per workspace-hosting process, in WAL mode. All
// access goes through a single connection behind a mutex; every query is a
// bounded single-pass statement with bound parameters.

pub mod workspaces;

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE workspaces (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    claimed_at      TEXT NULL,
    deleted_at      TEXT NULL,
    storage_used    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE capability_keys (
    id              TEXT PRIMARY KEY,
    workspace_id    TEXT NOT NULL,
    key_hash        TEXT NOT NULL UNIQUE,
    permission      TEXT NOT NULL CHECK (permission IN ('read', 'append', 'write')),
    scope_type      TEXT NOT NULL CHECK (scope_type IN ('workspace', 'folder', 'file')),
    scope_path      TEXT NULL,
    bound_author    TEXT NULL,
    wip_limit       INTEGER NULL,
    allowed_types   TEXT NULL,
    expires_at      TEXT NULL,
    revoked_at      TEXT NULL,
    last_used_at    TEXT NULL,
    created_at      TEXT NOT NULL,
    CHECK (scope_type = 'workspace' OR (scope_path IS NOT NULL AND scope_path != ''))
);

CREATE TABLE files (
    id              TEXT PRIMARY KEY,
    workspace_id    TEXT NOT NULL,
    path            TEXT NOT NULL,
    content         TEXT NOT NULL DEFAULT '',
    settings        TEXT NULL,
    deleted_at      TEXT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    UNIQUE (workspace_id, path)
);

CREATE TABLE appends (
    id              TEXT PRIMARY KEY,
    file_id         TEXT NOT NULL,
    append_id       TEXT NOT NULL,
    author          TEXT NOT NULL,
    type            TEXT NOT NULL,
    ref             TEXT NULL,
    status          TEXT NULL,
    priority        TEXT NULL,
    labels          TEXT NULL,
    due_at          TEXT NULL,
    expires_at      TEXT NULL,
    created_at      TEXT NOT NULL,
    content_preview TEXT NOT NULL DEFAULT '',
    content_hash    TEXT NULL,
    UNIQUE (file_id, append_id)
);

CREATE INDEX appends_file_type_idx ON appends (file_id, type);
CREATE INDEX appends_file_ref_idx ON appends (file_id, ref);
CREATE INDEX appends_created_idx ON appends (created_at, id);

CREATE TABLE append_counters (
    file_id         TEXT PRIMARY KEY,
    next            INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE heartbeats (
    workspace_id    TEXT NOT NULL,
    author          TEXT NOT NULL,
    status          TEXT NULL,
    current_task    TEXT NULL,
    seen_at         TEXT NOT NULL,
    PRIMARY KEY (workspace_id, author)
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

/// The embedded store handle shared by every request handler.
#[derive(Debug)]
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database parent directory `{}`", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at `{}`", path.display()))?;
        Self::init(conn)
    }

    /// In-memory database for deterministic tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            ",
        )
        .context("failed to configure sqlite pragmas")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Borrow the connection. Held only for bounded, synchronous statements —
    /// never across an await point.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&self.lock())
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}
