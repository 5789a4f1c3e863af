// Capability-key authorization.
//
// A capability key is a bearer secret embedded in the URL path. Only its
// sha256 hash is stored. Authorization is a pure lookup: hash the presented
// string, load the record, and fail closed with one generic not-found error
// for every invalid case — unknown hash, expired, revoked, insufficient
// tier, or deleted workspace — so key existence and tier can never be
// probed. The sole side effect is a best-effort `last_used_at` touch.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use handoff_common::path::scope_contains;
use handoff_common::types::{ScopeType, Tier};

use crate::error::{ApiError, ErrorCode};

/// A stored capability key record (the raw secret is never persisted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityKey {
    pub id: String,
    pub workspace_id: String,
    pub key_hash: String,
    pub permission: Tier,
    pub scope_type: ScopeType,
    pub scope_path: Option<String>,
    pub bound_author: Option<String>,
    pub wip_limit: Option<i64>,
    pub allowed_types: Option<Vec<String>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CapabilityKey {
    /// The path prefix this key is restricted to; `/` means the whole
    /// workspace.
    pub fn effective_scope(&self) -> &str {
        match self.scope_type {
            ScopeType::Workspace => "/",
            ScopeType::Folder | ScopeType::File => self.scope_path.as_deref().unwrap_or("/"),
        }
    }

    /// Whether this key may touch the given normalized path.
    pub fn permits_path(&self, path: &str) -> bool {
        match self.scope_type {
            ScopeType::Workspace => true,
            ScopeType::Folder => scope_contains(self.effective_scope(), path),
            ScopeType::File => self.scope_path.as_deref() == Some(path),
        }
    }

    /// Whether this key may write the given append type.
    pub fn permits_type(&self, kind: &str) -> bool {
        match &self.allowed_types {
            None => true,
            Some(allowed) => allowed.iter().any(|t| t == kind),
        }
    }

    /// Short hash prefix safe for logs. Raw keys are never logged.
    pub fn log_id(&self) -> &str {
        &self.key_hash[..self.key_hash.len().min(8)]
    }
}

/// Issuance parameters for a new key.
#[derive(Debug, Clone, Default)]
pub struct KeySpec {
    pub scope_path: Option<String>,
    pub bound_author: Option<String>,
    pub wip_limit: Option<i64>,
    pub allowed_types: Option<Vec<String>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Hash a presented key string the way stored records are hashed.
pub fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Generate a fresh capability secret (32 random bytes, base64url).
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Issue a key and return the raw secret alongside the stored record.
///
/// The raw secret is shown exactly once — only its hash survives.
pub fn issue_key(
    conn: &Connection,
    workspace_id: &str,
    permission: Tier,
    scope_type: ScopeType,
    spec: KeySpec,
    now: DateTime<Utc>,
) -> Result<(String, CapabilityKey)> {
    let raw = generate_secret();
    let key = CapabilityKey {
        id: Uuid::new_v4().to_string(),
        workspace_id: workspace_id.to_string(),
        key_hash: hash_key(&raw),
        permission,
        scope_type,
        scope_path: spec.scope_path,
        bound_author: spec.bound_author,
        wip_limit: spec.wip_limit,
        allowed_types: spec.allowed_types,
        expires_at: spec.expires_at,
        revoked_at: None,
        created_at: now,
    };

    let allowed_types_json = key
        .allowed_types
        .as_ref()
        .map(|types| serde_json::to_string(types).context("failed to encode allowed_types"))
        .transpose()?;

    conn.execute(
        "INSERT INTO capability_keys \
         (id, workspace_id, key_hash, permission, scope_type, scope_path, bound_author, \
          wip_limit, allowed_types, expires_at, revoked_at, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11)",
        params![
            key.id,
            key.workspace_id,
            key.key_hash,
            key.permission.as_str(),
            key.scope_type.as_str(),
            key.scope_path.as_deref(),
            key.bound_author.as_deref(),
            key.wip_limit,
            allowed_types_json.as_deref(),
            key.expires_at.map(|t| t.to_rfc3339()),
            key.created_at.to_rfc3339(),
        ],
    )
    .context("failed to insert capability key")?;

    Ok((raw, key))
}

/// Revoke a key in place. The row is never deleted so audit history and
/// idempotency keys referencing it stay valid.
pub fn revoke_key(conn: &Connection, key_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE capability_keys SET revoked_at = ?2 WHERE id = ?1 AND revoked_at IS NULL",
            params![key_id, now.to_rfc3339()],
        )
        .context("failed to revoke capability key")?;
    Ok(changed > 0)
}

/// Authorize a presented key for a required tier.
///
/// Every failure is the same generic 404-shaped error; see module docs.
pub fn authorize(
    conn: &Connection,
    raw_key: &str,
    required: Tier,
    now: DateTime<Utc>,
) -> Result<CapabilityKey, ApiError> {
    let key = match lookup_live_key(conn, &hash_key(raw_key), now) {
        Ok(found) => found,
        Err(error) => return Err(crate::error::storage_error(error)),
    };

    match key {
        Some(key) if key.permission.allows(required) => {
            touch_last_used(conn, &key.id, now);
            Ok(key)
        }
        // Insufficient tier is deliberately indistinguishable from absence.
        _ => Err(ApiError::from_code(ErrorCode::NotFound)),
    }
}

/// Load a key by hash if it is currently usable: not expired, not revoked,
/// workspace not soft-deleted.
pub fn lookup_live_key(
    conn: &Connection,
    key_hash: &str,
    now: DateTime<Utc>,
) -> Result<Option<CapabilityKey>> {
    let row = conn
        .query_row(
            "SELECT k.id, k.workspace_id, k.key_hash, k.permission, k.scope_type, k.scope_path, \
                    k.bound_author, k.wip_limit, k.allowed_types, k.expires_at, k.revoked_at, \
                    k.created_at \
             FROM capability_keys AS k \
             INNER JOIN workspaces AS w ON w.id = k.workspace_id \
             WHERE k.key_hash = ?1 AND w.deleted_at IS NULL",
            params![key_hash],
            key_from_row,
        )
        .optional()
        .context("failed to query capability key")?;

    let Some(key) = row else {
        return Ok(None);
    };
    let key = key?;

    if key.revoked_at.is_some() {
        return Ok(None);
    }
    if key.expires_at.is_some_and(|expires| expires <= now) {
        return Ok(None);
    }

    Ok(Some(key))
}

/// Load a key by hash regardless of liveness, with its revocation marker.
///
/// Used by the WebSocket upgrade to distinguish a revoked key (close 4003)
/// from a merely unknown one (close 4002).
pub fn lookup_key_any(conn: &Connection, key_hash: &str) -> Result<Option<CapabilityKey>> {
    conn.query_row(
        "SELECT id, workspace_id, key_hash, permission, scope_type, scope_path, bound_author, \
                wip_limit, allowed_types, expires_at, revoked_at, created_at \
         FROM capability_keys WHERE key_hash = ?1",
        params![key_hash],
        key_from_row,
    )
    .optional()
    .context("failed to query capability key")?
    .transpose()
}

fn touch_last_used(conn: &Connection, key_id: &str, now: DateTime<Utc>) {
    // Best-effort: a failed touch must never fail the request.
    let result = conn.execute(
        "UPDATE capability_keys SET last_used_at = ?2 WHERE id = ?1",
        params![key_id, now.to_rfc3339()],
    );
    if let Err(error) = result {
        tracing::warn!(error = ?error, "failed to touch capability key last_used_at");
    }
}

type KeyRowTuple = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

fn key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<CapabilityKey>> {
    let tuple: KeyRowTuple = (
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
    );
    Ok(decode_key_row(tuple))
}

fn decode_key_row(tuple: KeyRowTuple) -> Result<CapabilityKey> {
    let (
        id,
        workspace_id,
        key_hash,
        permission_raw,
        scope_type_raw,
        scope_path,
        bound_author,
        wip_limit,
        allowed_types_raw,
        expires_raw,
        revoked_raw,
        created_raw,
    ) = tuple;

    let permission = Tier::parse(&permission_raw)
        .with_context(|| format!("invalid permission `{permission_raw}` in key row"))?;
    let scope_type = ScopeType::parse(&scope_type_raw)
        .with_context(|| format!("invalid scope_type `{scope_type_raw}` in key row"))?;
    let allowed_types = allowed_types_raw
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<Vec<String>>(raw)
                .with_context(|| format!("invalid allowed_types `{raw}` in key row"))
        })
        .transpose()?;

    Ok(CapabilityKey {
        id,
        workspace_id,
        key_hash,
        permission,
        scope_type,
        scope_path,
        bound_author,
        wip_limit,
        allowed_types,
        expires_at: expires_raw.as_deref().map(parse_ts).transpose()?,
        revoked_at: revoked_raw.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(&created_raw)?,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .with_context(|| format!("invalid timestamp `{raw}` in capability key row"))
}
