// Subscription token issuance:
// `GET /r|/a|/w/{key}/ops/subscribe[?path=…]`.
//
// Issues a short-lived single-use token plus the WebSocket URL to redeem
// it. The route prefix sets the minimum tier; the event set is always the
// key's own tier. Folder-scoped requests accept a `path` narrower than the
// key's scope; traversal segments are rejected with `INVALID_PATH`.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use handoff_common::path::{normalize_folder, scope_contains};
use handoff_common::types::{ScopeType, Tier};

use crate::api::AppState;
use crate::auth::{self, CapabilityKey};
use crate::bus::events_for_tier;
use crate::error::{ok_envelope, ApiError, ErrorCode};
use crate::ws::token::TOKEN_TTL_SECONDS;

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeQuery {
    pub path: Option<String>,
}

pub async fn subscribe_read(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SubscribeQuery>,
) -> Result<Json<Value>, ApiError> {
    issue_token(&state, &key, &query, Tier::Read)
}

pub async fn subscribe_append(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SubscribeQuery>,
) -> Result<Json<Value>, ApiError> {
    issue_token(&state, &key, &query, Tier::Append)
}

pub async fn subscribe_write(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SubscribeQuery>,
) -> Result<Json<Value>, ApiError> {
    issue_token(&state, &key, &query, Tier::Write)
}

fn issue_token(
    state: &AppState,
    raw_key: &str,
    query: &SubscribeQuery,
    required: Tier,
) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();

    let key = {
        let conn = state.db.lock();
        auth::authorize(&conn, raw_key, required, now)?
    };

    state.limiter.check(&key.key_hash, now).map_err(|retry_after| {
        ApiError::from_code(ErrorCode::RateLimited)
            .with_details(json!({ "retryAfterSeconds": retry_after }))
    })?;

    let scope = effective_subscription_scope(&key, query.path.as_deref())?;

    let (token, claims) = state
        .tokens
        .issue(&key, &scope, now)
        .map_err(crate::error::storage_error)?;

    Ok(ok_envelope(json!({
        "token": token,
        "wsUrl": format!("{}/ws?token={token}", state.ws_base_url),
        "expiresInSeconds": TOKEN_TTL_SECONDS,
        "scope": claims.scope,
        "events": events_for_tier(key.permission),
    })))
}

/// Resolve the scope a connection will be bound to: the key's own scope,
/// optionally narrowed by a requested folder path.
fn effective_subscription_scope(
    key: &CapabilityKey,
    requested: Option<&str>,
) -> Result<String, ApiError> {
    let Some(requested) = requested.filter(|path| !path.is_empty()) else {
        return Ok(key.effective_scope().to_string());
    };

    let normalized = normalize_folder(requested)
        .map_err(|error| ApiError::new(ErrorCode::InvalidPath, error.to_string()))?;

    let inside = match key.scope_type {
        ScopeType::Workspace => true,
        ScopeType::Folder => scope_contains(key.effective_scope(), &normalized),
        ScopeType::File => key.effective_scope() == normalized,
    };
    if !inside {
        return Err(ApiError::new(
            ErrorCode::InvalidPath,
            "path is outside this key's scope",
        ));
    }

    Ok(normalized)
}
