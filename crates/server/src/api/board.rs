// Board query endpoints: `GET /r/{key}/orchestration` and the admin
// variant `GET /w/{key}/orchestration`.

use std::collections::HashSet;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use handoff_common::path::normalize_folder;
use handoff_common::types::{TaskStatus, Tier};

use crate::api::AppState;
use crate::auth;
use crate::board::{build_board, BoardFilters, Cursor, DEFAULT_LIMIT, MAX_LIMIT};
use crate::error::{ok_envelope, ApiError, ErrorCode};

/// Raw query parameters. Everything is a string so that validation failures
/// surface as envelope errors instead of bare extractor rejections.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardQuery {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub agent: Option<String>,
    pub file: Option<String>,
    pub folder: Option<String>,
    pub since: Option<String>,
    pub limit: Option<String>,
    pub cursor: Option<String>,
    pub stale_seconds: Option<String>,
}

pub async fn read_board(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<BoardQuery>,
) -> Result<Json<Value>, ApiError> {
    board_response(&state, &key, &query, Tier::Read, false)
}

pub async fn admin_board(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<BoardQuery>,
) -> Result<Json<Value>, ApiError> {
    board_response(&state, &key, &query, Tier::Write, true)
}

fn board_response(
    state: &AppState,
    raw_key: &str,
    query: &BoardQuery,
    required: Tier,
    admin: bool,
) -> Result<Json<Value>, ApiError> {
    let filters = parse_filters(query, state.limits.stale_agent_seconds)?;
    let now = Utc::now();

    let conn = state.db.lock();
    let key = auth::authorize(&conn, raw_key, required, now)?;
    let board = build_board(&conn, &key, &filters, admin, now)?;

    let data = serde_json::to_value(board).map_err(|error| {
        crate::error::storage_error(anyhow::Error::new(error).context("board serialization"))
    })?;
    Ok(ok_envelope(data))
}

fn parse_filters(query: &BoardQuery, default_stale: i64) -> Result<BoardFilters, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(parse_status_set)
        .transpose()?;

    let priority = query.priority.as_deref().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(ToOwned::to_owned)
            .collect::<HashSet<String>>()
    });

    let folder = query
        .folder
        .as_deref()
        .map(|raw| {
            normalize_folder(raw)
                .map_err(|error| ApiError::new(ErrorCode::InvalidRequest, error.to_string()))
        })
        .transpose()?;

    let since = query
        .since
        .as_deref()
        .map(|raw| {
            raw.parse::<DateTime<Utc>>().map_err(|_| {
                ApiError::new(ErrorCode::InvalidRequest, "since must be an RFC 3339 timestamp")
            })
        })
        .transpose()?;

    let limit = match query.limit.as_deref() {
        None => DEFAULT_LIMIT,
        Some(raw) => {
            let parsed: usize = raw.parse().map_err(|_| {
                ApiError::new(ErrorCode::InvalidRequest, "limit must be a positive integer")
            })?;
            if parsed == 0 || parsed > MAX_LIMIT {
                return Err(ApiError::new(
                    ErrorCode::InvalidRequest,
                    format!("limit must be between 1 and {MAX_LIMIT}"),
                ));
            }
            parsed
        }
    };

    let cursor = query.cursor.as_deref().map(Cursor::decode).transpose()?;

    let stale_after_seconds = match query.stale_seconds.as_deref() {
        None => default_stale,
        Some(raw) => raw.parse::<i64>().map_err(|_| {
            ApiError::new(ErrorCode::InvalidRequest, "staleSeconds must be an integer")
        })?,
    };

    Ok(BoardFilters {
        status,
        priority,
        agent: query.agent.clone().filter(|a| !a.is_empty()),
        file: query.file.clone().filter(|f| !f.is_empty()),
        folder,
        since,
        limit,
        cursor,
        stale_after_seconds,
    })
}

fn parse_status_set(raw: &str) -> Result<HashSet<TaskStatus>, ApiError> {
    let mut statuses = HashSet::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let status = TaskStatus::parse(part).ok_or_else(|| {
            ApiError::new(ErrorCode::InvalidRequest, format!("unknown status `{part}`"))
        })?;
        statuses.insert(status);
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use handoff_common::types::TaskStatus;

    use super::{parse_filters, BoardQuery};
    use crate::error::ErrorCode;

    #[test]
    fn defaults_apply_when_no_params() {
        let filters = parse_filters(&BoardQuery::default(), 300).expect("defaults should parse");
        assert_eq!(filters.limit, 50);
        assert_eq!(filters.stale_after_seconds, 300);
        assert!(filters.status.is_none());
        assert!(filters.cursor.is_none());
    }

    #[test]
    fn status_list_parses_and_rejects_unknown() {
        let query = BoardQuery { status: Some("pending, stalled".to_string()), ..Default::default() };
        let filters = parse_filters(&query, 300).expect("statuses should parse");
        let statuses = filters.status.expect("status set should be present");
        assert!(statuses.contains(&TaskStatus::Pending));
        assert!(statuses.contains(&TaskStatus::Stalled));
        assert_eq!(statuses.len(), 2);

        let bad = BoardQuery { status: Some("pending,bogus".to_string()), ..Default::default() };
        let error = parse_filters(&bad, 300).expect_err("unknown status must be rejected");
        assert_eq!(error.code(), ErrorCode::InvalidRequest);
    }

    #[test]
    fn limit_bounds_are_enforced() {
        for (raw, ok) in [("1", true), ("1000", true), ("0", false), ("1001", false), ("x", false)]
        {
            let query = BoardQuery { limit: Some(raw.to_string()), ..Default::default() };
            assert_eq!(parse_filters(&query, 300).is_ok(), ok, "limit `{raw}`");
        }
    }

    #[test]
    fn folder_is_normalized_with_trailing_slash_stripped() {
        let query = BoardQuery { folder: Some("/tasks/".to_string()), ..Default::default() };
        let filters = parse_filters(&query, 300).expect("folder should parse");
        assert_eq!(filters.folder.as_deref(), Some("/tasks"));

        let bad = BoardQuery { folder: Some("/tasks/../x".to_string()), ..Default::default() };
        assert!(parse_filters(&bad, 300).is_err(), "traversal folder must be rejected");
    }

    #[test]
    fn since_must_be_rfc3339() {
        let good =
            BoardQuery { since: Some("2026-02-07T00:00:00Z".to_string()), ..Default::default() };
        assert!(parse_filters(&good, 300).is_ok());

        let bad = BoardQuery { since: Some("yesterday".to_string()), ..Default::default() };
        assert!(parse_filters(&bad, 300).is_err());
    }
}
