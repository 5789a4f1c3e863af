// `POST /a/{key}/heartbeat` — upsert the calling agent's liveness row.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use handoff_common::types::Tier;

use crate::api::{AppState, ValidatedJson};
use crate::appends::upsert_heartbeat;
use crate::auth;
use crate::error::{ok_envelope, ApiError, ErrorCode};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatBody {
    pub author: Option<String>,
    pub status: Option<String>,
    pub task: Option<String>,
}

pub async fn record_heartbeat(
    State(state): State<AppState>,
    Path(raw_key): Path<String>,
    ValidatedJson(body): ValidatedJson<HeartbeatBody>,
) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();

    let (workspace_id, author) = {
        let conn = state.db.lock();
        let key = auth::authorize(&conn, &raw_key, Tier::Append, now)?;

        let author = match (&key.bound_author, &body.author) {
            (Some(bound), _) => bound.clone(),
            (None, Some(author)) if !author.is_empty() => author.clone(),
            _ => {
                return Err(ApiError::new(ErrorCode::InvalidRequest, "author is required"));
            }
        };

        upsert_heartbeat(
            &conn,
            &key.workspace_id,
            &author,
            body.status.as_deref(),
            body.task.as_deref(),
            now,
        )
        .map_err(crate::error::storage_error)?;

        (key.workspace_id, author)
    };

    state.bus.publish(
        &workspace_id,
        "heartbeat.updated",
        "/",
        json!({
            "author": author,
            "status": body.status,
            "task": body.task,
            "seenAt": now.to_rfc3339(),
        }),
    );

    Ok(ok_envelope(json!({ "author": author, "seenAt": now.to_rfc3339() })))
}
