// `POST /a/{key}/append` — append one event to a file's log, creating the
// file on first touch.

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use handoff_common::path::normalize_path;
use handoff_common::types::{EventKind, Tier};

use crate::api::{AppState, ValidatedJson};
use crate::appends::{append_event_payload, find_append, find_file, record_append, AppendRequest};
use crate::auth;
use crate::bus::lifecycle_event;
use crate::error::{ok_envelope_with_web_url, ApiError, ErrorCode};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendBody {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "ref")]
    pub ref_id: Option<String>,
    pub priority: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub due_at: Option<String>,
    pub expires_in_seconds: Option<i64>,
    pub author: Option<String>,
}

pub async fn create_append(
    State(state): State<AppState>,
    Path(raw_key): Path<String>,
    ValidatedJson(body): ValidatedJson<AppendBody>,
) -> Result<Json<Value>, ApiError> {
    let path = normalize_path(&body.path)
        .map_err(|error| ApiError::new(ErrorCode::InvalidPath, error.to_string()))?;

    let kind_raw = body.kind.trim();
    if kind_raw.is_empty() {
        return Err(ApiError::new(ErrorCode::InvalidRequest, "type is required"));
    }
    let kind = EventKind::parse(kind_raw);

    let due_at = body
        .due_at
        .as_deref()
        .map(|raw| {
            raw.parse::<DateTime<Utc>>().map_err(|_| {
                ApiError::new(ErrorCode::InvalidRequest, "dueAt must be an RFC 3339 timestamp")
            })
        })
        .transpose()?;

    if body.expires_in_seconds.is_some_and(|secs| secs <= 0) {
        return Err(ApiError::new(ErrorCode::InvalidRequest, "expiresInSeconds must be positive"));
    }

    let request = AppendRequest {
        path: path.clone(),
        kind,
        content: body.content,
        ref_id: body.ref_id,
        priority: body.priority,
        labels: body.labels,
        due_at,
        expires_in_seconds: body.expires_in_seconds,
        author: body.author,
    };

    let now = Utc::now();
    let (file, row, events) = {
        let mut conn = state.db.lock();
        let tx = conn.transaction().map_err(|error| {
            crate::error::storage_error(anyhow::Error::new(error).context("begin append"))
        })?;

        let key = auth::authorize(&tx, &raw_key, Tier::Append, now)?;
        let file_existed = find_file(&tx, &key.workspace_id, &path)
            .map_err(crate::error::storage_error)?
            .is_some();

        let (file, row) = record_append(&tx, &key, &request, now)?;

        let ref_kind = match &row.ref_id {
            Some(ref_id) => find_append(&tx, &file.id, ref_id)
                .map_err(crate::error::storage_error)?
                .map(|target| target.kind),
            None => None,
        };

        tx.commit().map_err(|error| {
            crate::error::storage_error(anyhow::Error::new(error).context("commit append"))
        })?;

        let payload = append_event_payload(&file, &row);
        let mut events: Vec<(&'static str, String, Value)> = Vec::new();
        if file_existed {
            events.push(("file.updated", file.path.clone(), payload.clone()));
        } else {
            events.push(("file.created", file.path.clone(), payload.clone()));
            events.push(("folder.changed", parent_folder(&file.path), payload.clone()));
        }
        events.push(("append.created", file.path.clone(), payload.clone()));
        if let Some(name) = lifecycle_event(&row.kind, ref_kind.as_ref()) {
            events.push((name, file.path.clone(), payload));
        }

        (file, row, events)
    };

    // Publish only after the write is durable.
    for (name, path, payload) in events {
        state.bus.publish(&file.workspace_id, name, &path, payload);
    }

    let data = serde_json::json!({
        "appendId": row.append_id,
        "path": file.path,
        "type": row.kind.as_str(),
        "ref": row.ref_id,
        "author": row.author,
        "createdAt": row.created_at.to_rfc3339(),
        "expiresAt": row.expires_at.map(|t| t.to_rfc3339()),
    });
    let web_url = format!("/r/{raw_key}{}", file.path);
    Ok(ok_envelope_with_web_url(data, &web_url))
}

/// The folder containing a normalized file path; files at the root report `/`.
fn parent_folder(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::parent_folder;

    #[test]
    fn parent_folder_of_nested_and_root_files() {
        assert_eq!(parent_folder("/tasks/today.md"), "/tasks");
        assert_eq!(parent_folder("/tasks/deep/nested.md"), "/tasks/deep");
        assert_eq!(parent_folder("/pr.md"), "/");
    }
}
