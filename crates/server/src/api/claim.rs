// Claim mutation endpoints:
// `POST /a/{key}/claims/{claim_id}/renew|complete|cancel|block`.
//
// Each returns `{claim, appendId}` on success. Illegal transitions are not
// retried here — the caller must re-fetch current state and decide.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use handoff_common::path::normalize_path;
use handoff_common::types::Tier;

use crate::api::{AppState, ValidatedJson};
use crate::appends::append_event_payload;
use crate::auth;
use crate::bus::lifecycle_event;
use crate::claims::{self, ClaimMutation};
use crate::error::{ok_envelope, ApiError, ErrorCode};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimActionBody {
    /// Disambiguates the claim id when it exists in several files.
    pub path: Option<String>,
    /// Response content for `complete`.
    pub content: Option<String>,
    /// Cancellation or block reason.
    pub reason: Option<String>,
    /// Renewal window for `renew`.
    pub expires_in_seconds: Option<i64>,
}

enum ClaimAction {
    Renew,
    Complete,
    Cancel,
    Block,
}

pub async fn renew_claim(
    State(state): State<AppState>,
    Path((raw_key, claim_id)): Path<(String, String)>,
    ValidatedJson(body): ValidatedJson<ClaimActionBody>,
) -> Result<Json<Value>, ApiError> {
    mutate(&state, &raw_key, &claim_id, body, ClaimAction::Renew)
}

pub async fn complete_claim(
    State(state): State<AppState>,
    Path((raw_key, claim_id)): Path<(String, String)>,
    ValidatedJson(body): ValidatedJson<ClaimActionBody>,
) -> Result<Json<Value>, ApiError> {
    mutate(&state, &raw_key, &claim_id, body, ClaimAction::Complete)
}

pub async fn cancel_claim(
    State(state): State<AppState>,
    Path((raw_key, claim_id)): Path<(String, String)>,
    ValidatedJson(body): ValidatedJson<ClaimActionBody>,
) -> Result<Json<Value>, ApiError> {
    mutate(&state, &raw_key, &claim_id, body, ClaimAction::Cancel)
}

pub async fn block_claim(
    State(state): State<AppState>,
    Path((raw_key, claim_id)): Path<(String, String)>,
    ValidatedJson(body): ValidatedJson<ClaimActionBody>,
) -> Result<Json<Value>, ApiError> {
    mutate(&state, &raw_key, &claim_id, body, ClaimAction::Block)
}

fn mutate(
    state: &AppState,
    raw_key: &str,
    claim_id: &str,
    body: ClaimActionBody,
    action: ClaimAction,
) -> Result<Json<Value>, ApiError> {
    let path = body
        .path
        .as_deref()
        .map(|raw| {
            normalize_path(raw)
                .map_err(|error| ApiError::new(ErrorCode::InvalidPath, error.to_string()))
        })
        .transpose()?;

    let now = Utc::now();
    let (mutation, events) = {
        let mut conn = state.db.lock();
        let tx = conn.transaction().map_err(|error| {
            crate::error::storage_error(anyhow::Error::new(error).context("begin claim mutation"))
        })?;

        let key = auth::authorize(&tx, raw_key, Tier::Append, now)?;
        let (file, claim) = claims::resolve_claim(&tx, &key, claim_id, path.as_deref())?;

        let mutation = match action {
            ClaimAction::Renew => {
                claims::renew(&tx, &key, &file, &claim, body.expires_in_seconds, now)?
            }
            ClaimAction::Complete => {
                claims::complete(&tx, &key, &file, &claim, body.content.clone(), now)?
            }
            ClaimAction::Cancel => {
                claims::cancel(&tx, &key, &file, &claim, body.reason.clone(), now)?
            }
            ClaimAction::Block => {
                let reason = body.reason.clone().unwrap_or_default();
                claims::block(&tx, &key, &file, &claim, &reason, now)?
            }
        };

        tx.commit().map_err(|error| {
            crate::error::storage_error(anyhow::Error::new(error).context("commit claim mutation"))
        })?;

        let events = mutation_events(&mutation);
        (mutation, events)
    };

    for (name, payload) in events {
        state
            .bus
            .publish(&mutation.file.workspace_id, name, &mutation.file.path, payload);
    }

    let claim = serde_json::to_value(&mutation.claim).map_err(|error| {
        crate::error::storage_error(anyhow::Error::new(error).context("claim serialization"))
    })?;
    Ok(ok_envelope(serde_json::json!({
        "claim": claim,
        "appendId": mutation.audit.append_id,
    })))
}

fn mutation_events(mutation: &ClaimMutation) -> Vec<(&'static str, Value)> {
    let payload = append_event_payload(&mutation.file, &mutation.audit);

    let mut events: Vec<(&'static str, Value)> = vec![("append.created", payload.clone())];
    // The audit event always targets a claim (or, for block, the claim's
    // task); its lifecycle name never depends on further lookup here.
    if let Some(name) = lifecycle_event(
        &mutation.audit.kind,
        Some(&handoff_common::types::EventKind::Claim),
    ) {
        events.push((name, payload));
    }
    events
}
