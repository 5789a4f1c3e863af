// HTTP surface: capability-tiered routes and the response envelope.
//
// Route prefixes encode the minimum tier: `/r` read, `/a` append, `/w`
// write. The `{key}` segment is the bearer capability; it is resolved (and
// fails closed) on every request and never logged in full.

pub mod append;
pub mod board;
pub mod claim;
pub mod heartbeat;
pub mod subscribe;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRequest, Request},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::de::DeserializeOwned;

use crate::bus::EventBus;
use crate::config::LimitsConfig;
use crate::error::{ApiError, ErrorCode};
use crate::limits::RateLimiter;
use crate::store::Db;
use crate::ws::registry::ConnectionRegistry;
use crate::ws::token::SubscriptionTokenService;

/// Shared handler state. Constructed once at service start; everything in
/// it is explicitly lifetime-scoped (no module-level singletons) so tests
/// can build and reset isolated instances.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub bus: EventBus,
    pub registry: Arc<ConnectionRegistry>,
    pub tokens: Arc<SubscriptionTokenService>,
    pub limiter: Arc<RateLimiter>,
    pub ws_base_url: Arc<str>,
    pub limits: LimitsConfig,
}

impl AppState {
    pub fn new(
        db: Arc<Db>,
        token_secret: &str,
        ws_base_url: &str,
        limits: LimitsConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            db,
            bus: EventBus::default(),
            registry: Arc::new(ConnectionRegistry::new(limits)),
            tokens: Arc::new(SubscriptionTokenService::new(token_secret)?),
            limiter: Arc::new(RateLimiter::new(
                limits.tokens_per_window,
                limits.token_window_seconds,
            )),
            ws_base_url: Arc::<str>::from(ws_base_url),
            limits,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/r/{key}/orchestration", get(board::read_board))
        .route("/w/{key}/orchestration", get(board::admin_board))
        .route("/r/{key}/ops/subscribe", get(subscribe::subscribe_read))
        .route("/a/{key}/ops/subscribe", get(subscribe::subscribe_append))
        .route("/w/{key}/ops/subscribe", get(subscribe::subscribe_write))
        .route("/a/{key}/append", post(append::create_append))
        .route("/a/{key}/claims/{claim_id}/renew", post(claim::renew_claim))
        .route("/a/{key}/claims/{claim_id}/complete", post(claim::complete_claim))
        .route("/a/{key}/claims/{claim_id}/cancel", post(claim::cancel_claim))
        .route("/a/{key}/claims/{claim_id}/block", post(claim::block_claim))
        .route("/a/{key}/heartbeat", post(heartbeat::record_heartbeat))
        .route("/ws", get(crate::ws::ws_upgrade))
        .with_state(state)
}

/// JSON body extractor returning envelope-shaped INVALID_REQUEST errors.
///
/// An empty body is treated as `{}` so that mutation endpoints with fully
/// optional bodies (renew, cancel) work without one.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|error| {
            ApiError::new(ErrorCode::InvalidRequest, format!("request body error: {error}"))
                .into_response()
        })?;

        let slice: &[u8] = if bytes.is_empty() { b"{}" } else { &bytes };
        match serde_json::from_slice::<T>(slice) {
            Ok(value) => Ok(ValidatedJson(value)),
            Err(error) => Err(ApiError::new(
                ErrorCode::InvalidRequest,
                format!("invalid JSON payload: {error}"),
            )
            .into_response()),
        }
    }
}
