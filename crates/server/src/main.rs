mod api;
mod appends;
mod auth;
mod board;
mod bus;
mod claims;
mod config;
mod derive;
mod error;
mod limits;
mod store;
mod ws;

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use handoff_common::types::{ScopeType, Tier};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::store::Db;

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
const REQUEST_ID_HEADER: &str = "x-request-id";
const CLEANUP_INTERVAL_SECONDS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if config.is_dev_token_secret() {
        warn!("using the development token secret; set HANDOFF_TOKEN_SECRET in production");
    }

    let db = Arc::new(Db::open(&config.db_path).context("failed to open database")?);
    bootstrap_workspace(&db).context("failed to bootstrap workspace")?;

    let state = AppState::new(
        Arc::clone(&db),
        &config.token_secret,
        &config.ws_base_url,
        config.limits,
    )
    .context("failed to build server state")?;

    ws::spawn_broadcast(state.bus.clone(), Arc::clone(&state.registry));
    spawn_cleanup(&state);

    let app = build_router(state);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting handoff server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly")
}

fn build_router(state: AppState) -> Router {
    apply_middleware(Router::new().route("/healthz", get(healthz)).merge(api::router(state)))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

/// First boot of an empty store: create the default workspace and one key
/// per tier. The raw secrets are printed exactly once — only hashes are
/// stored, so they cannot be recovered later.
fn bootstrap_workspace(db: &Db) -> anyhow::Result<()> {
    let conn = db.lock();
    let existing: i64 = conn
        .query_row("SELECT COUNT(*) FROM workspaces", [], |row| row.get(0))
        .context("failed to count workspaces")?;
    if existing > 0 {
        return Ok(());
    }

    let now = Utc::now();
    let workspace = store::workspaces::create_workspace(&conn, "default", now)?;

    for tier in [Tier::Read, Tier::Append, Tier::Write] {
        let (raw, _) = auth::issue_key(
            &conn,
            &workspace.id,
            tier,
            ScopeType::Workspace,
            auth::KeySpec::default(),
            now,
        )?;
        let prefix = match tier {
            Tier::Read => "r",
            Tier::Append => "a",
            Tier::Write => "w",
        };
        info!(tier = tier.as_str(), url = %format!("/{prefix}/{raw}"), "issued bootstrap key");
    }

    info!(workspace_id = %workspace.id, "bootstrapped default workspace");
    Ok(())
}

/// Best-effort periodic cleanup of redeemed-token and rate-limit windows.
/// Never started in deterministic test environments.
fn spawn_cleanup(state: &AppState) {
    let registry = Arc::clone(&state.registry);
    let limiter = Arc::clone(&state.limiter);
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(CLEANUP_INTERVAL_SECONDS));
        loop {
            ticker.tick().await;
            let now = Utc::now();
            registry.purge_expired_tokens(now);
            limiter.purge_expired(now);
        }
    });
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    // Capability secrets live in the path; log only the route shape.
    let path = redact_capability_path(request.uri().path());
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

/// Replace the key segment of capability routes with a short hash prefix so
/// the full secret never reaches the logs.
fn redact_capability_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() >= 3 && matches!(segments[1], "r" | "a" | "w") && !segments[2].is_empty() {
        let digest = auth::hash_key(segments[2]);
        let mut redacted: Vec<String> = segments.iter().map(|s| s.to_string()).collect();
        redacted[2] = format!("{}…", &digest[..8]);
        redacted.join("/")
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    use super::{apply_middleware, build_router, redact_capability_path, MAX_REQUEST_BODY_BYTES};
    use crate::api::AppState;
    use crate::config::LimitsConfig;
    use crate::store::Db;

    const TEST_SECRET: &str = "handoff_test_secret_that_is_definitely_long_enough";

    fn test_router() -> Router {
        let db = Arc::new(Db::open_in_memory().expect("test db should open"));
        let state = AppState::new(db, TEST_SECRET, "ws://localhost:8080", LimitsConfig::default())
            .expect("test state should build");
        build_router(state)
    }

    #[tokio::test]
    async fn health_check_has_request_id_header() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("healthz request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn panic_handler_returns_internal_server_error() {
        async fn panic_route() -> &'static str {
            panic!("test panic");
        }

        let app = apply_middleware(Router::new().route("/panic", get(panic_route)));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/panic")
                    .body(Body::empty())
                    .expect("panic request should build"),
            )
            .await
            .expect("panic request should return a response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn request_body_limit_is_enforced() {
        async fn echo(body: String) -> String {
            body
        }

        let oversized_body = "a".repeat(MAX_REQUEST_BODY_BYTES + 1);
        let app = apply_middleware(Router::new().route("/echo", post(echo)));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/echo")
                    .header("content-type", "text/plain")
                    .body(Body::from(oversized_body))
                    .expect("echo request should build"),
            )
            .await
            .expect("echo request should return a response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn capability_keys_are_redacted_from_logged_paths() {
        let redacted = redact_capability_path("/a/super-secret-key/append");
        assert!(!redacted.contains("super-secret-key"));
        assert!(redacted.starts_with("/a/"));
        assert!(redacted.ends_with("/append"));

        assert_eq!(redact_capability_path("/healthz"), "/healthz");
        assert_eq!(redact_capability_path("/ws"), "/ws");
    }
}
