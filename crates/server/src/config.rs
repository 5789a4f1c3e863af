// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Limits that tests need to pin live on `LimitsConfig` so the
// registry can be constructed explicitly instead of reading globals.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Signing secret for subscription tokens.
    pub token_secret: String,
    /// Base URL for WebSocket connections (e.g. `ws://localhost:8080`).
    pub ws_base_url: String,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Log filter directive (e.g. `info`, `handoff_server=debug`).
    pub log_filter: String,
    /// Admission-control limits.
    pub limits: LimitsConfig,
}

/// Admission-control knobs, injected into the connection registry and the
/// token rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct LimitsConfig {
    /// Maximum concurrent WebSocket connections per capability key.
    pub max_key_connections: usize,
    /// Maximum concurrent WebSocket connections per workspace.
    pub max_workspace_connections: usize,
    /// Subscription tokens a key may mint per window.
    pub tokens_per_window: u32,
    /// Token rate-limit window length in seconds.
    pub token_window_seconds: i64,
    /// Seconds before an agent heartbeat is considered stale.
    pub stale_agent_seconds: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_key_connections: 16,
            max_workspace_connections: 256,
            tokens_per_window: 30,
            token_window_seconds: 60,
            stale_agent_seconds: 300,
        }
    }
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `HANDOFF_HOST` | `0.0.0.0` |
    /// | `HANDOFF_PORT` | `8080` |
    /// | `HANDOFF_TOKEN_SECRET` | dev-only placeholder |
    /// | `HANDOFF_WS_BASE_URL` | `ws://{host}:{port}` |
    /// | `HANDOFF_DB_PATH` | `handoff.db` |
    /// | `HANDOFF_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("HANDOFF_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("HANDOFF_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let token_secret = env("HANDOFF_TOKEN_SECRET").unwrap_or_else(|_| {
            "handoff_local_development_token_secret_must_be_32_chars".into()
        });

        let ws_base_url = env("HANDOFF_WS_BASE_URL")
            .unwrap_or_else(|_| format!("ws://{listen_addr}"));

        let db_path = env("HANDOFF_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("handoff.db"));

        let log_filter =
            env("HANDOFF_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self {
            listen_addr,
            token_secret,
            ws_base_url,
            db_path,
            log_filter,
            limits: LimitsConfig::default(),
        }
    }

    /// Returns true when using the development-only token secret.
    pub fn is_dev_token_secret(&self) -> bool {
        self.token_secret == "handoff_local_development_token_secret_must_be_32_chars"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_token_secret());
        assert_eq!(cfg.ws_base_url, "ws://0.0.0.0:8080");
        assert_eq!(cfg.db_path.to_str(), Some("handoff.db"));
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.limits.max_key_connections, 16);
        assert_eq!(cfg.limits.stale_agent_seconds, 300);
    }

    #[test]
    fn custom_port() {
        let mut m = HashMap::new();
        m.insert("HANDOFF_PORT", "9090");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 9090);
        assert_eq!(cfg.ws_base_url, "ws://0.0.0.0:9090");
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("HANDOFF_HOST", "127.0.0.1");
        m.insert("HANDOFF_PORT", "3000");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn custom_token_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("HANDOFF_TOKEN_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_token_secret());
    }

    #[test]
    fn ws_base_url_override() {
        let mut m = HashMap::new();
        m.insert("HANDOFF_WS_BASE_URL", "wss://handoff.example.dev");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.ws_base_url, "wss://handoff.example.dev");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("HANDOFF_PORT", "not_a_number");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn db_path_override() {
        let mut m = HashMap::new();
        m.insert("HANDOFF_DB_PATH", "/var/lib/handoff/ws.db");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.db_path.to_str(), Some("/var/lib/handoff/ws.db"));
    }
}
