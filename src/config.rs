//! Configuration module for the probing agent.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// HTTP port for the control surface (default: 2200)
    pub http_port: u16,
    /// Base URL of the backend, without trailing slash
    pub backend_url: String,
    /// Path to the SQLite file holding the node identity (default: "pingnode.db")
    pub db_path: String,
    /// Heartbeat cadence (default: 60s)
    pub heartbeat_interval: Duration,
    /// Enables debug-level logging
    pub debug: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            http_port: 2200,
            backend_url: "http://localhost:8080".to_string(),
            db_path: "pingnode.db".to_string(),
            heartbeat_interval: Duration::from_secs(60),
            debug: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PINGNODE_HTTP_PORT`: HTTP port (default: 2200)
    /// - `PINGNODE_BACKEND_URL` or `BACKEND_URL`: backend base URL
    /// - `PINGNODE_DB_PATH`: identity database path (default: "pingnode.db")
    /// - `PINGNODE_HEARTBEAT_INTERVAL`: heartbeat interval in seconds (default: 60)
    /// - `PINGNODE_DEBUG`: `1` or `true` enables debug logging
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = lookup("PINGNODE_HTTP_PORT").and_then(|s| s.parse().ok()) {
            cfg.http_port = port;
        }

        if let Some(url) = lookup("PINGNODE_BACKEND_URL").or_else(|| lookup("BACKEND_URL")) {
            let url = url.trim().trim_end_matches('/');
            if !url.is_empty() {
                cfg.backend_url = url.to_string();
            }
        }

        if let Some(db_path) = lookup("PINGNODE_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secs) = lookup("PINGNODE_HEARTBEAT_INTERVAL").and_then(|s| s.parse::<u64>().ok()) {
            if secs > 0 {
                cfg.heartbeat_interval = Duration::from_secs(secs);
            }
        }

        if let Some(debug) = lookup("PINGNODE_DEBUG") {
            cfg.debug = matches!(debug.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        cfg
    }
}
