//! Probe module for continuous measurements.
//!
//! Supports ICMP-style echo bursts (delegated to an external process) and
//! TCP connect probes.

mod parser;
mod ping;
mod tcping;

pub use parser::*;
pub use ping::*;
pub use tcping::*;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Latency reported for failed or lost probes.
pub const FAILED_LATENCY: f64 = -1.0;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// One structured outcome of a single probe attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementEvent {
    /// Unix timestamp in seconds
    pub timestamp: i64,
    /// Latency in milliseconds, or -1.0 on failure
    pub latency: f64,
    pub success: bool,
    pub packet_loss: bool,
    #[serde(rename = "ip", default, skip_serializing_if = "Option::is_none")]
    pub resolved_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MeasurementEvent {
    pub fn success(latency_ms: f64, resolved_ip: Option<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp(),
            latency: latency_ms,
            success: true,
            packet_loss: false,
            resolved_ip,
            error: None,
        }
    }

    /// A lost probe with no further explanation (e.g. an echo timeout).
    pub fn lost(resolved_ip: Option<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp(),
            latency: FAILED_LATENCY,
            success: false,
            packet_loss: true,
            resolved_ip,
            error: None,
        }
    }

    pub fn failure(resolved_ip: Option<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::lost(resolved_ip)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = MeasurementEvent::success(12.5, Some("8.8.8.8".to_string()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["latency"], 12.5);
        assert_eq!(json["success"], true);
        assert_eq!(json["packet_loss"], false);
        assert_eq!(json["ip"], "8.8.8.8");
        assert!(json.get("error").is_none());
        assert!(json.get("resolved_ip").is_none());

        let failed = MeasurementEvent::failure(None, "connection refused");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["latency"], -1.0);
        assert_eq!(json["packet_loss"], true);
        assert_eq!(json["error"], "connection refused");
        assert!(json.get("ip").is_none());
    }
}
