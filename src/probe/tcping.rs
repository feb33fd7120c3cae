//! TCP connect probe implementation.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::{MeasurementEvent, ProbeError};

/// Timeout for a single connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A `host:port` probe target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpTarget {
    pub host: String,
    pub port: u16,
}

impl TcpTarget {
    /// Parse `host:port`, or `[v6addr]:port` for IPv6 literals.
    pub fn parse(target: &str) -> Result<Self, ProbeError> {
        let invalid = || ProbeError::Config(format!("target must be host:port, got {:?}", target));

        let (host, port) = if let Some(rest) = target.strip_prefix('[') {
            rest.split_once("]:").ok_or_else(invalid)?
        } else {
            let (host, port) = target.rsplit_once(':').ok_or_else(invalid)?;
            if host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        };

        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        let port: u16 = port
            .parse()
            .map_err(|_| ProbeError::Config(format!("invalid port: {:?}", port)))?;
        if port == 0 {
            return Err(ProbeError::Config("port must be between 1 and 65535".to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Run one connect attempt. Every outcome yields exactly one event.
///
/// Latency is wall-clock time to connect in milliseconds. The connection is
/// closed as soon as it is established.
pub async fn run_tcping_probe(target: &TcpTarget, timeout: Duration) -> MeasurementEvent {
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, TcpStream::connect(target.authority())).await;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    match result {
        Ok(Ok(stream)) => {
            let peer = stream.peer_addr().ok().map(|addr| addr.ip().to_string());
            drop(stream);
            let ip = match peer {
                Some(ip) => Some(ip),
                None => resolve_target_ip(target, timeout).await,
            };
            MeasurementEvent::success(latency_ms, ip)
        }
        Ok(Err(e)) => {
            let error = ProbeError::Network(e.to_string());
            MeasurementEvent::failure(resolve_target_ip(target, timeout).await, error.to_string())
        }
        Err(_) => {
            let error = ProbeError::Timeout(timeout);
            MeasurementEvent::failure(resolve_target_ip(target, timeout).await, error.to_string())
        }
    }
}

/// Resolve the target host, preferring IPv4.
async fn resolve_target_ip(target: &TcpTarget, timeout: Duration) -> Option<String> {
    if let Ok(ip) = target.host.parse::<IpAddr>() {
        return Some(ip.to_string());
    }

    let lookup = tokio::net::lookup_host((target.host.as_str(), target.port));
    let addrs: Vec<IpAddr> = match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(addrs)) => addrs.map(|sa| sa.ip()).collect(),
        Ok(Err(e)) => {
            tracing::debug!("Lookup for {} failed: {}", target.host, e);
            return None;
        }
        Err(_) => return None,
    };

    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .map(|ip| ip.to_string())
}
