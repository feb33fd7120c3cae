//! Backend communication: node registration/heartbeat and result delivery.

mod heartbeat;
mod publisher;

pub use heartbeat::*;
pub use publisher::*;

use std::time::Duration;
use thiserror::Error;

/// Timeout for every request sent to the backend.
pub const BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend exchange error types.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}: {1}")]
    Status(u16, String),
    #[error("invalid response: {0}")]
    Decode(String),
}

fn build_client() -> Result<reqwest::Client, BackendError> {
    Ok(reqwest::Client::builder().timeout(BACKEND_TIMEOUT).build()?)
}
