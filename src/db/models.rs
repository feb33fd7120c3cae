//! Database model types.

use serde::{Deserialize, Serialize};

/// The backend-assigned identity this agent reports under.
///
/// A zero `node_id` or empty `node_ip` means the identity has not been
/// resolved yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: u64,
    pub node_ip: String,
    pub country: String,
    pub province: String,
    pub city: String,
    pub isp: String,
}

impl NodeIdentity {
    /// True once both the id and the IP have been assigned.
    pub fn is_resolved(&self) -> bool {
        self.node_id > 0 && !self.node_ip.is_empty()
    }

    pub fn location(&self) -> Location {
        Location {
            country: self.country.clone(),
            province: self.province.clone(),
            city: self.city.clone(),
            isp: self.isp.clone(),
        }
    }
}

/// Location fields attached to every submission when known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Location {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub province: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub city: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub isp: String,
}
