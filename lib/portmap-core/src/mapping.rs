//! Persisted mapping data model
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoint::normalize_endpoint;
use crate::identity::owner_key;

/// One routing rule: requests under `endpoint` for `pod_identifier`
/// forward to `port` inside the owner's live pod.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    /// Account as reported by the identity provider, kept for display.
    pub owner: String,
    /// Normalized comparison key; may be absent in records written by
    /// older versions and is backfilled on load.
    #[serde(default)]
    pub owner_key: String,
    /// Short token identifying which of the owner's pods this targets.
    /// Unique only within (owner_key, pod_identifier, endpoint).
    pub pod_identifier: String,
    /// Normalized absolute path prefix on the gateway.
    pub endpoint: String,
    /// Destination TCP port inside the pod.
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mapping {
    /// Repair fields that older store versions left unset or
    /// unnormalized.
    pub fn backfill(&mut self) {
        if self.owner_key.is_empty() {
            self.owner_key = owner_key(&self.owner);
        }
        self.endpoint = normalize_endpoint(&self.endpoint);
    }

    /// Whether this record matches the given store key triple.
    pub fn matches(&self, owner_key: &str, pod_identifier: &str, endpoint: &str) -> bool {
        self.owner_key == owner_key
            && self.pod_identifier == pod_identifier
            && self.endpoint == endpoint
    }
}

/// On-disk envelope: `{version: 1, entries: [...]}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MappingDocument {
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<Mapping>,
}

impl MappingDocument {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn empty() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            entries: Vec::new(),
        }
    }
}

impl Default for MappingDocument {
    fn default() -> Self {
        Self::empty()
    }
}
