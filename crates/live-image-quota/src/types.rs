use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::QuotaError;

/// Resources the quota service counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    MetadataItems,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::MetadataItems => f.write_str("metadata_items"),
        }
    }
}

impl FromStr for Resource {
    type Err = QuotaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "metadata_items" => Ok(Resource::MetadataItems),
            other => Err(QuotaError::UnknownResource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectLimits {
    pub metadata_items: u64,
}

impl Default for ProjectLimits {
    fn default() -> Self {
        Self {
            metadata_items: 128,
        }
    }
}

impl ProjectLimits {
    pub fn limit_for(&self, resource: Resource) -> u64 {
        match resource {
            Resource::MetadataItems => self.metadata_items,
        }
    }
}
