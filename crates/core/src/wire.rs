//! JSON wire types for the hub API
//!
//! Shared between the hub's HTTP surface and the client sync engine so
//! both sides agree on the listing schema.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Response body of `GET /api/datasets`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetListing {
    /// When the hub produced this listing
    pub generated_at: DateTime<FixedOffset>,
    pub datasets: Vec<DatasetSummary>,
}

impl DatasetListing {
    /// Find a dataset entry by name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&DatasetSummary> {
        self.datasets.iter().find(|d| d.name == name)
    }
}

/// One dataset row in the listing
///
/// `last_updated` is null until the dataset's first successful
/// packaging; clients treat that as nothing-to-fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub name: String,
    pub last_updated: Option<DateTime<FixedOffset>>,
    pub file_count: u64,
    pub total_size: u64,
    pub package_ready: bool,
    pub package_size: u64,
}
