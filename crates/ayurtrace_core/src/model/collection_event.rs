//! Field collection event record.
//!
//! # Invariants
//! - `collector_id` and `species` are non-empty.
//! - `location` is a valid GeoJSON point.
//! - `timestamp_ms` is assigned by the server at write time.

use crate::model::geo::GeoPoint;
use crate::model::object_id::ObjectId;
use crate::model::validation::{require_text, ValidationError};
use serde::{Deserialize, Serialize};

/// One field observation of a harvested species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEvent {
    /// `None` until the store assigns one.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    /// Farmer or collector identifier, e.g. `c001`.
    pub collector_id: String,
    /// Botanical or trade name, e.g. `Ashwagandha`.
    pub species: String,
    /// Free-form quality notes. Omitted from storage when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_metrics: Option<String>,
    pub location: GeoPoint,
    /// Unix epoch milliseconds.
    #[serde(rename = "ts")]
    pub timestamp_ms: i64,
}

impl CollectionEvent {
    /// Creates an unsaved event.
    pub fn new(
        collector_id: impl Into<String>,
        species: impl Into<String>,
        quality_metrics: Option<String>,
        location: GeoPoint,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            id: None,
            collector_id: collector_id.into(),
            species: species.into(),
            quality_metrics,
            location,
            timestamp_ms,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("collector_id", &self.collector_id)?;
        require_text("species", &self.species)?;
        self.location.validate()
    }
}
