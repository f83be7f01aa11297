//! Processing step record.
//!
//! # Invariants
//! - `collection_event_id` is a weak reference: syntactically valid, never
//!   checked for existence.
//! - `step_name` is non-empty.

use crate::model::object_id::ObjectId;
use crate::model::validation::{require_text, ValidationError};
use serde::{Deserialize, Serialize};

/// A downstream transformation applied to a collection event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStep {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    /// Back reference to `collection_events._id`.
    pub collection_event_id: ObjectId,
    /// e.g. `Drying`, `Grinding`.
    pub step_name: String,
    /// Unix epoch milliseconds.
    #[serde(rename = "ts")]
    pub timestamp_ms: i64,
}

impl ProcessingStep {
    pub fn new(collection_event_id: ObjectId, step_name: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            id: None,
            collection_event_id,
            step_name: step_name.into(),
            timestamp_ms,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("step_name", &self.step_name)
    }
}
