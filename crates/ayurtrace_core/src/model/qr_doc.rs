//! Consumer-facing QR lookup record.
//!
//! QR documents are provisioned out of band; core only reads them. The
//! `qr_code` value is unique across the collection, enforced by the store.

use crate::model::object_id::ObjectId;
use crate::model::validation::{require_text, ValidationError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrDoc {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub qr_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    /// Already composed traceability text, returned verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceability_data: Option<String>,
}

impl QrDoc {
    pub fn new(
        qr_code: impl Into<String>,
        product_name: Option<String>,
        traceability_data: Option<String>,
    ) -> Self {
        Self {
            id: None,
            qr_code: qr_code.into(),
            product_name,
            traceability_data,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("qr_code", &self.qr_code)
    }
}
