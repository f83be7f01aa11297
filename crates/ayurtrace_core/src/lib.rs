//! Core provenance trail for herbal supply chains.
//!
//! Records field collection events and downstream processing steps, and
//! resolves published QR codes to consumer-facing traceability text.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{ConfigError, StoreConfig, StoreTarget};
pub use db::{
    CancelToken, Collection, DbError, DbResult, Gateway, HealthStatus, ScopedGateway,
};
pub use logging::{default_log_level, init_logging, init_logging_from_env, logging_status};
pub use model::collection_event::CollectionEvent;
pub use model::geo::{GeoBoundingBox, GeoPoint};
pub use model::object_id::{ObjectId, ObjectIdParseError};
pub use model::processing_step::ProcessingStep;
pub use model::qr_doc::QrDoc;
pub use model::validation::ValidationError;
pub use repo::provenance_repo::{
    GatewayProvenanceRepository, ProvenanceRepository, RepoError, RepoResult,
};
pub use service::provenance_service::{
    ProvenanceError, ProvenanceService, ProvenanceTrail, QrTraceability,
    RecordCollectionEventRequest, RecordProcessingStepRequest,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
