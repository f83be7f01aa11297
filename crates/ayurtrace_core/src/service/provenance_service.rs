//! Provenance use-case service.
//!
//! # Responsibility
//! - Validate and normalize caller input before any I/O.
//! - Record collection events and processing steps with server timestamps.
//! - Resolve QR codes to their stored traceability payload.
//!
//! # Invariants
//! - Validation failures never reach the repository.
//! - A processing step's event reference is checked for syntax only.
//! - Each use-case is one store call; nothing is retried here.

use crate::model::collection_event::CollectionEvent;
use crate::model::geo::{GeoBoundingBox, GeoPoint};
use crate::model::object_id::ObjectId;
use crate::model::processing_step::ProcessingStep;
use crate::model::validation::ValidationError;
use crate::repo::provenance_repo::{ProvenanceRepository, RepoError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

/// Service error for provenance use-cases.
#[derive(Debug)]
pub enum ProvenanceError {
    /// Caller input is malformed. Non-retryable.
    Validation(ValidationError),
    /// The lookup matched nothing. An expected outcome, not a fault.
    NotFound { entity: &'static str, key: String },
    /// Store-side failure, passed through unchanged.
    Repo(RepoError),
}

impl ProvenanceError {
    /// `true` for outcomes caused by the caller rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound { .. })
    }
}

impl Display for ProvenanceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::NotFound { entity, key } => write!(f, "{entity} not found: {key}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ProvenanceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::NotFound { .. } => None,
        }
    }
}

impl From<ValidationError> for ProvenanceError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<RepoError> for ProvenanceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Validation(err) => Self::Validation(err),
            other => Self::Repo(other),
        }
    }
}

/// Input for recording a field collection event.
///
/// Every field is optional at the type level so absent input is reported as
/// a validation error instead of a decode failure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecordCollectionEventRequest {
    pub collector_id: Option<String>,
    pub species: Option<String>,
    pub quality_metrics: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Input for appending a processing step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RecordProcessingStepRequest {
    /// 24-character hex identifier of the collection event.
    pub collection_event_id: Option<String>,
    pub step_name: Option<String>,
}

/// Consumer-facing payload of a QR lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QrTraceability {
    pub product_name: Option<String>,
    pub traceability_data: Option<String>,
}

/// One explicitly resolved hop of the provenance chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvenanceTrail {
    pub collection_event_id: ObjectId,
    /// `None` when the steps point at an event that does not exist.
    pub event: Option<CollectionEvent>,
    /// Steps referencing the event, oldest first.
    pub steps: Vec<ProcessingStep>,
}

impl ProvenanceTrail {
    /// Whether steps reference an event that could not be found.
    pub fn is_dangling(&self) -> bool {
        self.event.is_none() && !self.steps.is_empty()
    }
}

/// Provenance use-cases over a repository implementation.
pub struct ProvenanceService<R: ProvenanceRepository> {
    repo: R,
}

impl<R: ProvenanceRepository> ProvenanceService<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Records one collection event and returns its generated identifier.
    ///
    /// # Contract
    /// - `collector_id` and `species` must be non-blank; both are trimmed.
    /// - `latitude`/`longitude` must be present, finite and in range.
    /// - Blank `quality_metrics` is stored as absent.
    /// - Coordinates are stored `[longitude, latitude]` with a server
    ///   timestamp.
    pub fn record_collection_event(
        &self,
        request: &RecordCollectionEventRequest,
    ) -> Result<ObjectId, ProvenanceError> {
        let collector_id = required_text("collector_id", request.collector_id.as_deref())?;
        let species = required_text("species", request.species.as_deref())?;
        let latitude = request
            .latitude
            .ok_or(ValidationError::MissingField("latitude"))?;
        let longitude = request
            .longitude
            .ok_or(ValidationError::MissingField("longitude"))?;
        let location = GeoPoint::new(latitude, longitude).inspect_err(|err| {
            debug!("event=collection_event_rejected module=service reason={err}");
        })?;
        let quality_metrics = request
            .quality_metrics
            .as_deref()
            .map(str::trim)
            .filter(|metrics| !metrics.is_empty())
            .map(str::to_string);

        let event = CollectionEvent::new(
            collector_id,
            species,
            quality_metrics,
            location,
            now_epoch_ms(),
        );
        let id = self.repo.insert_collection_event(&event).inspect_err(|err| {
            warn!("event=collection_event_record module=service status=error error={err}");
        })?;

        info!("event=collection_event_record module=service status=ok id={id}");
        Ok(id)
    }

    /// Appends a processing step and returns its generated identifier.
    ///
    /// # Contract
    /// - `collection_event_id` must parse as an object id; otherwise fails
    ///   with a validation error before any I/O.
    /// - The referenced event is NOT looked up; dangling references are stored
    ///   as given.
    pub fn record_processing_step(
        &self,
        request: &RecordProcessingStepRequest,
    ) -> Result<ObjectId, ProvenanceError> {
        let raw_event_id = request
            .collection_event_id
            .as_deref()
            .ok_or(ValidationError::MissingField("collection_event_id"))?;
        let event_id = parse_event_id(raw_event_id)?;
        let step_name = required_text("step_name", request.step_name.as_deref())?;

        let step = ProcessingStep::new(event_id, step_name, now_epoch_ms());
        let id = self.repo.insert_processing_step(&step).inspect_err(|err| {
            warn!("event=processing_step_record module=service status=error error={err}");
        })?;

        info!(
            "event=processing_step_record module=service status=ok id={} collection_event_id={}",
            id, event_id
        );
        Ok(id)
    }

    /// Resolves a QR code by exact match and returns the stored payload
    /// verbatim. No chain traversal happens here.
    pub fn resolve_qr_code(&self, code: &str) -> Result<QrTraceability, ProvenanceError> {
        match self.repo.find_qr_doc(code)? {
            Some(doc) => Ok(QrTraceability {
                product_name: doc.product_name,
                traceability_data: doc.traceability_data,
            }),
            None => {
                debug!("event=qr_resolve module=service status=not_found");
                Err(ProvenanceError::NotFound {
                    entity: "qr code",
                    key: code.to_string(),
                })
            }
        }
    }

    /// Loads one collection event by identifier.
    pub fn collection_event(&self, id: &str) -> Result<CollectionEvent, ProvenanceError> {
        let event_id = parse_event_id(id)?;
        self.repo
            .find_collection_event(event_id)?
            .ok_or_else(|| ProvenanceError::NotFound {
                entity: "collection event",
                key: event_id.to_hex(),
            })
    }

    /// Resolves an event and the steps pointing at it.
    ///
    /// A missing event is reported inside the trail, not as an error, so
    /// steps with a dangling reference stay visible.
    pub fn provenance_trail(&self, id: &str) -> Result<ProvenanceTrail, ProvenanceError> {
        let event_id = parse_event_id(id)?;
        let event = self.repo.find_collection_event(event_id)?;
        let steps = self.repo.list_processing_steps(event_id)?;

        let trail = ProvenanceTrail {
            collection_event_id: event_id,
            event,
            steps,
        };
        if trail.is_dangling() {
            warn!(
                "event=provenance_trail module=service status=dangling collection_event_id={} steps={}",
                event_id,
                trail.steps.len()
            );
        }
        Ok(trail)
    }

    /// Collection events located inside `bbox`.
    pub fn collection_events_within(
        &self,
        bbox: &GeoBoundingBox,
    ) -> Result<Vec<CollectionEvent>, ProvenanceError> {
        bbox.validate()?;
        Ok(self.repo.find_collection_events_within(bbox)?)
    }
}

fn required_text(field: &'static str, value: Option<&str>) -> Result<String, ValidationError> {
    let value = value.ok_or(ValidationError::MissingField(field))?.trim();
    if value.is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    Ok(value.to_string())
}

fn parse_event_id(raw: &str) -> Result<ObjectId, ValidationError> {
    ObjectId::parse_str(raw.trim()).map_err(|_| ValidationError::InvalidObjectId {
        field: "collection_event_id",
        value: raw.to_string(),
    })
}

/// Server clock in unix epoch milliseconds.
fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
