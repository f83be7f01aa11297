//! Provenance repository contract and gateway-backed implementation.

use crate::db::{CancelToken, Collection, DbError, Gateway, ScopedGateway};
use crate::model::collection_event::CollectionEvent;
use crate::model::geo::GeoBoundingBox;
use crate::model::object_id::ObjectId;
use crate::model::processing_step::ProcessingStep;
use crate::model::qr_doc::QrDoc;
use crate::model::validation::ValidationError;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Most collection events returned for one area query.
pub const AREA_LIST_LIMIT: u32 = 500;

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug)]
pub enum RepoError {
    Validation(ValidationError),
    Db(DbError),
    /// A stored record decoded but violates record invariants.
    InvalidData {
        collection: Collection,
        message: String,
    },
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData {
                collection,
                message,
            } => write!(f, "invalid persisted record in `{collection}`: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::InvalidData { .. } => None,
        }
    }
}

impl From<ValidationError> for RepoError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

/// Data access needed by the provenance use-cases.
pub trait ProvenanceRepository {
    fn insert_collection_event(&self, event: &CollectionEvent) -> RepoResult<ObjectId>;
    fn insert_processing_step(&self, step: &ProcessingStep) -> RepoResult<ObjectId>;
    fn find_collection_event(&self, id: ObjectId) -> RepoResult<Option<CollectionEvent>>;
    /// Every step referencing `event_id`, oldest first.
    fn list_processing_steps(&self, event_id: ObjectId) -> RepoResult<Vec<ProcessingStep>>;
    fn find_qr_doc(&self, qr_code: &str) -> RepoResult<Option<QrDoc>>;
    fn find_collection_events_within(
        &self,
        bbox: &GeoBoundingBox,
    ) -> RepoResult<Vec<CollectionEvent>>;
}

/// Repository backed by a shared [`Gateway`], scoped to one request.
pub struct GatewayProvenanceRepository<'g> {
    gateway: ScopedGateway<'g>,
}

impl<'g> GatewayProvenanceRepository<'g> {
    /// Repository whose calls are bounded by time only.
    pub fn new(gateway: &'g Gateway) -> Self {
        Self::with_cancel(gateway, CancelToken::new())
    }

    /// Repository whose calls abort once `token` is cancelled.
    pub fn with_cancel(gateway: &'g Gateway, token: CancelToken) -> Self {
        Self {
            gateway: gateway.scoped(token),
        }
    }
}

impl ProvenanceRepository for GatewayProvenanceRepository<'_> {
    fn insert_collection_event(&self, event: &CollectionEvent) -> RepoResult<ObjectId> {
        event.validate()?;
        Ok(self
            .gateway
            .insert_one(Collection::CollectionEvents, event)?)
    }

    fn insert_processing_step(&self, step: &ProcessingStep) -> RepoResult<ObjectId> {
        step.validate()?;
        Ok(self.gateway.insert_one(Collection::ProcessingSteps, step)?)
    }

    fn find_collection_event(&self, id: ObjectId) -> RepoResult<Option<CollectionEvent>> {
        let found: Option<CollectionEvent> = self.gateway.find_one_by_field(
            Collection::CollectionEvents,
            "_id",
            &Value::String(id.to_hex()),
        )?;
        found
            .map(|event| checked(Collection::CollectionEvents, event, CollectionEvent::validate))
            .transpose()
    }

    fn list_processing_steps(&self, event_id: ObjectId) -> RepoResult<Vec<ProcessingStep>> {
        let steps: Vec<ProcessingStep> = self.gateway.find_all_by_field(
            Collection::ProcessingSteps,
            "collection_event_id",
            &Value::String(event_id.to_hex()),
        )?;
        steps
            .into_iter()
            .map(|step| checked(Collection::ProcessingSteps, step, ProcessingStep::validate))
            .collect()
    }

    fn find_qr_doc(&self, qr_code: &str) -> RepoResult<Option<QrDoc>> {
        let found: Option<QrDoc> = self.gateway.find_one_by_field(
            Collection::QrCodes,
            "qr_code",
            &Value::String(qr_code.to_string()),
        )?;
        found
            .map(|doc| checked(Collection::QrCodes, doc, QrDoc::validate))
            .transpose()
    }

    fn find_collection_events_within(
        &self,
        bbox: &GeoBoundingBox,
    ) -> RepoResult<Vec<CollectionEvent>> {
        bbox.validate()?;
        let events: Vec<CollectionEvent> = self.gateway.find_events_within(bbox, AREA_LIST_LIMIT)?;
        events
            .into_iter()
            .map(|event| checked(Collection::CollectionEvents, event, CollectionEvent::validate))
            .collect()
    }
}

fn checked<T>(
    collection: Collection,
    record: T,
    validate: impl Fn(&T) -> Result<(), ValidationError>,
) -> RepoResult<T> {
    validate(&record).map_err(|err| RepoError::InvalidData {
        collection,
        message: err.to_string(),
    })?;
    Ok(record)
}
