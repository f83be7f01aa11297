//! Input and record validation errors.

use std::error::Error;
use std::fmt::{Display, Formatter};

/// Client-caused validation failure. Never retryable.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A required field is absent.
    MissingField(&'static str),
    /// A required text field is empty or whitespace only.
    EmptyField(&'static str),
    /// A coordinate is NaN or infinite.
    NonFiniteCoordinate { field: &'static str, value: f64 },
    LatitudeOutOfRange(f64),
    LongitudeOutOfRange(f64),
    /// A reference is not a syntactically valid object id.
    InvalidObjectId { field: &'static str, value: String },
    /// Bounding box edges are inverted.
    InvertedBoundingBox { axis: &'static str },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing required field `{field}`"),
            Self::EmptyField(field) => write!(f, "field `{field}` must not be empty"),
            Self::NonFiniteCoordinate { field, value } => {
                write!(f, "field `{field}` must be a finite number, got {value}")
            }
            Self::LatitudeOutOfRange(value) => {
                write!(f, "latitude {value} is outside [-90, 90]")
            }
            Self::LongitudeOutOfRange(value) => {
                write!(f, "longitude {value} is outside [-180, 180]")
            }
            Self::InvalidObjectId { field, .. } => write!(f, "invalid {field}"),
            Self::InvertedBoundingBox { axis } => {
                write!(f, "bounding box {axis} edges are inverted")
            }
        }
    }
}

impl Error for ValidationError {}

/// Rejects empty and whitespace-only text.
pub(crate) fn require_text(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    Ok(())
}
