//! GeoJSON point and bounding-box value objects.
//!
//! # Invariants
//! - `coordinates` is always `[longitude, latitude]`; the order is fixed by
//!   the constructor, never by callers building arrays.
//! - latitude in [-90, 90], longitude in [-180, 180], both finite.

use crate::model::validation::ValidationError;
use serde::{Deserialize, Serialize};

/// GeoJSON geometry tag. Only points are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeoKind {
    Point,
}

/// GeoJSON point as stored on collection events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(rename = "type")]
    kind: GeoKind,
    coordinates: [f64; 2],
}

impl GeoPoint {
    /// Builds a validated point. Argument order is latitude first, as callers
    /// speak it; storage order is longitude first.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ValidationError> {
        let point = Self {
            kind: GeoKind::Point,
            coordinates: [longitude, latitude],
        };
        point.validate()?;
        Ok(point)
    }

    pub fn kind(&self) -> GeoKind {
        self.kind
    }

    pub fn longitude(&self) -> f64 {
        self.coordinates[0]
    }

    pub fn latitude(&self) -> f64 {
        self.coordinates[1]
    }

    /// Stored `[longitude, latitude]` pair.
    pub fn coordinates(&self) -> [f64; 2] {
        self.coordinates
    }

    /// Checks finiteness and ranges. Also used on read to reject corrupt rows.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_latitude(self.latitude())?;
        validate_longitude(self.longitude())
    }
}

/// Axis-aligned box for containment queries. No antimeridian wrap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl GeoBoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self, ValidationError> {
        let bbox = Self {
            west,
            south,
            east,
            north,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    /// Box of `radius_deg` degrees around a point, clamped to valid ranges.
    pub fn around(center: &GeoPoint, radius_deg: f64) -> Result<Self, ValidationError> {
        if !radius_deg.is_finite() || radius_deg < 0.0 {
            return Err(ValidationError::NonFiniteCoordinate {
                field: "radius",
                value: radius_deg,
            });
        }
        Self::new(
            (center.longitude() - radius_deg).max(-180.0),
            (center.latitude() - radius_deg).max(-90.0),
            (center.longitude() + radius_deg).min(180.0),
            (center.latitude() + radius_deg).min(90.0),
        )
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_longitude(self.west)?;
        validate_longitude(self.east)?;
        validate_latitude(self.south)?;
        validate_latitude(self.north)?;
        if self.west > self.east {
            return Err(ValidationError::InvertedBoundingBox { axis: "west/east" });
        }
        if self.south > self.north {
            return Err(ValidationError::InvertedBoundingBox {
                axis: "south/north",
            });
        }
        Ok(())
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        (self.west..=self.east).contains(&point.longitude())
            && (self.south..=self.north).contains(&point.latitude())
    }
}

fn validate_latitude(value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteCoordinate {
            field: "latitude",
            value,
        });
    }
    if !(-90.0..=90.0).contains(&value) {
        return Err(ValidationError::LatitudeOutOfRange(value));
    }
    Ok(())
}

fn validate_longitude(value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteCoordinate {
            field: "longitude",
            value,
        });
    }
    if !(-180.0..=180.0).contains(&value) {
        return Err(ValidationError::LongitudeOutOfRange(value));
    }
    Ok(())
}
