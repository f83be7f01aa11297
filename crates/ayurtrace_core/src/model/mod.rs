//! Provenance record schemas.
//!
//! # Responsibility
//! - Define the three persisted record kinds and their storage encoding.
//! - Keep identity and geo encoding as small value objects.
//!
//! # Invariants
//! - Every stored record is identified by a store-generated `ObjectId`.
//! - Records are append-only; nothing in core updates or deletes them.
//! - Cross-record links are weak references by `ObjectId` value.

pub mod collection_event;
pub mod geo;
pub mod object_id;
pub mod processing_step;
pub mod qr_doc;
pub mod validation;
