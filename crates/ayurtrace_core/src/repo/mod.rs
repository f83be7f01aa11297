//! Typed record access over the store gateway.
//!
//! # Responsibility
//! - Map provenance records onto gateway collections.
//! - Keep field names and collection choice out of the service layer.
//!
//! # Invariants
//! - Writes validate the record before any I/O.
//! - Reads reject persisted records that fail validation.

pub mod provenance_repo;
