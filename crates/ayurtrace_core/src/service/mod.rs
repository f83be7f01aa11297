//! Core use-case services.
//!
//! # Responsibility
//! - Turn caller input into validated records and repository calls.
//! - Keep transport layers decoupled from storage details.

pub mod provenance_service;
