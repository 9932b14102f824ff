//! Data models for cadmirror.
//!
//! Mirrored entity records live next to their queries in
//! [`crate::storage::sqlite`]; this module holds the job model and the
//! element-type vocabulary the cascade branches on.

pub mod job;

pub use job::{JobKind, JobStatus, SyncJob};

/// Element type whose parts and features are mirrored.
pub const PART_STUDIO: &str = "PARTSTUDIO";

/// Whether an element's type is a part studio.
///
/// Element types are an open vocabulary; anything else passes through
/// untouched and is never descended into.
#[must_use]
pub fn is_part_studio(element_type: Option<&str>) -> bool {
    element_type == Some(PART_STUDIO)
}
