//! cadmirror - a pull-based local mirror of remote CAD project data
//!
//! This crate provides the core functionality for the `cm` CLI tool.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface using clap
//! - [`config`] - Settings file, environment overrides and paths
//! - [`error`] - Error types and handling
//! - [`model`] - Job model and element-type vocabulary
//! - [`remote`] - Signed HTTP client for the remote CAD API
//! - [`storage`] - SQLite database layer
//! - [`sync`] - Reconciliation, job tracking, the cascade and its workers

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod remote;
pub mod storage;
pub mod sync;

pub use error::{Error, Result};

/// Global CSV output flag (set when `--format csv`).
pub static CSV_OUTPUT: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

/// Check if CSV output is requested.
#[inline]
pub fn is_csv() -> bool {
    CSV_OUTPUT.load(std::sync::atomic::Ordering::Relaxed)
}

/// Escape a value for CSV output (wrap in quotes if it contains commas, quotes, or newlines).
#[must_use]
pub fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
