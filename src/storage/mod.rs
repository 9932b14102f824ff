//! SQLite storage layer for the mirror.
//!
//! This module provides the persistence layer using SQLite with:
//! - WAL mode for concurrent reads
//! - One IMMEDIATE transaction per reconciled batch
//! - A mutex-guarded shared handle so writes are single-writer
//!
//! # Submodules
//!
//! - [`schema`] - Database schema definitions
//! - [`sqlite`] - Main SQLite storage implementation

pub mod schema;
pub mod sqlite;

pub use sqlite::{
    Document, Element, Feature, JobFilter, MirrorStats, Part, SharedStorage, SqliteStorage,
    Upserted, Workspace,
};
