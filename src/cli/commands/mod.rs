//! Command implementations.

pub mod completions;
pub mod connection;
pub mod export;
pub mod init;
pub mod jobs;
pub mod query;
pub mod stats;
pub mod sync;
pub mod version;

use crate::config::resolve_db_path;
use crate::error::{Error, Result};
use crate::model::JobStatus;
use crate::storage::SqliteStorage;
use std::path::PathBuf;

/// Open the mirror database, which `cm init` must have created.
pub(crate) fn open_storage(db_path: Option<&PathBuf>) -> Result<SqliteStorage> {
    let db_path = resolve_db_path(db_path.map(|p| p.as_path())).ok_or(Error::NotInitialized)?;

    if !db_path.exists() {
        return Err(Error::NotInitialized);
    }

    SqliteStorage::open(&db_path)
}

/// Job status, colored for terminals.
pub(crate) fn paint_status(status: JobStatus) -> String {
    use colored::Colorize;

    match status {
        JobStatus::Success => status.as_str().green().to_string(),
        JobStatus::Error => status.as_str().red().to_string(),
        JobStatus::InProgress => status.as_str().yellow().to_string(),
    }
}

/// Millisecond timestamp as a UTC date-time string.
pub(crate) fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(0), "1970-01-01 00:00:00");
        assert_eq!(format_millis(1_700_000_000_000), "2023-11-14 22:13:20");
    }

    #[test]
    fn test_open_storage_requires_init() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope.db");
        assert!(matches!(open_storage(Some(&missing)), Err(Error::NotInitialized)));
    }
}
