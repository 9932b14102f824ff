//! Create the mirror database.
//!
//! The schema is applied when the database is opened, so init only has to
//! lay out the directory and open the file once.

use crate::config::resolve_db_path;
use crate::error::{Error, Result};
use crate::storage::SqliteStorage;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct InitOutput {
    database: PathBuf,
    replaced: bool,
}

/// Execute the init command.
///
/// # Errors
///
/// Returns `AlreadyInitialized` if the database exists and `force` is not
/// set, or an error if the directory or database cannot be created.
pub fn execute(db_path: Option<&PathBuf>, force: bool, json: bool) -> Result<()> {
    let db_path = resolve_db_path(db_path.map(|p| p.as_path()))
        .ok_or_else(|| Error::Config("Could not determine the database location".to_string()))?;

    let replaced = create_database(&db_path, force)?;

    if json {
        let output = InitOutput {
            database: db_path,
            replaced,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("Initialized cadmirror database");
        println!("  Database: {}", db_path.display());
        println!();
        println!("Next: set ONSHAPE_ACCESS_KEY / ONSHAPE_SECRET_KEY and run 'cm test-connection'.");
    }

    Ok(())
}

/// Create the database at `path`. Returns whether an old one was replaced.
fn create_database(path: &Path, force: bool) -> Result<bool> {
    let existed = path.exists();
    if existed && !force {
        return Err(Error::AlreadyInitialized {
            path: path.to_path_buf(),
        });
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    if existed {
        fs::remove_file(path)?;
        for suffix in ["-wal", "-shm"] {
            let sidecar = PathBuf::from(format!("{}{suffix}", path.display()));
            if sidecar.exists() {
                fs::remove_file(sidecar)?;
            }
        }
    }

    SqliteStorage::open(path)?;
    Ok(existed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_database_with_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/mirror.db");

        assert!(!create_database(&path, false).unwrap());
        assert!(path.exists());

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.stats().unwrap().documents, 0);
    }

    #[test]
    fn test_init_refuses_existing_without_force() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mirror.db");
        create_database(&path, false).unwrap();

        let again = create_database(&path, false);
        assert!(matches!(again, Err(Error::AlreadyInitialized { .. })));
        assert!(create_database(&path, true).unwrap());
    }
}
