//! Version command implementation.

use crate::error::Result;
use serde::Serialize;

#[derive(Serialize)]
struct VersionOutput<'a> {
    version: &'a str,
    build: &'a str,
    schema: i32,
}

/// Execute the version command.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn execute(json: bool) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let build = if cfg!(debug_assertions) {
        "dev"
    } else {
        "release"
    };
    let schema = crate::storage::schema::CURRENT_SCHEMA_VERSION;

    if json {
        let output = VersionOutput {
            version,
            build,
            schema,
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("cm version {version} ({build}, schema v{schema})");
    Ok(())
}
