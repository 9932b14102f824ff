//! Live geometry export. Nothing is written to the mirror.

use crate::cli::ExportCommands;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::remote::OnshapeClient;
use std::fs;
use std::io::Write;

/// Execute export commands.
///
/// # Errors
///
/// Returns remote errors, or an IO error if the output cannot be written.
pub fn execute(command: &ExportCommands, settings: &Settings, json: bool) -> Result<()> {
    match command {
        ExportCommands::Stl {
            document_id,
            workspace_id,
            element_id,
            part_id,
            units,
            output,
        } => {
            let client = OnshapeClient::new(settings)?;
            let rt = tokio::runtime::Runtime::new()
                .map_err(|e| Error::Other(format!("Failed to create tokio runtime: {e}")))?;
            let bytes = rt.block_on(client.export_stl(
                document_id,
                workspace_id,
                element_id,
                part_id,
                *units,
            ))?;

            if let Some(path) = output {
                fs::write(path, &bytes)?;
                if json {
                    let output = serde_json::json!({
                        "path": path.display().to_string(),
                        "bytes": bytes.len(),
                        "units": units.as_str(),
                    });
                    println!("{output}");
                } else {
                    println!("Wrote {} bytes to {}", bytes.len(), path.display());
                }
            } else {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&bytes)?;
                stdout.flush()?;
            }
            Ok(())
        }
    }
}
