//! Connectivity check against the remote.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::remote::{OnshapeClient, RemoteUser};
use serde::Serialize;

#[derive(Serialize)]
struct ConnectionOutput<'a> {
    connected: bool,
    base_url: &'a str,
    user: RemoteUser,
}

/// Look up the authenticated account and print it.
///
/// # Errors
///
/// Returns a configuration error without credentials, or the remote error
/// that made the lookup fail.
pub fn execute(settings: &Settings, json: bool) -> Result<()> {
    let client = OnshapeClient::new(settings)?;
    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| Error::Other(format!("Failed to create tokio runtime: {e}")))?;

    let user = rt.block_on(client.test_connection())?;

    if json {
        let output = ConnectionOutput {
            connected: true,
            base_url: &settings.base_url,
            user,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("Connected to {}", settings.base_url);
        println!("  User:  {}", user.name.as_deref().unwrap_or(&user.id));
        if let Some(email) = &user.email {
            println!("  Email: {email}");
        }
    }

    Ok(())
}
