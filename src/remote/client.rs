//! Authenticated HTTP client for the remote CAD API.

use reqwest::header::{ACCEPT, AUTHORIZATION, DATE};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::Settings;
use crate::error::{Error, Result};

use super::retry::RetryConfig;
use super::signer;
use super::types::{DocumentPage, DocumentQuery, ExportUnits, FeatureList, RemoteUser};
use super::RemoteApi;

const JSON: &str = "application/json";
const OCTET_STREAM: &str = "application/octet-stream";

/// HTTP client that signs every request.
pub struct OnshapeClient {
    http: reqwest::Client,
    api_root: String,
    access_key: String,
    secret_key: String,
    retry: RetryConfig,
}

impl std::fmt::Debug for OnshapeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnshapeClient")
            .field("api_root", &self.api_root)
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

impl OnshapeClient {
    /// Build a client from settings.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if credentials are missing or the HTTP client
    /// cannot be constructed.
    pub fn new(settings: &Settings) -> Result<Self> {
        let (access_key, secret_key) = settings.credentials()?;

        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_root: format!(
                "{}/{}",
                settings.base_url.trim_end_matches('/'),
                settings.api_version.trim_matches('/')
            ),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            retry: settings.retry_config(),
        })
    }

    /// Build the full URL, query included, for a relative API path.
    ///
    /// The query must be final here: the signature covers it.
    fn endpoint(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/{}", self.api_root, path))
            .map_err(|e| Error::Config(format!("Invalid API URL: {e}")))?;

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }

    /// Issue one signed GET. Signing happens here so every attempt gets
    /// its own nonce and date.
    async fn send_once(&self, url: &Url, accept: &str) -> Result<reqwest::Response> {
        let signed = signer::sign("GET", url, "", &self.access_key, &self.secret_key)?;

        let response = self
            .http
            .get(url.clone())
            .header(DATE, &signed.date)
            .header("On-Nonce", &signed.nonce)
            .header(AUTHORIZATION, &signed.authorization)
            .header(ACCEPT, accept)
            .send()
            .await
            .map_err(|e| transport_error(url, &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }

    async fn get_bytes(&self, path: &str, query: &[(&str, String)], accept: &str) -> Result<Vec<u8>> {
        let url = self.endpoint(path, query)?;
        tracing::debug!(url = %url, "GET");

        let url = &url;
        self.retry
            .run(path, move || async move {
                let response = self.send_once(url, accept).await?;
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| transport_error(url, &e))?;
                Ok(bytes.to_vec())
            })
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let bytes = self.get_bytes(path, query, JSON).await?;
        decode(path, &bytes)
    }

    /// Connectivity check: look up the authenticated account.
    ///
    /// Succeeds only if the signed identity lookup does, so a reachable
    /// server with bad credentials still fails.
    ///
    /// # Errors
    ///
    /// Propagates the remote error that made the lookup fail.
    pub async fn test_connection(&self) -> Result<RemoteUser> {
        match self.get_json::<RemoteUser>("users/current", &[]).await {
            Ok(user) => {
                tracing::debug!(user_id = %user.id, "Connection test succeeded");
                Ok(user)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Connection test failed");
                Err(e)
            }
        }
    }

    /// Export one part as binary STL.
    ///
    /// # Errors
    ///
    /// Propagates remote errors and rejects malformed ids.
    pub async fn export_stl(
        &self,
        document_id: &str,
        workspace_id: &str,
        element_id: &str,
        part_id: &str,
        units: ExportUnits,
    ) -> Result<Vec<u8>> {
        let path = part_studio_path(document_id, workspace_id, element_id, "stl")?;
        let query = [
            ("partId", part_id.to_string()),
            ("units", units.as_str().to_string()),
        ];
        self.get_bytes(&path, &query, OCTET_STREAM).await
    }
}

impl RemoteApi for OnshapeClient {
    async fn list_documents(&self, query: &DocumentQuery) -> Result<DocumentPage> {
        self.get_json("documents", &query.to_pairs()).await
    }

    async fn document(&self, document_id: &str) -> Result<Value> {
        let path = format!("documents/{}", segment(document_id)?);
        self.get_json(&path, &[]).await
    }

    async fn workspaces(&self, document_id: &str) -> Result<Vec<Value>> {
        let path = format!("documents/d/{}/workspaces", segment(document_id)?);
        self.get_json(&path, &[]).await
    }

    async fn elements(&self, document_id: &str, workspace_id: &str) -> Result<Vec<Value>> {
        let path = format!(
            "documents/d/{}/w/{}/elements",
            segment(document_id)?,
            segment(workspace_id)?
        );
        self.get_json(&path, &[]).await
    }

    async fn parts(&self, document_id: &str, workspace_id: &str, element_id: &str) -> Result<Vec<Value>> {
        let path = part_studio_path(document_id, workspace_id, element_id, "parts")?;
        self.get_json(&path, &[]).await
    }

    async fn features(&self, document_id: &str, workspace_id: &str, element_id: &str) -> Result<Vec<Value>> {
        let path = part_studio_path(document_id, workspace_id, element_id, "features")?;
        let list: FeatureList = self.get_json(&path, &[]).await?;
        Ok(list.features)
    }

    async fn mass_properties(
        &self,
        document_id: &str,
        workspace_id: &str,
        element_id: &str,
        part_id: &str,
    ) -> Result<Value> {
        let path = part_studio_path(document_id, workspace_id, element_id, "massproperties")?;
        self.get_json(&path, &[("partId", part_id.to_string())]).await
    }
}

fn part_studio_path(document_id: &str, workspace_id: &str, element_id: &str, tail: &str) -> Result<String> {
    Ok(format!(
        "partstudios/d/{}/w/{}/e/{}/{tail}",
        segment(document_id)?,
        segment(workspace_id)?,
        segment(element_id)?
    ))
}

/// Reject ids that would change the shape of the request path.
fn segment(id: &str) -> Result<&str> {
    if id.is_empty() || id.contains(['/', '?', '#', '%']) || id.chars().any(char::is_whitespace) {
        return Err(Error::InvalidArgument(format!("Invalid remote id: {id:?}")));
    }
    Ok(id)
}

fn transport_error(url: &Url, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(url.path().to_string())
    } else if e.is_decode() {
        Error::Decode(e.to_string())
    } else {
        Error::Network(e.to_string())
    }
}

fn status_error(status: StatusCode, body: String) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth {
            status: status.as_u16(),
            body,
        },
        _ => Error::Status {
            status: status.as_u16(),
            body,
        },
    }
}

/// Decode a JSON body. An empty body decodes as JSON `null`.
fn decode<T: DeserializeOwned>(path: &str, bytes: &[u8]) -> Result<T> {
    let bytes: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
        b"null"
    } else {
        bytes
    };
    serde_json::from_slice(bytes).map_err(|e| Error::Decode(format!("{path}: {e}")))
}
