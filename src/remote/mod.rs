//! Remote CAD API access.
//!
//! - [`signer`] - HMAC request signing
//! - [`client`] - Authenticated HTTP client
//! - [`retry`] - Backoff policy for transient failures
//! - [`types`] - Payload shapes

pub mod client;
pub mod retry;
pub mod signer;
pub mod types;

pub use client::OnshapeClient;
pub use retry::RetryConfig;
pub use types::{BestEffort, DocumentPage, DocumentQuery, ExportUnits, RemoteUser};

use crate::error::Result;
use serde_json::Value;
use std::future::Future;

/// The remote reads the sync engine depends on.
///
/// Implemented by [`OnshapeClient`]; tests substitute an in-process fake.
pub trait RemoteApi: Send + Sync {
    /// Fetch one page of the document listing.
    fn list_documents(&self, query: &DocumentQuery)
    -> impl Future<Output = Result<DocumentPage>> + Send;

    /// Fetch a single document's detail.
    fn document(&self, document_id: &str) -> impl Future<Output = Result<Value>> + Send;

    fn workspaces(&self, document_id: &str) -> impl Future<Output = Result<Vec<Value>>> + Send;

    fn elements(
        &self,
        document_id: &str,
        workspace_id: &str,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send;

    fn parts(
        &self,
        document_id: &str,
        workspace_id: &str,
        element_id: &str,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send;

    fn features(
        &self,
        document_id: &str,
        workspace_id: &str,
        element_id: &str,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send;

    fn mass_properties(
        &self,
        document_id: &str,
        workspace_id: &str,
        element_id: &str,
        part_id: &str,
    ) -> impl Future<Output = Result<Value>> + Send;
}
