//! Error types for the cadmirror CLI.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=db, 3=not_found, 4=validation, 5=remote, etc.)
//! - Retryability flags that drive the remote client's backoff loop
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cadmirror operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
///
/// Each code maps to a SCREAMING_SNAKE string and a category-based
/// exit code. Scripts match on the string or on the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Database (exit 2)
    NotInitialized,
    AlreadyInitialized,
    DatabaseError,

    // Not Found (exit 3)
    NotFound,

    // Validation (exit 4)
    InvalidArgument,

    // Remote (exit 5)
    NetworkError,
    RemoteTimeout,
    RemoteStatus,
    AuthFailed,
    SigningError,
    DecodeError,

    // Sync (exit 6)
    Cancelled,
    SyncError,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::AlreadyInitialized => "ALREADY_INITIALIZED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::RemoteTimeout => "REMOTE_TIMEOUT",
            Self::RemoteStatus => "REMOTE_STATUS",
            Self::AuthFailed => "AUTH_FAILED",
            Self::SigningError => "SIGNING_ERROR",
            Self::DecodeError => "DECODE_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::SyncError => "SYNC_ERROR",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-8).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::NotInitialized | Self::AlreadyInitialized | Self::DatabaseError => 2,
            Self::NotFound => 3,
            Self::InvalidArgument => 4,
            Self::NetworkError
            | Self::RemoteTimeout
            | Self::RemoteStatus
            | Self::AuthFailed
            | Self::SigningError
            | Self::DecodeError => 5,
            Self::Cancelled | Self::SyncError => 6,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in cadmirror operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not initialized: run `cm init` first")]
    NotInitialized,

    #[error("Already initialized at {path}")]
    AlreadyInitialized { path: PathBuf },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection-level failure (DNS, TLS, reset) before a status was received.
    #[error("Network error: {0}")]
    Network(String),

    /// A single remote call exceeded its time bound.
    #[error("Remote call timed out: {0}")]
    Timeout(String),

    /// The remote rejected our credentials or signature.
    #[error("Authentication failed ({status}): {body}")]
    Auth { status: u16, body: String },

    /// Any other non-2xx response.
    #[error("Remote returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body could not be interpreted.
    #[error("Malformed remote payload: {0}")]
    Decode(String),

    #[error("Request signing failed: {0}")]
    Signing(String),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::AlreadyInitialized { .. } => ErrorCode::AlreadyInitialized,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Network(_) => ErrorCode::NetworkError,
            Self::Timeout(_) => ErrorCode::RemoteTimeout,
            Self::Auth { .. } => ErrorCode::AuthFailed,
            Self::Status { .. } => ErrorCode::RemoteStatus,
            Self::Decode(_) => ErrorCode::DecodeError,
            Self::Signing(_) => ErrorCode::SigningError,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Sync(_) => ErrorCode::SyncError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Whether the remote call that produced this error may be retried.
    ///
    /// Transport failures, per-call timeouts, 5xx and 429 are transient.
    /// Auth, other 4xx and malformed payloads are permanent.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// True when the remote answered that the resource has nothing to give.
    ///
    /// Used to tell "field absent" apart from "fetch failed" on best-effort calls.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Status { status: 400 | 404, .. })
    }

    /// Context-aware recovery hint.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::NotInitialized => Some("Run `cm init` to create the mirror database".to_string()),

            Self::AlreadyInitialized { path } => Some(format!(
                "Database already exists at {}. Use `--force` to reinitialize.",
                path.display()
            )),

            Self::NotFound { entity, .. } => {
                let entity = entity.to_lowercase();
                Some(format!(
                    "The {entity} is not recorded yet. Run `cm sync full`, or list with `cm {entity}s`."
                ))
            }

            Self::Config(_) => Some(
                "Set ONSHAPE_ACCESS_KEY and ONSHAPE_SECRET_KEY, or add them to ~/.cadmirror/config.json"
                    .to_string(),
            ),

            Self::Auth { .. } => Some(
                "Check the API key pair and the local clock; signatures are time-sensitive."
                    .to_string(),
            ),

            Self::Network(_) | Self::Timeout(_) => Some(
                "The remote API is unreachable. Check connectivity or raise request_timeout_secs."
                    .to_string(),
            ),

            Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::InvalidArgument(_)
            | Self::Status { .. }
            | Self::Decode(_)
            | Self::Signing(_)
            | Self::Cancelled
            | Self::Sync(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": self.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}
