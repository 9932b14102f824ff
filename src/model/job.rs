//! Sync job model.
//!
//! A job is the durable record of one sync invocation. Jobs opened by a
//! full sync point at it through `parent_id`, so a cascade leaves a small
//! tree: one root plus one job per nested phase.

use serde::{Deserialize, Serialize};

/// What a job synchronised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum JobKind {
    Documents,
    Workspaces,
    Elements,
    Parts,
    Features,
    FullSync,
}

impl JobKind {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Documents => "documents",
            Self::Workspaces => "workspaces",
            Self::Elements => "elements",
            Self::Parts => "parts",
            Self::Features => "features",
            Self::FullSync => "full_sync",
        }
    }
}

/// Job lifecycle state. Moves only `in_progress -> success | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Success,
    Error,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Parse from string. Unknown values read as `Error`.
    #[must_use]
    pub fn from_str(s: &str) -> Self {
        match s {
            "in_progress" => Self::InProgress,
            "success" => Self::Success,
            _ => Self::Error,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// A sync job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    /// Root job of the cascade this job ran under
    pub parent_id: Option<i64>,
    /// Stored kind string, as written by [`JobKind::as_str`]
    pub kind: String,
    pub status: JobStatus,
    pub records_processed: i64,
    pub errors_count: i64,
    pub message: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    /// Free-form JSON: task id, target keys, cascade notes
    pub metadata: serde_json::Value,
}

impl SyncJob {
    /// Notes recorded in the metadata, if any.
    #[must_use]
    pub fn notes(&self) -> Vec<String> {
        self.metadata
            .get("notes")
            .and_then(serde_json::Value::as_array)
            .map(|notes| {
                notes
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Duration in milliseconds, once the job is closed.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_storage_strings() {
        assert_eq!(JobKind::FullSync.as_str(), "full_sync");
        assert_eq!(
            serde_json::to_value(JobKind::FullSync).unwrap(),
            serde_json::json!(JobKind::FullSync.as_str())
        );
    }

    #[test]
    fn test_status_terminality() {
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Error.is_terminal());
    }

    #[test]
    fn test_notes_from_metadata() {
        let job = SyncJob {
            id: 1,
            parent_id: None,
            kind: "full_sync".into(),
            status: JobStatus::Success,
            records_processed: 0,
            errors_count: 0,
            message: None,
            started_at: 10,
            completed_at: Some(25),
            metadata: serde_json::json!({"notes": ["d2: no workspaces"]}),
        };
        assert_eq!(job.notes(), vec!["d2: no workspaces".to_string()]);
        assert_eq!(job.duration_ms(), Some(15));
    }
}
