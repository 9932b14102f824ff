//! CLI definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::model::{JobKind, JobStatus};
use crate::remote::ExportUnits;
use crate::sync::SyncRequest;

/// Output format for list/query commands.
#[derive(ValueEnum, Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table (default)
    #[default]
    Table,
    /// JSON (same as --json)
    Json,
    /// Comma-separated values
    Csv,
}

pub mod commands;

/// cadmirror - Pull-based local mirror of remote CAD project data
#[derive(Parser, Debug)]
#[command(name = "cm", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path (default: ~/.cadmirror/data/cadmirror.db)
    #[arg(long, global = true, env = "CM_DB")]
    pub db: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Output format (table, json, csv)
    #[arg(long, value_enum, global = true, default_value_t)]
    pub format: OutputFormat,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the mirror database
    Init {
        /// Overwrite an existing database
        #[arg(long)]
        force: bool,
    },

    /// Print version information
    Version,

    /// Check credentials against the remote and print the account
    TestConnection,

    /// Pull data from the remote into the mirror
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },

    /// Sync job history
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },

    /// Row counts and the most recent jobs
    Stats,

    /// List mirrored documents
    Documents(PageArgs),

    /// List mirrored workspaces
    Workspaces {
        /// Only workspaces of this document
        #[arg(long)]
        document: Option<String>,

        #[command(flatten)]
        page: PageArgs,
    },

    /// List mirrored elements
    Elements {
        /// Only elements of this document
        #[arg(long)]
        document: Option<String>,

        /// Only elements last seen in this workspace
        #[arg(long)]
        workspace: Option<String>,

        /// Element type (e.g. PARTSTUDIO, ASSEMBLY)
        #[arg(long = "type")]
        element_type: Option<String>,

        #[command(flatten)]
        page: PageArgs,
    },

    /// List mirrored parts
    Parts {
        /// Only parts of this part studio
        #[arg(long)]
        element: Option<String>,

        #[command(flatten)]
        page: PageArgs,
    },

    /// List mirrored features
    Features {
        /// Only features of this part studio
        #[arg(long)]
        element: Option<String>,

        /// Feature type (e.g. extrude)
        #[arg(long = "type")]
        feature_type: Option<String>,

        #[command(flatten)]
        page: PageArgs,
    },

    /// Show one mirrored record by external key
    Show {
        #[arg(value_enum)]
        entity: Entity,

        /// External key
        id: String,

        /// Part studio the part or feature belongs to
        #[arg(long)]
        element: Option<String>,
    },

    /// Export geometry straight from the remote
    Export {
        #[command(subcommand)]
        command: ExportCommands,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Supported shells for completions.
#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

/// Mirrored entity kinds addressable by `cm show`.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entity {
    Document,
    Workspace,
    Element,
    Part,
    Feature,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct PageArgs {
    /// Maximum rows
    #[arg(long, default_value_t = 20)]
    pub limit: u32,

    /// Rows to skip
    #[arg(long, default_value_t = 0)]
    pub offset: u32,
}

// ============================================================================
// Sync Commands
// ============================================================================

#[derive(Subcommand, Debug, Clone)]
pub enum SyncCommands {
    /// Mirror the document listing
    Documents {
        /// Re-fetch documents that are already mirrored
        #[arg(long)]
        force_refresh: bool,
    },

    /// Mirror a document's workspaces
    Workspaces {
        document_id: String,
    },

    /// Mirror a workspace's elements
    Elements {
        document_id: String,
        workspace_id: String,
    },

    /// Mirror a part studio's parts and their mass properties
    Parts {
        document_id: String,
        workspace_id: String,
        element_id: String,
    },

    /// Mirror a part studio's feature list
    Features {
        document_id: String,
        workspace_id: String,
        element_id: String,
    },

    /// Run the whole cascade
    Full {
        /// Limit the cascade to these documents (repeatable)
        #[arg(long = "document", value_name = "ID")]
        documents: Vec<String>,

        /// Re-fetch documents that are already mirrored
        #[arg(long)]
        force_refresh: bool,
    },
}

impl SyncCommands {
    /// The worker-pool request this command submits.
    #[must_use]
    pub fn to_request(&self) -> SyncRequest {
        match self.clone() {
            Self::Documents { force_refresh } => SyncRequest::Documents { force_refresh },
            Self::Workspaces { document_id } => SyncRequest::Workspaces { document_id },
            Self::Elements {
                document_id,
                workspace_id,
            } => SyncRequest::Elements {
                document_id,
                workspace_id,
            },
            Self::Parts {
                document_id,
                workspace_id,
                element_id,
            } => SyncRequest::Parts {
                document_id,
                workspace_id,
                element_id,
            },
            Self::Features {
                document_id,
                workspace_id,
                element_id,
            } => SyncRequest::Features {
                document_id,
                workspace_id,
                element_id,
            },
            Self::Full {
                documents,
                force_refresh,
            } => SyncRequest::Full {
                document_ids: documents,
                force_refresh,
            },
        }
    }
}

// ============================================================================
// Jobs Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum JobsCommands {
    /// List jobs, newest first
    List(JobsListArgs),

    /// Show a job and the jobs nested under it
    Show {
        /// Job ID
        id: i64,
    },
}

#[derive(Args, Debug)]
pub struct JobsListArgs {
    /// Filter by kind
    #[arg(long, value_enum)]
    pub kind: Option<JobKind>,

    /// Filter by status
    #[arg(long, value_enum)]
    pub status: Option<JobStatus>,

    /// Hide jobs nested under a full sync
    #[arg(long)]
    pub roots: bool,

    /// Maximum jobs to return
    #[arg(long, default_value_t = 50)]
    pub limit: u32,

    /// Jobs to skip
    #[arg(long, default_value_t = 0)]
    pub offset: u32,
}

// ============================================================================
// Export Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum ExportCommands {
    /// Export a part as binary STL
    Stl {
        document_id: String,
        workspace_id: String,
        element_id: String,
        part_id: String,

        /// Length units of the exported mesh
        #[arg(long, value_enum, default_value_t)]
        units: ExportUnits,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_full_sync_collects_repeated_documents() {
        let cli = Cli::parse_from([
            "cm", "sync", "full", "--document", "d1", "--document", "d2", "--force-refresh",
        ]);
        let Commands::Sync { command } = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(
            command.to_request(),
            SyncRequest::Full {
                document_ids: vec!["d1".into(), "d2".into()],
                force_refresh: true,
            }
        );
    }

    #[test]
    fn test_jobs_list_filters_parse() {
        let cli = Cli::parse_from([
            "cm", "jobs", "list", "--kind", "full_sync", "--status", "in_progress", "--limit", "5",
        ]);
        let Commands::Jobs {
            command: JobsCommands::List(args),
        } = cli.command
        else {
            panic!("expected jobs list");
        };
        assert_eq!(args.kind, Some(JobKind::FullSync));
        assert_eq!(args.status, Some(JobStatus::InProgress));
        assert_eq!(args.limit, 5);
    }

    #[test]
    fn test_export_units_default_to_meter() {
        let cli = Cli::parse_from(["cm", "export", "stl", "d", "w", "e", "p"]);
        let Commands::Export {
            command: ExportCommands::Stl { units, output, .. },
        } = cli.command
        else {
            panic!("expected export stl");
        };
        assert_eq!(units, ExportUnits::Meter);
        assert!(output.is_none());
    }
}
