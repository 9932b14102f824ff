//! cadmirror CLI entry point.

use clap::Parser;
use cm::cli::commands;
use cm::cli::{Cli, Commands, OutputFormat};
use cm::config::Settings;
use cm::error::Error;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.format == OutputFormat::Csv {
        cm::CSV_OUTPUT.store(true, std::sync::atomic::Ordering::Relaxed);
    }
    if cli.no_color {
        colored::control::set_override(false);
    }

    // Set up tracing based on verbosity
    init_tracing(cli.verbose, cli.quiet);

    // Resolve effective JSON mode: --json OR --format json OR non-TTY stdout
    let json = cli.json
        || cli.format == OutputFormat::Json
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    match run(&cli, json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                eprintln!("{}", e.to_structured_json());
            } else if !cli.quiet {
                if let Some(hint) = e.hint() {
                    eprintln!("Error: {e}\n  Hint: {hint}");
                } else {
                    eprintln!("Error: {e}");
                }
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(cli: &Cli, json: bool) -> Result<(), Error> {
    let db = cli.db.as_ref();

    match &cli.command {
        Commands::Init { force } => commands::init::execute(db, *force, json),
        Commands::Version => commands::version::execute(json),
        Commands::Completions { shell } => commands::completions::execute(shell),

        // Remote
        Commands::TestConnection => commands::connection::execute(&Settings::load()?, json),
        Commands::Sync { command } => {
            commands::sync::execute(command, db, &Settings::load()?, json)
        }
        Commands::Export { command } => {
            commands::export::execute(command, &Settings::load()?, json)
        }

        // Job history
        Commands::Jobs { command } => commands::jobs::execute(command, db, json),
        Commands::Stats => commands::stats::execute(db, json),

        // Mirror queries
        Commands::Documents(page) => commands::query::documents(*page, db, json),
        Commands::Workspaces { document, page } => {
            commands::query::workspaces(document.as_deref(), *page, db, json)
        }
        Commands::Elements {
            document,
            workspace,
            element_type,
            page,
        } => commands::query::elements(
            document.as_deref(),
            workspace.as_deref(),
            element_type.as_deref(),
            *page,
            db,
            json,
        ),
        Commands::Parts { element, page } => {
            commands::query::parts(element.as_deref(), *page, db, json)
        }
        Commands::Features {
            element,
            feature_type,
            page,
        } => commands::query::features(element.as_deref(), feature_type.as_deref(), *page, db, json),
        Commands::Show {
            entity,
            id,
            element,
        } => commands::query::show(*entity, id, element.as_deref(), db, json),
    }
}
