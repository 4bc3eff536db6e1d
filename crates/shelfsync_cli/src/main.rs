//! Shelfsync CLI
//!
//! Keeps a local book library in sync with a remote record collection.
//!
//! # Commands
//!
//! - `sync` - Push pending changes, then pull remote changes
//! - `push` - Push pending changes only
//! - `pull` - Pull remote changes only
//! - `queue` - List queued changes
//! - `status` - Show cursors and queue counts
//! - `compact` - Rewrite the sync journal as a snapshot
//! - `book` - Edit the local library
//!
//! Exit status is 0 on a clean run, 1 when the run fails, and 2 when the run
//! finished but some items failed.

mod commands;
mod error;
mod http;
mod prompt;
mod workspace;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use error::CliResult;

/// Book library sync tool.
#[derive(Parser)]
#[command(name = "shelfsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the library and the sync journal
    #[arg(
        global = true,
        short,
        long,
        env = "SHELFSYNC_DATA_DIR",
        default_value = ".shelfsync"
    )]
    data_dir: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// How conflicts are resolved during a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    /// Ask on the terminal for each conflict
    Prompt,
    /// Remote always wins
    RemoteWins,
    /// Local always wins
    LocalWins,
    /// Later modification wins
    NewestWins,
    /// Leave conflicts for later
    Skip,
}

#[derive(Subcommand)]
enum Commands {
    /// Push pending changes, then pull remote changes
    Sync {
        /// Conflict resolution policy
        #[arg(short, long, value_enum, default_value = "prompt")]
        policy: PolicyArg,
    },

    /// Push pending changes only
    Push {
        /// Conflict resolution policy
        #[arg(short, long, value_enum, default_value = "prompt")]
        policy: PolicyArg,
    },

    /// Pull remote changes only
    Pull {
        /// Pull everything changed after this RFC 3339 time instead of the
        /// stored cursors
        #[arg(short, long)]
        since: Option<DateTime<Utc>>,

        /// Conflict resolution policy
        #[arg(short, long, value_enum, default_value = "prompt")]
        policy: PolicyArg,
    },

    /// List queued changes
    Queue {
        /// Include completed and abandoned items
        #[arg(short, long)]
        all: bool,
    },

    /// Show sync cursors and queue counts
    Status,

    /// Rewrite the sync journal as a single snapshot
    Compact,

    /// Edit the local library
    Book {
        #[command(subcommand)]
        command: BookCommand,
    },
}

#[derive(Subcommand)]
enum BookCommand {
    /// Add a book
    Add {
        /// Title
        #[arg(short, long)]
        title: String,

        /// Author
        #[arg(short, long)]
        author: Option<String>,

        /// ISBN
        #[arg(short, long)]
        isbn: Option<String>,
    },

    /// Set one field of a book. JSON values are stored as parsed, `null`
    /// removes the field, anything else is stored as text
    Set {
        /// Local book ID
        id: String,
        /// Field name
        field: String,
        /// New value
        value: String,
    },

    /// Remove a book
    Rm {
        /// Local book ID
        id: String,
    },

    /// List books
    List,
}

fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> CliResult<ExitCode> {
    let ws = workspace::Workspace::open(&cli.data_dir)?;

    match cli.command {
        Commands::Sync { policy } => commands::sync::run(&ws, commands::sync::Mode::Sync, policy),
        Commands::Push { policy } => commands::sync::run(&ws, commands::sync::Mode::Push, policy),
        Commands::Pull { since, policy } => {
            commands::sync::run(&ws, commands::sync::Mode::Pull { since }, policy)
        }
        Commands::Queue { all } => commands::queue::run(&ws, all).map(|()| ExitCode::SUCCESS),
        Commands::Status => commands::status::run(&ws).map(|()| ExitCode::SUCCESS),
        Commands::Compact => commands::status::compact(&ws).map(|()| ExitCode::SUCCESS),
        Commands::Book { command } => {
            match command {
                BookCommand::Add {
                    title,
                    author,
                    isbn,
                } => commands::book::add(&ws, title, author, isbn)?,
                BookCommand::Set { id, field, value } => {
                    commands::book::set(&ws, &id, field, &value)?
                }
                BookCommand::Rm { id } => commands::book::remove(&ws, &id)?,
                BookCommand::List => commands::book::list(&ws),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
