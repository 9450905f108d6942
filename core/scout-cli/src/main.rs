//! scout: speculative fix evaluation from the command line.
//!
//! ## Subcommands
//!
//! - `evaluate`: rank candidate fixes (JSON file) for one error location
//! - `mirror`: replay JSON-lines edit events from stdin into a shadow copy
//! - `fingerprint`: print a project fingerprint or diff two trees
//!
//! Exit codes: 0 on success, 1 on error, 2 when a round was invalidated or
//! trees differ.

mod evaluate;
mod fingerprint;
mod logging;
mod mirror;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use scout_core::{load_config, ScoutConfig, ScoutError, StorageConfig, DEFAULT_ERROR_PATTERN};
use tracing::{error, warn};

#[derive(Parser)]
#[command(name = "scout")]
#[command(about = "Rank candidate fixes by building them on a shadow copy")]
#[command(version)]
struct Cli {
    /// Config file (defaults to {root}/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage root for shadows, snapshots and logs (defaults to ~/.scout)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate candidate fixes for an error location
    Evaluate {
        /// Project directory
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Error location as path:line, relative to the project
        #[arg(long)]
        location: String,

        /// JSON file with the candidate fixes
        #[arg(long)]
        fixes: PathBuf,

        /// Build command, run inside the shadow copy
        #[arg(long, default_value = "cargo check --message-format short")]
        build: String,

        /// Regex matched against each output line to count errors
        #[arg(long, default_value = DEFAULT_ERROR_PATTERN)]
        error_pattern: String,

        /// Per-build timeout in seconds (overrides config)
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Print the ranking as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay edit events (JSON lines on stdin) into a shadow copy
    Mirror {
        /// Project directory
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Archive the shadow after replaying
        #[arg(long)]
        snapshot: bool,
    },

    /// Print a project fingerprint, or compare it with another tree
    Fingerprint {
        /// Project directory
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Tree to compare against
        #[arg(long)]
        against: Option<PathBuf>,
    },
}

fn resolve_storage(root: Option<PathBuf>) -> Result<StorageConfig, ScoutError> {
    match root {
        Some(root) => Ok(StorageConfig::with_root(root)),
        None => StorageConfig::from_home(),
    }
}

fn main() {
    let cli = Cli::parse();

    let storage = match resolve_storage(cli.root) {
        Ok(storage) => storage,
        Err(err) => {
            eprintln!("scout: {}", err);
            std::process::exit(1);
        }
    };
    let logging_guard = logging::init(&storage.logs_dir());

    let config_path = cli.config.unwrap_or_else(|| storage.config_path());
    let config = match load_config(Some(config_path)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load scout config; using defaults");
            ScoutConfig::default()
        }
    };

    let outcome = match cli.command {
        Commands::Evaluate {
            project,
            location,
            fixes,
            build,
            error_pattern,
            timeout_secs,
            json,
        } => evaluate::run(
            evaluate::EvaluateArgs {
                project,
                location,
                fixes,
                build,
                error_pattern,
                timeout_secs,
                json,
            },
            storage,
            config,
        ),
        Commands::Mirror { project, snapshot } => {
            let stdin = std::io::stdin();
            mirror::run(
                mirror::MirrorArgs { project, snapshot },
                &storage,
                &config,
                stdin.lock(),
            )
            .and_then(|report| {
                serde_json::to_string_pretty(&report)
                    .map(|json| println!("{}", json))
                    .map_err(|err| ScoutError::Json {
                        context: "Failed to serialize mirror report".to_string(),
                        source: err,
                    })
            })
            .map(|_| true)
        }
        Commands::Fingerprint { project, against } => {
            fingerprint::run(&project, against.as_deref(), &config.fingerprint.ignore)
        }
    };

    let code = match outcome {
        Ok(true) => 0,
        Ok(false) => 2,
        Err(err) => {
            error!(error = %err, "scout failed");
            1
        }
    };
    // Flush the file appender before exiting.
    drop(logging_guard);
    std::process::exit(code);
}
