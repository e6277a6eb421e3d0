//! keel operator CLI
//!
//! Manages the password store and configuration used by `keeld`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keel_cli::commands::{self, PasswdTarget};
use keel_cli::output::print_error;

#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about = "Operator tool for the keel SSH server")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "KEEL_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the local password store
    Passwd {
        /// Password store to operate on (overrides config)
        #[arg(short, long, global = true)]
        file: Option<PathBuf>,

        #[command(subcommand)]
        action: PasswdAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum PasswdAction {
    /// Set or replace a user's password (read from the terminal or stdin)
    Set { username: String },
    /// Check a password against the store; exits 1 on mismatch
    Check { username: String },
    /// List users in the store
    List,
    /// Create an empty store
    Init,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show config file path
    Path,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

/// `Ok(false)` for a command that ran but reports failure
fn run(cli: Cli) -> Result<bool> {
    match cli.command {
        Commands::Passwd { file, action } => {
            let config = commands::load_server_config(cli.config.as_ref())?;
            let target = PasswdTarget::resolve(&config, file)?;

            match action {
                PasswdAction::Set { username } => commands::passwd_set(&target, &username)?,
                PasswdAction::Check { username } => {
                    return commands::passwd_check(&target, &username)
                }
                PasswdAction::List => commands::passwd_list(&target)?,
                PasswdAction::Init => commands::passwd_init(&target)?,
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(cli.config.as_ref())?,
            ConfigAction::Path => commands::config_path(cli.config.as_ref()),
            ConfigAction::Init { force } => return commands::config_init(cli.config.as_ref(), force),
        },
    }
    Ok(true)
}
