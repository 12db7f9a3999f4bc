// fleetlink - tracker-to-vehicle reconciliation (headless)

mod exit_codes;
mod feed;
mod report;
mod sync;
mod vehicles;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use fleetlink_recon::Normalizer;
use serde::Serialize;

use exit_codes::{EXIT_INVALID_CONFIG, EXIT_SUCCESS, EXIT_USAGE};
use sync::SyncCommands;
use vehicles::VehiclesCommands;

#[derive(Parser)]
#[command(name = "fleetlink")]
#[command(about = "Link GPS trackers to fleet vehicles by license plate")]
#[command(version)]
#[command(long_version = long_version())]
struct Cli {
    /// More log output (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile trackers against vehicles (auto feed or manual entries)
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },

    /// Import or list vehicles
    Vehicles {
        #[command(subcommand)]
        command: VehiclesCommands,
    },

    /// Show active tracker mappings, or one tracker's history
    #[command(after_help = "\
Examples:
  fleetlink mappings --db fleet.db
  fleetlink mappings --db fleet.db --tracker 358000111 --json")]
    Mappings {
        #[arg(long)]
        db: PathBuf,

        /// Show every mapping this tracker has had, including closed ones
        #[arg(long)]
        tracker: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Print the normalized comparison key for one or more plates
    #[command(after_help = "\
Examples:
  fleetlink normalize 'أ ب ج 123' 'KSA ABJ-123'
  fleetlink normalize --config fleetlink.toml --json 'ABJ 123'")]
    Normalize {
        /// Raw plate strings
        #[arg(required = true)]
        plates: Vec<String>,

        /// Config providing extra letter mappings and region tokens
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// Config file helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Parse and validate a config without running
    Validate {
        /// Path to the TOML config
        file: PathBuf,
    },
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("FLEETLINK_COMMIT"), ")",
        "\ntarget:  ", env!("FLEETLINK_TARGET"),
    )
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Sync { command } => sync::cmd_sync(command),
        Commands::Vehicles { command } => vehicles::cmd_vehicles(command),
        Commands::Mappings { db, tracker, json } => vehicles::cmd_mappings(&db, tracker, json),
        Commands::Normalize { plates, config, json } => cmd_normalize(plates, config, json),
        Commands::Config {
            command: ConfigCommands::Validate { file },
        } => cmd_config_validate(file),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn new(code: u8, msg: impl Into<String>) -> Self {
        Self { code, message: msg.into(), hint: None }
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Self::new(EXIT_USAGE, msg)
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

// ============================================================================
// normalize
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NormalizedView {
    plate: String,
    normalized: String,
    core: String,
}

fn cmd_normalize(plates: Vec<String>, config: Option<PathBuf>, json: bool) -> Result<(), CliError> {
    let config = sync::load_config(config.as_deref())?;
    let normalizer = Normalizer::from_config(&config.normalizer);

    let views: Vec<NormalizedView> = plates
        .into_iter()
        .map(|plate| {
            let n = normalizer.normalize(&plate);
            NormalizedView {
                core: n.core_value(&config.normalizer.region_tokens),
                normalized: n.value,
                plate,
            }
        })
        .collect();

    if json {
        let json_str = serde_json::to_string_pretty(&views)
            .map_err(|e| CliError::usage(format!("JSON serialization error: {e}")))?;
        println!("{json_str}");
    } else {
        for v in &views {
            println!("{}\t{}\t{}", v.plate, v.normalized, v.core);
        }
    }
    Ok(())
}

// ============================================================================
// config validate
// ============================================================================

fn cmd_config_validate(file: PathBuf) -> Result<(), CliError> {
    let config = sync::load_config(Some(&file)).map_err(|e| {
        if e.code == EXIT_INVALID_CONFIG {
            e.with_hint("see `[matching]`, `[policy]`, `[normalizer]`, `[timeouts]` sections")
        } else {
            e
        }
    })?;
    eprintln!(
        "config OK: '{}' (auto-apply >= {}, margin {}, top {})",
        config.name,
        config.policy.auto_apply_threshold,
        config.policy.ambiguity_margin,
        config.matching.top_n
    );
    Ok(())
}
