//! `fleetlink sync`: reconcile trackers against the vehicle table.

use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use fleetlink_recon::{
    DeviceFeed, ManualEntry, ReconConfig, ReconError, Reconciler, RunControl, SyncSummary,
};
use fleetlink_store::{SqliteStore, StoreOptions};
use log::{info, warn};

use crate::exit_codes::{
    EXIT_DEVICE_ERRORS, EXIT_FEED, EXIT_INVALID_CONFIG, EXIT_RUN_LOCKED, EXIT_STORAGE, EXIT_USAGE,
    EXIT_VALIDATION,
};
use crate::feed::{FileFeed, HttpFeed};
use crate::{report, CliError};

const MAX_LOCK_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Args)]
pub struct SyncArgs {
    /// SQLite database holding vehicles and mappings
    #[arg(long)]
    db: PathBuf,

    /// Reconciliation config (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output JSON to stdout instead of only the human summary
    #[arg(long)]
    json: bool,

    /// Write JSON output to file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Seconds before an abandoned run lock may be taken over
    #[arg(long, default_value_t = 900)]
    lock_ttl: u64,
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Discover devices from the provider feed and reconcile them
    #[command(after_help = "\
Examples:
  fleetlink sync auto --db fleet.db --config fleetlink.toml
  fleetlink sync auto --db fleet.db --feed-url https://tracking.example.com/api/devices --json
  fleetlink sync auto --db fleet.db --feed-file devices.json --output summary.json")]
    Auto {
        #[command(flatten)]
        args: SyncArgs,

        /// Provider device list URL (overrides [feed].url)
        #[arg(long, conflicts_with = "feed_file")]
        feed_url: Option<String>,

        /// Read the device list from a JSON file instead of the provider
        #[arg(long)]
        feed_file: Option<PathBuf>,

        /// Bearer token for the feed (default: env named by [feed].token_env)
        #[arg(long)]
        token: Option<String>,
    },

    /// Reconcile operator-supplied plate/tracker pairs
    #[command(after_help = "\
Examples:
  fleetlink sync manual --db fleet.db --entries entries.json
  fleetlink sync manual --db fleet.db --entries entries.json --json

entries.json is an array of {\"plate\", \"trackerId\", \"latitude\"?, \"longitude\"?, \"address\"?}")]
    Manual {
        #[command(flatten)]
        args: SyncArgs,

        /// JSON file with manual entries
        #[arg(long)]
        entries: PathBuf,
    },
}

pub fn cmd_sync(cmd: SyncCommands) -> Result<(), CliError> {
    match cmd {
        SyncCommands::Auto {
            args,
            feed_url,
            feed_file,
            token,
        } => {
            let config = load_config(args.config.as_deref())?;
            let mut feed = build_feed(&config, feed_url, feed_file, token)?;
            run_locked(&args, config, |engine, store, control| {
                engine.run_auto(feed.as_mut(), store, control)
            })
        }
        SyncCommands::Manual { args, entries } => {
            let config = load_config(args.config.as_deref())?;
            let entries = read_entries(&entries)?;
            run_locked(&args, config, |engine, store, control| {
                engine.run_manual(&entries, store, control)
            })
        }
    }
}

/// Load and validate a config file, or take defaults when none is given.
pub fn load_config(path: Option<&Path>) -> Result<ReconConfig, CliError> {
    let Some(path) = path else {
        return Ok(ReconConfig::default());
    };
    let config_str = std::fs::read_to_string(path)
        .map_err(|e| CliError::new(EXIT_USAGE, format!("cannot read config {}: {e}", path.display())))?;
    ReconConfig::from_toml(&config_str).map_err(|e| CliError::new(EXIT_INVALID_CONFIG, e.to_string()))
}

pub fn open_store(db: &Path, config: &ReconConfig) -> Result<SqliteStore, CliError> {
    let options = StoreOptions {
        busy_timeout: config.timeouts.repository(),
    };
    SqliteStore::open(db, options)
        .map_err(|e| CliError::new(EXIT_STORAGE, format!("cannot open {}: {e}", db.display())))
}

fn build_feed(
    config: &ReconConfig,
    feed_url: Option<String>,
    feed_file: Option<PathBuf>,
    token: Option<String>,
) -> Result<Box<dyn DeviceFeed>, CliError> {
    if let Some(path) = feed_file {
        return Ok(Box::new(FileFeed::new(path)));
    }

    let feed_config = config.feed.clone().unwrap_or_default();
    let url = feed_url.or(feed_config.url).ok_or_else(|| {
        CliError::new(EXIT_USAGE, "no device feed configured")
            .with_hint("pass --feed-url or --feed-file, or set [feed].url in the config")
    })?;

    let token = token
        .or_else(|| std::env::var(&feed_config.token_env).ok())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    if token.is_none() {
        warn!("no feed token (set {} or pass --token)", feed_config.token_env);
    }

    let feed = HttpFeed::new(&url, token, config.timeouts.feed())
        .map_err(|e| CliError::new(EXIT_FEED, e.to_string()))?;
    Ok(Box::new(feed))
}

fn read_entries(path: &Path) -> Result<Vec<ManualEntry>, CliError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CliError::new(EXIT_USAGE, format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| CliError::new(EXIT_VALIDATION, format!("invalid entries file: {e}")))
}

/// Open the store, hold the run lease for the duration of `run`, then report.
fn run_locked<F>(args: &SyncArgs, config: ReconConfig, run: F) -> Result<(), CliError>
where
    F: FnOnce(&Reconciler, &mut SqliteStore, &RunControl) -> Result<SyncSummary, ReconError>,
{
    let mut store = open_store(&args.db, &config)?;
    let owner = format!("fleetlink-{}", std::process::id());
    let ttl = chrono::Duration::seconds(args.lock_ttl.min(MAX_LOCK_TTL_SECS) as i64);

    let acquired = store
        .try_acquire_run_lock(&owner, chrono::Utc::now(), ttl)
        .map_err(|e| CliError::new(EXIT_STORAGE, e.to_string()))?;
    if !acquired {
        return Err(CliError::new(EXIT_RUN_LOCKED, "another sync run is in progress")
            .with_hint("wait for it to finish, or retry after --lock-ttl expires"));
    }

    let result = store
        .active_vehicles()
        .map_err(|e| CliError::new(EXIT_STORAGE, e.to_string()))
        .and_then(|vehicles| {
            info!("loaded {} active vehicles", vehicles.len());
            let engine = Reconciler::new(config, &vehicles);
            run(&engine, &mut store, &RunControl::default()).map_err(recon_error)
        });

    if let Err(e) = store.release_run_lock(&owner) {
        warn!("failed to release run lock: {e}");
    }

    let summary = result?;
    report::emit(&summary, args.json, args.output.as_deref())?;

    if !summary.errors.is_empty() {
        return Err(CliError::new(
            EXIT_DEVICE_ERRORS,
            format!("{} device(s) failed to save", summary.errors.len()),
        ));
    }
    Ok(())
}

fn recon_error(err: ReconError) -> CliError {
    let code = match &err {
        ReconError::ConfigParse(_) | ReconError::ConfigValidation(_) => EXIT_INVALID_CONFIG,
        ReconError::Validation { .. } => EXIT_VALIDATION,
        ReconError::Feed(_) => EXIT_FEED,
    };
    CliError::new(code, err.to_string())
}
