//! Command-line entry point.
//!
//! Each subcommand is one short-lived run meant to be triggered by an
//! external scheduler (cron, systemd timers):
//! - `sync` / `fetch` / `run` every 10 minutes
//! - `export` shortly after each hour

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use sta_hydro::catalog::sync_catalog;
use sta_hydro::config::{Config, ConfigError};
use sta_hydro::db::Store;
use sta_hydro::error::PipelineError;
use sta_hydro::export::{ExportOptions, HourSelection, export_hour, parse_local_hour};
use sta_hydro::fetch::fetch_window;
use sta_hydro::logging::{self, Component};
use sta_hydro::model::RunStatus;
use sta_hydro::verify::{print_summary, run_verification};

#[derive(Parser, Debug)]
#[command(name = "sta_hydro")]
#[command(about = "SensorThings hydrology ingest: catalog sync, windowed fetch, hourly CSV export")]
struct Args {
    /// Configuration file (TOML); defaults to ./sta_hydro.toml when present
    #[arg(long, env = "STA_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or migrate the database schema
    InitDb,

    /// Sync stations and datastreams from every base
    Sync,

    /// Fetch the trailing observation window
    Fetch {
        /// Window length (default from config)
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        window_minutes: Option<u32>,
    },

    /// Catalog sync followed by a window fetch
    Run,

    /// Write hourly CSV files (last complete hour by default)
    Export {
        /// Export the hour in progress
        #[arg(long)]
        current: bool,

        /// Export an explicit local hour, YYYY-MM-DDTHH
        #[arg(long, conflicts_with = "current", value_parser = parse_local_hour)]
        hour: Option<NaiveDateTime>,
    },

    /// Probe every base and print a verification report
    Probe {
        /// Datastreams to sample per base
        #[arg(long, default_value = "20")]
        sample: usize,
    },
}

fn main() -> ExitCode {
    // Load environment from .env file if present
    dotenv::dotenv().ok();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_logging(
        &config.logging.level,
        config.logging.file.as_deref(),
        config.logging.json,
    ) {
        eprintln!("failed to open log file: {}", e);
        return ExitCode::FAILURE;
    }

    match run(&args.command, &config) {
        Ok(RunStatus::Failed) => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(component = %Component::System, error = %e, "run aborted");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = Config::load(args.config.as_deref())?;
    config.apply_overrides(|key| std::env::var(key).ok())?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run(command: &Command, config: &Config) -> Result<RunStatus, PipelineError> {
    match command {
        Command::InitDb => {
            let store = Store::open(&config.db_path)?;
            let counts = store.counts()?;
            info!(
                component = %Component::Database,
                path = %config.db_path.display(),
                stations = counts.stations,
                datastreams = counts.datastreams,
                observations = counts.observations,
                "database initialized"
            );
            Ok(RunStatus::Success)
        }
        Command::Sync => {
            let chain = config.source_chain()?;
            let store = Store::open(&config.db_path)?;
            Ok(sync_catalog(&chain, &store, &config.sync_options())?.status)
        }
        Command::Fetch { window_minutes } => {
            let chain = config.source_chain()?;
            let mut store = Store::open(&config.db_path)?;
            let window = window_minutes.unwrap_or(config.window_minutes);
            Ok(fetch_window(&chain, &mut store, window, Utc::now())?.status)
        }
        Command::Run => {
            let chain = config.source_chain()?;
            let mut store = Store::open(&config.db_path)?;
            let synced = sync_catalog(&chain, &store, &config.sync_options())?;
            let fetched = fetch_window(&chain, &mut store, config.window_minutes, Utc::now())?;
            Ok(worst(synced.status, fetched.status))
        }
        Command::Export { current, hour } => {
            let selection = match (hour, current) {
                (Some(hour), _) => HourSelection::At(*hour),
                (None, true) => HourSelection::Current,
                (None, false) => HourSelection::LastComplete,
            };
            let options = ExportOptions {
                output_root: config.output_root.clone(),
                tz: config.tz()?,
                fill_missing_grid: config.fill_missing_grid,
                filter: config.export_filter(),
                placeholder_metrics: config.placeholder_metrics(),
                selection,
            };
            let store = Store::open(&config.db_path)?;
            Ok(export_hour(&store, &options, Utc::now())?.status)
        }
        Command::Probe { sample } => {
            let chain = config.source_chain()?;
            let report = run_verification(&chain, *sample, Utc::now());
            print_summary(&report);
            Ok(if report.summary.working == 0 {
                RunStatus::Failed
            } else if report.summary.failed > 0 {
                RunStatus::Partial
            } else {
                RunStatus::Success
            })
        }
    }
}

fn worst(a: RunStatus, b: RunStatus) -> RunStatus {
    match (a, b) {
        (RunStatus::Failed, _) | (_, RunStatus::Failed) => RunStatus::Failed,
        (RunStatus::Partial, _) | (_, RunStatus::Partial) => RunStatus::Partial,
        _ => RunStatus::Success,
    }
}
