//! overlordd - Main entry point
//!
//! Runs the ensure loop as a daemon, or inspects a state file offline.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use overlord::cli::{Cli, Commands};
use overlord::shutdown::init_signal_handlers;
use overlord::{persist, Overlord, OverlordConfig, State, SystemClock};

/// Initialize the logger with appropriate settings
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    // RUST_LOG overrides the default level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    debug!("CLI arguments parsed");

    let result = match cli.command {
        Commands::Run { config, state } => run_daemon(config.as_deref(), state),
        Commands::Changes { state, json } => list_changes(&state, json),
        Commands::Tasks { change, state } => list_tasks(&state, change),
        Commands::Validate { config } => validate_config(&config),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}

/// Run the daemon until a signal or a fatal error stops it
fn run_daemon(config_path: Option<&Path>, state_path: Option<PathBuf>) -> Result<()> {
    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            OverlordConfig::load_from_file(path)?
        }
        None => OverlordConfig::default(),
    };
    if let Some(state_path) = state_path {
        config.state_path = state_path;
    }
    info!("overlordd starting, state at {:?}", config.state_path);

    let overlord = Overlord::new(config).context("Failed to initialize overlord")?;
    overlord.start_up().context("Start-up failed")?;

    // Signals cancel the loop; a second one exits immediately
    if let Err(e) = init_signal_handlers(overlord.cancel_token().clone(), overlord.state().clone())
    {
        tracing::warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("Signal handlers initialized");

    overlord.run()?;
    let loop_result = overlord.wait();
    overlord.stop().context("Shutdown failed")?;
    loop_result.context("Ensure loop stopped on a fatal error")?;
    Ok(())
}

fn read_state(path: &Path) -> Result<State> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read state file {:?}", path))?;
    let state = persist::decode_state(&bytes, Arc::new(SystemClock), None)
        .with_context(|| format!("Failed to parse state file {:?}", path))?;
    Ok(state)
}

/// Print one line per change
fn list_changes(path: &Path, json: bool) -> Result<()> {
    let state = read_state(path)?;
    let st = state.lock();

    if json {
        let changes: Vec<_> = st.changes().collect();
        println!("{}", serde_json::to_string_pretty(&changes)?);
        return Ok(());
    }

    println!(
        "{:<6} {:<8} {:<21} {:<21} {}",
        "ID", "Status", "Spawn", "Ready", "Summary"
    );
    for change in st.changes() {
        let status = st.change_status(change.id()).unwrap_or_default();
        let ready = change
            .ready_time()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<8} {:<21} {:<21} {}",
            change.id(),
            status,
            change.spawn_time().format("%Y-%m-%d %H:%M:%S"),
            ready,
            change.summary()
        );
    }
    Ok(())
}

/// Print the tasks of one change with their logs
fn list_tasks(path: &Path, change: u64) -> Result<()> {
    let state = read_state(path)?;
    let st = state.lock();
    let id = overlord::ChangeId::new(change);
    let change = st
        .change(id)
        .with_context(|| format!("No change with id {}", id))?;
    let status = st.change_status(id).unwrap_or_default();
    println!("Change {} ({}): {} [{}]", id, change.kind(), change.summary(), status);

    for task in st.change_tasks(id) {
        println!("{:<6} {:<8} {}", task.id(), task.status(), task.summary());
        if let Some(progress) = task.progress() {
            println!("       {} {}/{}", progress.label, progress.done, progress.total);
        }
        for entry in task.log() {
            println!("       {}", entry);
        }
    }
    if let Some(err) = st.change_err(id) {
        println!("\n{}", err);
    }
    Ok(())
}

fn validate_config(path: &Path) -> Result<()> {
    info!("Validating configuration file: {:?}", path);
    let config = OverlordConfig::load_from_file(path)?;
    config.validate()?;
    info!("Configuration validation successful");
    println!("✓ Configuration file is valid: {:?}", path);
    Ok(())
}
