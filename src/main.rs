//! radapter - Main Entry Point
//!
//! Loads a configuration file, starts the runtime and keeps it running until
//! Ctrl-C or SIGTERM. With `--watch` the configuration is reloaded whenever
//! the file changes.

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{bounded, RecvTimeoutError};
use radapter::config::{self, LoadedConfig};
use radapter::{logging, RuntimeBuilder, ScriptEngine};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "radapter", version, about = "Multi-protocol data adapter runtime")]
struct Args {
    /// Configuration file (TOML)
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Log level or filter directives, overriding RUST_LOG and the config
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Reload the configuration when the file changes
    #[arg(long)]
    watch: bool,

    /// How often to look for configuration changes
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    watch_interval_ms: u64,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let loaded = config::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    if args.check {
        return Ok(check(&loaded));
    }

    let _log_guard = logging::init(&loaded.config.logging, args.log_level.as_deref())
        .context("Failed to initialize logging")?;
    tracing::info!("Starting radapter with {}", args.config.display());

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("Failed to install signal handler")?;

    let mut runtime = RuntimeBuilder::new(loaded)
        .start()
        .context("Failed to start runtime")?;

    let mut last_modified = config::modified(&args.config);
    let poll = if args.watch {
        Duration::from_millis(args.watch_interval_ms.max(50))
    } else {
        Duration::from_secs(3600)
    };

    loop {
        match stop_rx.recv_timeout(poll) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if !args.watch {
            continue;
        }

        let modified = config::modified(&args.config);
        if modified == last_modified {
            continue;
        }
        last_modified = modified;
        tracing::info!("Configuration changed, reloading");
        match config::load(&args.config) {
            Ok(next) => {
                if let Err(e) = runtime.reload(next) {
                    tracing::error!("Reload failed: {}", e);
                }
            }
            Err(e) => tracing::error!("Keeping current configuration: {}", e),
        }
    }

    tracing::info!("Shutting down...");
    let grace = runtime.settings().shutdown_grace();
    let report = runtime.shutdown(grace);
    if !report.routing_drained || report.undelivered > 0 {
        tracing::warn!(
            "Shutdown incomplete: routing drained = {}, {} message(s) undelivered",
            report.routing_drained,
            report.undelivered
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// Validate a configuration and print every issue
fn check(loaded: &LoadedConfig) -> ExitCode {
    let engine = ScriptEngine::new(&loaded.config.runtime.sandbox);
    let validated = loaded.validate(&engine);
    for issue in &validated.issues {
        eprintln!("{}", issue);
    }
    println!(
        "{} binding(s), {} edge(s) valid; {} issue(s)",
        validated.bindings.len(),
        validated.edges.len(),
        validated.issues.len()
    );
    if validated.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
