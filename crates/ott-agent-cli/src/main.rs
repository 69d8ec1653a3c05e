// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use ott_agent::config::{self, log_level::LogLevel};
use ott_agent::disk_queue::QueueSettings;
use ott_agent::logger::Formatter;
use ott_agent::queue_monitor::QueueMonitor;
use ott_agent::wire::WireSender;

#[derive(Parser)]
#[command(name = "ott-agent")]
#[command(about = "Inspect and drain the ott-agent disk queue")]
#[command(version)]
struct Cli {
    /// Directory holding ott-agent.yaml, environment variables apply on top
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,

    /// Overrides the configured log level
    #[arg(short, long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print queue statistics as JSON
    Stats,

    /// Print the most recent queued events as JSON, newest first
    Recent {
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },

    /// Attempt delivery of every queued event
    Flush,

    /// Purge expired items and orphan sidecars
    Gc,

    /// Print statistics periodically until interrupted
    Watch {
        /// Seconds between two samples
        #[arg(short, long, default_value_t = 5)]
        interval: u64,

        /// Flush the queue on every tick
        #[arg(long)]
        flush: bool,
    },
}

fn init_logging(log_level: LogLevel) -> anyhow::Result<()> {
    let env_filter = format!("rustls=off,{}", log_level.as_ref());
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter).context("could not parse log level")?)
        .event_format(Formatter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    debug!("Logging subsystem enabled");
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn watch(monitor: QueueMonitor, seconds: u64, flush: bool) -> anyhow::Result<()> {
    let mut ticker = interval(Duration::from_secs(seconds.max(1)));
    let monitor = Arc::new(monitor);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let monitor = Arc::clone(&monitor);
                // Queue I/O and delivery are blocking
                let stats = tokio::task::spawn_blocking(move || {
                    if flush && !monitor.flush() {
                        error!("Flush did not complete");
                    }
                    monitor.get_stats()
                })
                .await?;
                println!("{}", serde_json::to_string(&stats)?);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping watch");
                return Ok(());
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = config::get_config(cli.config_dir.as_deref()).context("invalid configuration")?;
    init_logging(cli.log_level.unwrap_or(config.log_level))?;

    let sender = Arc::new(WireSender::new(&config));
    let monitor = QueueMonitor::new(QueueSettings::from_config(&config), Some(sender));

    match cli.command {
        Commands::Stats => print_json(&monitor.get_stats()),
        Commands::Recent { limit } => print_json(&monitor.get_recent_events(limit)),
        Commands::Flush => {
            if monitor.flush() {
                print_json(&monitor.get_stats())
            } else {
                anyhow::bail!("flush of {} failed", config.disk_queue_dir.display())
            }
        }
        Commands::Gc => {
            let removed = monitor
                .gc()
                .with_context(|| format!("gc of {}", config.disk_queue_dir.display()))?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
        Commands::Watch { interval, flush } => watch(monitor, interval, flush).await,
    }
}

#[tokio::main]
pub async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
