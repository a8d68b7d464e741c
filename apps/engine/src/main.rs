mod config;
mod database;
mod pool;
mod roster;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use scorecheck::{CycleRunner, Dispatcher, LogSink, ResultSink};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::database::ResultStore;
use crate::roster::Roster;

#[derive(Debug, Parser)]
#[command(version, about = "Runs scored service checks against every team, once per cycle")]
struct Cli {
    /// Config file, defaults to $XDG_CONFIG_HOME/scorecheck/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Roster file, overrides `engine.roster`
    #[arg(short, long)]
    roster: Option<PathBuf>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_config(cli.config.as_ref()).context("loading configuration")?;
    logger::init_with_level(&config.logging.level)?;
    info!("{}", config);

    let roster_path = cli.roster.unwrap_or_else(|| config.engine.roster.clone());
    let roster = Roster::load(&roster_path)?;
    if roster.is_empty() {
        warn!("Roster {} has no checks configured", roster_path.display());
    } else {
        info!(
            "Loaded {} checks for {} teams from {}",
            roster.len(),
            roster.teams.len(),
            roster_path.display()
        );
    }

    let dispatcher = Dispatcher::new(config.prober_settings()).context("building probers")?;
    let mut runner = CycleRunner::new(Arc::new(dispatcher), config.score_table()?);
    if let Some(limit) = config.engine.max_concurrency {
        runner = runner.max_concurrency(limit);
    }

    let store = if config.database.enabled {
        let store = ResultStore::open(&config.database.path)
            .await
            .with_context(|| format!("opening {}", config.database.path.display()))?;
        Some(store)
    } else {
        None
    };
    let sink: &dyn ResultSink = match &store {
        Some(store) => store,
        None => &LogSink,
    };

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        info!("Shutdown requested, finishing the current cycle");
        let _ = shutdown_tx.send(true);
    });

    let mut cycle_number: u64 = 0;
    loop {
        cycle_number += 1;
        let (checks, rejected) = roster.checks();
        for error in &rejected {
            sink.reject(error).await;
        }

        info!("Starting cycle {} with {} checks", cycle_number, checks.len());
        let summary = runner.run_cycle(checks, sink).await;
        for (team, points) in &summary.points_by_team {
            info!("Cycle {}: {} earned {} points", cycle_number, team, points);
        }

        if let Some(store) = &store {
            match store.standings().await {
                Ok(standings) => {
                    for (team, total) in standings {
                        info!("Standing: {} {}", team, total);
                    }
                }
                Err(e) => warn!("Failed to read standings: {:#}", e),
            }
        }

        if cli.once || *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.interval()) => {}
            Ok(()) = shutdown_rx.changed() => break,
        }
    }

    info!("Stopped after {} cycles", cycle_number);
    Ok(())
}
