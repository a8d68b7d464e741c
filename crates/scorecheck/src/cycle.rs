//! Cycle runner: fans a batch of checks out concurrently and yields scored
//! results in completion order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::check::ServiceCheck;
use crate::dispatcher::Dispatcher;
use crate::error::CheckError;
use crate::scoring::ScoreTable;

/// Default pause between cycles
pub const CYCLE_INTERVAL: Duration = Duration::from_secs(20);

/// Receives results as checks complete
#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    /// Store one scored check
    async fn record(&self, check: &ServiceCheck) -> anyhow::Result<()>;

    /// Handle a check that could not run because of a configuration defect
    async fn reject(&self, error: &CheckError) {
        error!("Rejected check: {}", error);
    }
}

/// Sink that only logs
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl ResultSink for LogSink {
    async fn record(&self, check: &ServiceCheck) -> anyhow::Result<()> {
        let code = check.outcome.code()?;
        info!(
            "[{}] {} {} on {}: {} ({} points) {}",
            check.team_name,
            check.service,
            check.target_id,
            check.target_host,
            code,
            check.points,
            check.outcome.participant().summary()
        );
        Ok(())
    }
}

/// One item drained from a running cycle
#[derive(Debug)]
pub enum CycleEvent {
    /// Probed and scored
    Completed(ServiceCheck),
    /// Refused before probing
    Rejected(CheckError),
}

/// A cycle in flight
pub struct Cycle {
    results: mpsc::Receiver<Result<ServiceCheck, CheckError>>,
    scores: ScoreTable,
}

impl Cycle {
    /// Next finished check, scored. `None` once every check has finished.
    pub async fn next(&mut self) -> Option<CycleEvent> {
        let event = match self.results.recv().await? {
            Ok(mut check) => {
                if let Err(e) = self.scores.score(&mut check) {
                    warn!("Could not score {} check on {}: {}", check.service, check.target_host, e);
                }
                CycleEvent::Completed(check)
            }
            Err(e) => CycleEvent::Rejected(e),
        };
        Some(event)
    }
}

/// What happened during one cycle
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub completed: usize,
    pub rejected: usize,
    /// Checks whose task ended without reporting back, e.g. a prober panic
    pub lost: usize,
    pub points_by_team: BTreeMap<String, u32>,
    pub elapsed: Duration,
}

pub struct CycleRunner {
    dispatcher: Arc<Dispatcher>,
    scores: ScoreTable,
    limit: Option<Arc<Semaphore>>,
}

impl CycleRunner {
    pub fn new(dispatcher: Arc<Dispatcher>, scores: ScoreTable) -> Self {
        Self { dispatcher, scores, limit: None }
    }

    /// Cap the number of probes in flight. Unbounded by default.
    pub fn max_concurrency(mut self, permits: usize) -> Self {
        self.limit = Some(Arc::new(Semaphore::new(permits.max(1))));
        self
    }

    /// Start every check at once
    pub fn launch(&self, checks: Vec<ServiceCheck>) -> Cycle {
        let (tx, rx) = mpsc::channel(checks.len().max(1));

        for check in checks {
            let tx = tx.clone();
            let dispatcher = self.dispatcher.clone();
            let limit = self.limit.clone();

            tokio::spawn(async move {
                let _permit = match limit {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                let result = dispatcher.dispatch(check).await;
                if tx.send(result).await.is_err() {
                    warn!("Cycle receiver dropped before a check finished");
                }
            });
        }

        Cycle { results: rx, scores: self.scores.clone() }
    }

    /// Run one full cycle, handing each result to `sink` as it completes
    pub async fn run_cycle(&self, checks: Vec<ServiceCheck>, sink: &dyn ResultSink) -> CycleSummary {
        let started = Instant::now();
        let total = checks.len();
        let mut summary = CycleSummary::default();
        let mut cycle = self.launch(checks);

        while let Some(event) = cycle.next().await {
            match event {
                CycleEvent::Completed(check) => {
                    summary.completed += 1;
                    *summary.points_by_team.entry(check.team_name.clone()).or_default() +=
                        check.points;
                    if let Err(e) = sink.record(&check).await {
                        warn!("Failed to record result for {}: {:#}", check.target_host, e);
                    }
                }
                CycleEvent::Rejected(e) => {
                    summary.rejected += 1;
                    sink.reject(&e).await;
                }
            }
        }

        summary.elapsed = started.elapsed();
        summary.lost = total.saturating_sub(summary.completed + summary.rejected);
        if summary.lost > 0 {
            error!("{} of {} checks ended without a result", summary.lost, total);
        }
        info!(
            "Cycle finished: {}/{} checks completed, {} rejected in {:.1}s",
            summary.completed,
            total,
            summary.rejected,
            summary.elapsed.as_secs_f64()
        );
        summary
    }
}
