//! Recovery of runs whose hand-off to the worker was lost.
//!
//! A run is created `queued` and dispatched with an asynchronous invoke. If
//! the invoke is dropped, nothing else would ever pick the run up, so a
//! scheduled sweep re-dispatches queued runs that have sat idle too long and
//! gives up on those that keep getting lost.

use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatch::RunDispatcher;
use crate::pipeline::RunManager;
use crate::store::TicketStore;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    /// Queued runs idle for longer than this are considered lost.
    pub stale_after: Duration,
    pub batch_size: i64,
    /// Runs dispatched this many times are abandoned instead of retried.
    pub max_dispatch_attempts: i32,
}

impl SweepPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stale_after: config.stale_run_threshold,
            batch_size: config.sweep_batch_size,
            max_dispatch_attempts: config.max_dispatch_attempts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub examined: usize,
    pub redispatched: usize,
    pub abandoned: usize,
    pub failed: usize,
}

pub async fn sweep_stale_runs(
    store: &dyn TicketStore,
    dispatcher: &dyn RunDispatcher,
    manager: &RunManager,
    policy: &SweepPolicy,
) -> Result<SweepReport> {
    let stale_after = chrono::Duration::from_std(policy.stale_after)
        .map_err(|e| Error::Config(format!("Invalid stale run threshold: {}", e)))?;
    let cutoff = Utc::now() - stale_after;

    let runs = store.list_stale_queued_runs(cutoff, policy.batch_size).await?;
    let mut report = SweepReport {
        examined: runs.len(),
        ..Default::default()
    };

    for run in runs {
        if run.dispatch_attempts >= policy.max_dispatch_attempts {
            let reason = format!(
                "Run was never picked up after {} dispatch attempts",
                run.dispatch_attempts
            );
            match manager.abandon_run(run.id, &reason).await {
                Ok(_) => report.abandoned += 1,
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "Failed to abandon run");
                    report.failed += 1;
                }
            }
            continue;
        }

        // The attempt counts even if delivery fails, so a run whose worker is
        // unreachable still ends up abandoned.
        if let Err(e) = store.record_dispatch(run.id).await {
            error!(run_id = %run.id, error = %e, "Failed to record dispatch attempt; skipping run");
            report.failed += 1;
            continue;
        }
        match dispatcher.dispatch(run.id).await {
            Ok(()) => {
                info!(run_id = %run.id, attempt = run.dispatch_attempts + 1, "Re-dispatched stale run");
                report.redispatched += 1;
            }
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Failed to re-dispatch stale run");
                report.failed += 1;
            }
        }
    }

    info!(
        examined = report.examined,
        redispatched = report.redispatched,
        abandoned = report.abandoned,
        failed = report.failed,
        "Stale run sweep complete"
    );

    Ok(report)
}
