//! Constant virtual-user runner
//!
//! Starts every virtual user at once and keeps each one iterating until the
//! run deadline. No iteration starts after the deadline; iterations still in
//! flight get the graceful stop window to finish before their VU is aborted.

use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::check::CheckRegistry;
use crate::client::Connector;
use crate::config::{Config, ConfigError};
use crate::scenario::{CalculatorScenario, VirtualUser};
use crate::schema::{ProtoSchema, SchemaError};
use crate::stats::{RunStats, RunSummary};

/// Errors that prevent a run from starting
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Scenario setup failed: {0}")]
    Setup(#[from] SchemaError),
}

/// Drives a fixed pool of virtual users for the configured duration
pub struct LoadRunner {
    config: Arc<Config>,
    scenario: Arc<CalculatorScenario>,
    checks: Arc<CheckRegistry>,
    stats: Arc<RunStats>,
}

impl LoadRunner {
    /// Validate the configuration and resolve the scenario before any VU starts
    pub fn new(
        config: Config,
        schema: &ProtoSchema,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, RunError> {
        config.validate()?;

        let checks = Arc::new(CheckRegistry::new());
        let stats = Arc::new(RunStats::new());
        let scenario =
            CalculatorScenario::new(&config, schema, connector, checks.clone(), stats.clone())?;

        Ok(Self {
            config: Arc::new(config),
            scenario: Arc::new(scenario),
            checks,
            stats,
        })
    }

    /// Run to completion and summarise
    pub async fn run(&self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = start + self.config.scenario.duration;
        let hard_stop = deadline + self.config.scenario.graceful_stop;

        info!(
            "Run {} starting: {} VUs for {:?} against {} ({} connections)",
            run_id,
            self.config.scenario.vus,
            self.config.scenario.duration,
            self.config.target.address,
            self.config.target.connection_scope
        );
        let methods: Vec<String> = self
            .scenario
            .methods()
            .iter()
            .map(|m| m.full_name())
            .collect();
        debug!("Methods per iteration: {:?}", methods);

        let handles: Vec<_> = (1..=self.config.scenario.vus)
            .map(|id| tokio::spawn(run_virtual_user(self.scenario.clone(), id, deadline)))
            .collect();
        let aborts: Vec<AbortHandle> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout_at(hard_stop, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("Virtual user task failed: {}", e);
                    }
                }
            }
            Err(_) => {
                let still_running = aborts.iter().filter(|a| !a.is_finished()).count();
                for handle in &aborts {
                    handle.abort();
                }
                self.stats.record_interrupted(still_running as u64);
                warn!(
                    "Graceful stop of {:?} expired, interrupted {} virtual users",
                    self.config.scenario.graceful_stop, still_running
                );
            }
        }

        let elapsed = start.elapsed();
        let summary = RunSummary::collect(
            &self.config,
            run_id,
            started_at,
            elapsed,
            &self.stats,
            self.checks.snapshot(),
        );
        info!(
            "Run {} finished in {:.1}s: {} iterations, {:.2}% checks passed",
            run_id,
            elapsed.as_secs_f64(),
            summary.iterations_completed,
            summary.checks_pass_rate() * 100.0
        );
        summary
    }
}

/// Iterate until the deadline, then release the VU's resources
async fn run_virtual_user(scenario: Arc<CalculatorScenario>, id: usize, deadline: Instant) {
    let mut vu = VirtualUser::new(id);
    debug!(vu = id, "Virtual user started");

    while Instant::now() < deadline {
        scenario.run_iteration(&mut vu, deadline).await;
    }

    scenario.teardown(&mut vu).await;
    debug!(
        vu = vu.id(),
        iterations = vu.iterations(),
        "Virtual user stopped"
    );
}
