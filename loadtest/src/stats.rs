//! Run statistics and the end-of-run summary

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hdrhistogram::Histogram;
use metrics::{counter, histogram};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::check::CheckTally;
use crate::config::{Config, ConnectionScope};

/// Upper bound of recordable latency, in microseconds (1 hour)
const MAX_LATENCY_US: u64 = 60 * 60 * 1_000_000;

/// Latency distribution of answered calls, recorded in microseconds
#[derive(Debug, Clone)]
pub struct LatencyStats {
    histogram: Histogram<u64>,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    pub fn new() -> Self {
        Self {
            histogram: Histogram::new_with_bounds(1, MAX_LATENCY_US, 3)
                .expect("constant histogram bounds are valid"),
        }
    }

    pub fn record(&mut self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        if let Err(e) = self.histogram.record(us.clamp(1, MAX_LATENCY_US)) {
            warn!("Failed to record latency: {}", e);
        }
    }

    pub fn len(&self) -> usize {
        self.histogram.len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Calculate percentile (0-100)
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_micros(
            self.histogram.value_at_quantile(p / 100.0),
        ))
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_micros(self.histogram.mean().round() as u64))
    }

    pub fn min(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| Duration::from_micros(self.histogram.min()))
    }

    pub fn max(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| Duration::from_micros(self.histogram.max()))
    }

    /// Summarise the samples, `None` when nothing was recorded
    pub fn summarize(&self, method: &str) -> Option<MethodLatency> {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        Some(MethodLatency {
            method: method.to_string(),
            count: self.len(),
            avg_ms: ms(self.mean()?),
            min_ms: ms(self.min()?),
            med_ms: ms(self.percentile(50.0)?),
            p90_ms: ms(self.percentile(90.0)?),
            p95_ms: ms(self.percentile(95.0)?),
            p99_ms: ms(self.percentile(99.0)?),
            max_ms: ms(self.max()?),
        })
    }
}

/// Counters shared by all virtual users
#[derive(Debug, Default)]
pub struct RunStats {
    iterations_completed: AtomicU64,
    iterations_interrupted: AtomicU64,
    rpc_calls: AtomicU64,
    rpc_failures: AtomicU64,
    connections_opened: AtomicU64,
    connection_failures: AtomicU64,
    connections_closed: AtomicU64,
    /// Latency of answered calls, keyed by method name
    latencies: DashMap<String, LatencyStats>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_iteration(&self) {
        self.iterations_completed.fetch_add(1, Ordering::Relaxed);
        counter!("calculator_loadtest_iterations_total").increment(1);
    }

    pub fn record_interrupted(&self, count: u64) {
        self.iterations_interrupted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_connect(&self, ok: bool) {
        if ok {
            self.connections_opened.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connection_failures.fetch_add(1, Ordering::Relaxed);
            counter!("calculator_loadtest_connection_failures_total").increment(1);
        }
    }

    pub fn record_close(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call; `latency` is `None` when no status came back
    pub fn record_call(&self, method: &str, latency: Option<Duration>, ok: bool) {
        self.rpc_calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.rpc_failures.fetch_add(1, Ordering::Relaxed);
        }

        let result = if ok { "ok" } else { "error" };
        counter!(
            "calculator_loadtest_rpc_total",
            "method" => method.to_string(),
            "result" => result
        )
        .increment(1);

        if let Some(latency) = latency {
            histogram!(
                "calculator_loadtest_rpc_duration_seconds",
                "method" => method.to_string()
            )
            .record(latency.as_secs_f64());

            match self.latencies.get_mut(method) {
                Some(mut stats) => stats.record(latency),
                None => self
                    .latencies
                    .entry(method.to_string())
                    .or_default()
                    .record(latency),
            }
        }
    }

    pub fn iterations_completed(&self) -> u64 {
        self.iterations_completed.load(Ordering::Relaxed)
    }

    pub fn iterations_interrupted(&self) -> u64 {
        self.iterations_interrupted.load(Ordering::Relaxed)
    }

    pub fn rpc_calls(&self) -> u64 {
        self.rpc_calls.load(Ordering::Relaxed)
    }

    pub fn rpc_failures(&self) -> u64 {
        self.rpc_failures.load(Ordering::Relaxed)
    }

    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    pub fn connection_failures(&self) -> u64 {
        self.connection_failures.load(Ordering::Relaxed)
    }

    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }

    /// Latency summaries, sorted by method name
    pub fn method_latencies(&self) -> Vec<MethodLatency> {
        let mut methods: Vec<MethodLatency> = self
            .latencies
            .iter()
            .filter_map(|entry| entry.summarize(entry.key()))
            .collect();
        methods.sort_by(|a, b| a.method.cmp(&b.method));
        methods
    }
}

/// Latency summary of one method, in milliseconds
#[derive(Debug, Clone, Serialize)]
pub struct MethodLatency {
    pub method: String,
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub med_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Everything reported at the end of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub target: String,
    pub vus: usize,
    pub connection_scope: ConnectionScope,
    pub duration_secs: f64,
    pub elapsed_secs: f64,
    pub iterations_completed: u64,
    pub iterations_interrupted: u64,
    pub rpc_calls: u64,
    pub rpc_failures: u64,
    pub connections_opened: u64,
    pub connection_failures: u64,
    pub connections_closed: u64,
    pub methods: Vec<MethodLatency>,
    pub checks: Vec<CheckTally>,
}

impl RunSummary {
    /// Freeze the counters of a finished run
    pub fn collect(
        config: &Config,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        stats: &RunStats,
        checks: Vec<CheckTally>,
    ) -> Self {
        Self {
            run_id,
            started_at,
            target: config.target.address.clone(),
            vus: config.scenario.vus,
            connection_scope: config.target.connection_scope,
            duration_secs: config.scenario.duration.as_secs_f64(),
            elapsed_secs: elapsed.as_secs_f64(),
            iterations_completed: stats.iterations_completed(),
            iterations_interrupted: stats.iterations_interrupted(),
            rpc_calls: stats.rpc_calls(),
            rpc_failures: stats.rpc_failures(),
            connections_opened: stats.connections_opened(),
            connection_failures: stats.connection_failures(),
            connections_closed: stats.connections_closed(),
            methods: stats.method_latencies(),
            checks,
        }
    }

    /// Completed iterations per second of wall time
    pub fn iteration_rate(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.iterations_completed as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }

    /// Passed / recorded over all checks, zero when nothing was recorded
    pub fn checks_pass_rate(&self) -> f64 {
        let passes: u64 = self.checks.iter().map(|c| c.passes).sum();
        let total: u64 = self.checks.iter().map(CheckTally::total).sum();
        if total > 0 {
            passes as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Human readable summary
    pub fn report(&self) -> String {
        let mut out = String::new();
        let rule = "═══════════════════════════════════════════════════════════════";

        out.push_str(&format!("{rule}\n"));
        out.push_str(&format!(
            " RUN {} against {} ({} VUs, {:.0}s, {})\n",
            self.run_id, self.target, self.vus, self.duration_secs, self.connection_scope
        ));
        out.push_str(&format!("{rule}\n\n"));

        out.push_str(" ─── Checks ──────────────────────────────────────────────────\n");
        for check in &self.checks {
            let mark = if check.fails == 0 { "✓" } else { "✗" };
            out.push_str(&format!(
                "   {} {:<24} {:>6.2}%  ✓ {}  ✗ {}\n",
                mark,
                check.name,
                check.pass_rate() * 100.0,
                check.passes,
                check.fails
            ));
        }
        out.push('\n');

        out.push_str(" ─── Calls ───────────────────────────────────────────────────\n");
        out.push_str(&format!(
            "   {:<12} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
            "Method", "Count", "Avg", "Med", "P95", "P99", "Max"
        ));
        for m in &self.methods {
            out.push_str(&format!(
                "   {:<12} {:>8} {:>7.1}ms {:>7.1}ms {:>7.1}ms {:>7.1}ms {:>7.1}ms\n",
                m.method, m.count, m.avg_ms, m.med_ms, m.p95_ms, m.p99_ms, m.max_ms
            ));
        }
        out.push_str(&format!(
            "   {} calls, {} failed\n\n",
            self.rpc_calls, self.rpc_failures
        ));

        out.push_str(" ─── Execution ───────────────────────────────────────────────\n");
        out.push_str(&format!(
            "   Iterations:   {} complete, {} interrupted ({:.2}/s)\n",
            self.iterations_completed,
            self.iterations_interrupted,
            self.iteration_rate()
        ));
        out.push_str(&format!(
            "   Connections:  {} opened, {} failed, {} closed\n",
            self.connections_opened, self.connection_failures, self.connections_closed
        ));
        out.push_str(&format!("   Elapsed:      {:.1}s\n", self.elapsed_secs));
        out.push_str(&format!("{rule}\n"));

        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the JSON summary to `path`
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json)
    }
}
