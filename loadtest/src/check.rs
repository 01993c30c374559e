//! Named pass/fail checks
//!
//! Every virtual user records into one shared registry; tallies are read once
//! at the end of the run for the summary.

use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Check recorded once per calculator call
pub const STATUS_IS_OK: &str = "status is OK";

#[derive(Debug, Default)]
struct Tally {
    passes: AtomicU64,
    fails: AtomicU64,
}

impl Tally {
    fn add(&self, passed: bool) {
        if passed {
            self.passes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fails.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Pass/fail counts of one named check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckTally {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

impl CheckTally {
    pub fn total(&self) -> u64 {
        self.passes + self.fails
    }

    /// Fraction of passing records (0.0 to 1.0), zero when nothing was recorded
    pub fn pass_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.passes as f64 / total as f64,
        }
    }
}

/// Concurrent registry of named checks
#[derive(Debug, Default)]
pub struct CheckRegistry {
    checks: DashMap<String, Tally>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one outcome for `name` and return it
    pub fn record(&self, name: &str, passed: bool) -> bool {
        match self.checks.get(name) {
            Some(tally) => tally.add(passed),
            None => self.checks.entry(name.to_string()).or_default().add(passed),
        }

        let result = if passed { "pass" } else { "fail" };
        counter!(
            "calculator_loadtest_checks_total",
            "check" => name.to_string(),
            "result" => result
        )
        .increment(1);

        passed
    }

    /// Current tally of one check
    pub fn get(&self, name: &str) -> Option<CheckTally> {
        self.checks.get(name).map(|tally| CheckTally {
            name: name.to_string(),
            passes: tally.passes.load(Ordering::Relaxed),
            fails: tally.fails.load(Ordering::Relaxed),
        })
    }

    /// All tallies, sorted by check name
    pub fn snapshot(&self) -> Vec<CheckTally> {
        let mut tallies: Vec<CheckTally> = self
            .checks
            .iter()
            .map(|entry| CheckTally {
                name: entry.key().clone(),
                passes: entry.passes.load(Ordering::Relaxed),
                fails: entry.fails.load(Ordering::Relaxed),
            })
            .collect();
        tallies.sort_by(|a, b| a.name.cmp(&b.name));
        tallies
    }
}
