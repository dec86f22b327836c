// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Resumable on-chain jobs.
//!
//! A job is a persisted record with a small state enum. Its processor maps the stored
//! state to the next action with a pure function and re-enters the same dispatch loop
//! after every persisted transition. Recovery after a restart loads every non-terminal
//! record and calls that loop again, there is no separate recovery path.

use crate::metrics::ChannelMetrics;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub mod cooperative_withdraw;
pub mod deposit;

/// Jobs currently being dispatched, so a job never has two drivers.
pub struct JobRegistry {
    running: Mutex<HashSet<(&'static str, String)>>,
    metrics: Arc<ChannelMetrics>,
}

impl JobRegistry {
    pub fn new(metrics: Arc<ChannelMetrics>) -> Self {
        Self {
            running: Mutex::new(HashSet::new()),
            metrics,
        }
    }

    /// Marks a job as running. Returns `None` if it already is.
    pub fn try_start(self: &Arc<Self>, kind: &'static str, id: &str) -> Option<RunningJobGuard> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert((kind, id.to_string())) {
            debug!("Job {} {} is already running", kind, id);
            return None;
        }
        self.metrics.jobs_running.with_label_values(&[kind]).inc();
        Some(RunningJobGuard {
            registry: self.clone(),
            kind,
            id: id.to_string(),
        })
    }

    pub fn is_running(&self, kind: &'static str, id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(kind, id.to_string()))
    }
}

/// Unmarks the job when dropped.
pub struct RunningJobGuard {
    registry: Arc<JobRegistry>,
    kind: &'static str,
    id: String,
}

impl Drop for RunningJobGuard {
    fn drop(&mut self) {
        let mut running = self
            .registry
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if running.remove(&(self.kind, std::mem::take(&mut self.id))) {
            self.registry
                .metrics
                .jobs_running
                .with_label_values(&[self.kind])
                .dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_runs_once_until_guard_drops() {
        let metrics = Arc::new(ChannelMetrics::new_for_testing());
        let registry = Arc::new(JobRegistry::new(metrics.clone()));

        let guard = registry.try_start("deposit", "job-1").unwrap();
        assert!(registry.try_start("deposit", "job-1").is_none());
        assert!(registry.is_running("deposit", "job-1"));
        // Same id under another kind is a different job.
        let other = registry.try_start("cooperative_withdraw", "job-1").unwrap();
        assert_eq!(metrics.jobs_running.with_label_values(&["deposit"]).get(), 1);

        drop(guard);
        drop(other);
        assert!(!registry.is_running("deposit", "job-1"));
        assert_eq!(metrics.jobs_running.with_label_values(&["deposit"]).get(), 0);
        assert!(registry.try_start("deposit", "job-1").is_some());
    }
}
