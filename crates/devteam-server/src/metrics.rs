//! Prometheus metrics collection and formatting.
//!
//! Counters are bumped by the retry executor and the coordinator; gauges are
//! read from the run registry at scrape time.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use devteam_core::RunStatus;

use crate::state::AppState;

/// Process-wide counters.
#[derive(Debug, Default)]
pub struct Metrics {
    task_attempts: AtomicU64,
    task_retries: AtomicU64,
    tasks_skipped: AtomicU64,
    critical_failures: AtomicU64,
    checkpoint_failures: AtomicU64,
}

impl Metrics {
    pub fn record_attempt(&self, is_retry: bool) {
        self.task_attempts.fetch_add(1, Ordering::Relaxed);
        if is_retry {
            self.task_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_skip(&self) {
        self.tasks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_critical_failure(&self) {
        self.critical_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint_failure(&self) {
        self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_attempts(&self) -> u64 {
        self.task_attempts.load(Ordering::Relaxed)
    }

    pub fn task_retries(&self) -> u64 {
        self.task_retries.load(Ordering::Relaxed)
    }

    pub fn tasks_skipped(&self) -> u64 {
        self.tasks_skipped.load(Ordering::Relaxed)
    }

    pub fn critical_failures(&self) -> u64 {
        self.critical_failures.load(Ordering::Relaxed)
    }

    pub fn checkpoint_failures(&self) -> u64 {
        self.checkpoint_failures.load(Ordering::Relaxed)
    }
}

/// Collect all metrics and format as Prometheus text.
pub async fn collect_metrics(state: &AppState) -> String {
    let mut output = String::new();

    collect_run_metrics(state, &mut output).await;
    collect_listener_metrics(state, &mut output);
    collect_task_counters(state.service.metrics(), &mut output);

    output
}

/// Runs by status.
async fn collect_run_metrics(state: &AppState, output: &mut String) {
    let counts = state.service.run_counts().await;

    writeln!(output, "# HELP devteam_runs Number of known runs by status").ok();
    writeln!(output, "# TYPE devteam_runs gauge").ok();
    for status in [
        RunStatus::Initializing,
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
    ] {
        let count = counts.get(&status).copied().unwrap_or(0);
        writeln!(output, "devteam_runs{{status=\"{status}\"}} {count}").ok();
    }
}

fn collect_listener_metrics(state: &AppState, output: &mut String) {
    let listeners = state.service.broadcast().listener_count();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP devteam_progress_listeners Live progress subscriptions"
    )
    .ok();
    writeln!(output, "# TYPE devteam_progress_listeners gauge").ok();
    writeln!(output, "devteam_progress_listeners {listeners}").ok();
}

fn collect_task_counters(metrics: &Metrics, output: &mut String) {
    let counters = [
        (
            "devteam_task_attempts_total",
            "Task execution attempts, including retries",
            metrics.task_attempts(),
        ),
        (
            "devteam_task_retries_total",
            "Task attempts after a failed attempt",
            metrics.task_retries(),
        ),
        (
            "devteam_tasks_skipped_total",
            "Best-effort tasks skipped after exhausting retries",
            metrics.tasks_skipped(),
        ),
        (
            "devteam_critical_failures_total",
            "Critical tasks that failed their run",
            metrics.critical_failures(),
        ),
        (
            "devteam_checkpoint_failures_total",
            "Checkpoint saves that failed",
            metrics.checkpoint_failures(),
        ),
    ];

    for (name, help, value) in counters {
        writeln!(output).ok();
        writeln!(output, "# HELP {name} {help}").ok();
        writeln!(output, "# TYPE {name} counter").ok();
        writeln!(output, "{name} {value}").ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_state;

    #[tokio::test]
    async fn test_collect_metrics_empty_state() {
        let (state, _dir) = test_state();
        let output = collect_metrics(&state).await;

        assert!(output.contains("devteam_runs{status=\"running\"} 0"));
        assert!(output.contains("devteam_runs{status=\"failed\"} 0"));
        assert!(output.contains("devteam_progress_listeners 0"));
        assert!(output.contains("devteam_task_attempts_total 0"));
    }

    #[test]
    fn test_counters() {
        let metrics = Metrics::default();
        metrics.record_attempt(false);
        metrics.record_attempt(true);
        metrics.record_skip();

        let mut output = String::new();
        collect_task_counters(&metrics, &mut output);
        assert!(output.contains("devteam_task_attempts_total 2"));
        assert!(output.contains("devteam_task_retries_total 1"));
        assert!(output.contains("devteam_tasks_skipped_total 1"));
        assert!(output.contains("# TYPE devteam_critical_failures_total counter"));
    }
}
