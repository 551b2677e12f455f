//! Structured build telemetry.
//!
//! Two sinks per build: a complete snapshot at `.forge-metrics.json` in
//! the workspace (overwritten each run) and an append-only
//! `.forge-telemetry.jsonl` log for streaming analysis across builds.

use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Metrics for a complete build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMetrics {
    pub build_id: String,
    pub success: bool,
    pub final_state: String,
    pub transitions: usize,
    pub steps_executed: u32,
    pub healing_runs: u32,
    pub healing_iterations: u32,
    pub fixes_applied: u32,
    pub checkpoints_created: u32,
    pub rollbacks: u32,
    pub final_score: f64,
    pub elapsed_ms: u64,
    pub timestamp: String,
}

/// Accumulates metrics while the orchestrator runs, then finalizes.
pub struct MetricsCollector {
    build_id: String,
    started: Instant,
    steps_executed: u32,
    healing_runs: u32,
    healing_iterations: u32,
    fixes_applied: u32,
    checkpoints_created: u32,
    rollbacks: u32,
    final_score: f64,
}

impl MetricsCollector {
    pub fn new(build_id: &str) -> Self {
        Self {
            build_id: build_id.to_string(),
            started: Instant::now(),
            steps_executed: 0,
            healing_runs: 0,
            healing_iterations: 0,
            fixes_applied: 0,
            checkpoints_created: 0,
            rollbacks: 0,
            final_score: 0.0,
        }
    }

    pub fn record_step(&mut self) {
        self.steps_executed += 1;
    }

    pub fn record_healing(&mut self, iterations: u32, fixes_applied: u32) {
        self.healing_runs += 1;
        self.healing_iterations += iterations;
        self.fixes_applied += fixes_applied;
    }

    pub fn record_checkpoint(&mut self) {
        self.checkpoints_created += 1;
    }

    pub fn record_rollback(&mut self) {
        self.rollbacks += 1;
    }

    pub fn record_score(&mut self, score: f64) {
        self.final_score = score;
    }

    pub fn finalize(self, success: bool, final_state: &str, transitions: usize) -> BuildMetrics {
        BuildMetrics {
            build_id: self.build_id,
            success,
            final_state: final_state.to_string(),
            transitions,
            steps_executed: self.steps_executed,
            healing_runs: self.healing_runs,
            healing_iterations: self.healing_iterations,
            fixes_applied: self.fixes_applied,
            checkpoints_created: self.checkpoints_created,
            rollbacks: self.rollbacks,
            final_score: self.final_score,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Write the build snapshot to `.forge-metrics.json` in the workspace.
/// Overwritten on every run; failures are logged, never fatal.
pub fn write_build_metrics(metrics: &BuildMetrics, workspace: &Path) {
    let path = workspace.join(".forge-metrics.json");
    let outcome = serde_json::to_vec_pretty(metrics)
        .map_err(std::io::Error::other)
        .and_then(|bytes| std::fs::write(&path, bytes));
    match outcome {
        Ok(()) => info!(path = %path.display(), "wrote build metrics"),
        Err(e) => warn!(path = %path.display(), error = %e, "build metrics not written"),
    }
}

/// Append one JSONL line to `.forge-telemetry.jsonl`.
pub fn append_telemetry(metrics: &BuildMetrics, root: &Path) {
    let path = root.join(".forge-telemetry.jsonl");
    if let Err(e) = append_jsonl(&path, metrics) {
        warn!(path = %path.display(), error = %e, "telemetry append failed");
    }
}

fn append_jsonl(path: &Path, metrics: &BuildMetrics) -> std::io::Result<()> {
    use std::io::Write;

    let mut line = serde_json::to_string(metrics).map_err(std::io::Error::other)?;
    line.push('\n');
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(line.as_bytes())
}

/// Aggregates across builds read back from the JSONL log.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateAnalytics {
    pub total_builds: usize,
    pub success_rate: f64,
    pub average_healing_iterations: f64,
    pub total_fixes_applied: u64,
    pub average_elapsed_ms: f64,
}

/// Read telemetry lines and compute aggregates. A malformed line fails
/// the whole read, with its line number in the error.
pub fn read_analytics(path: &Path) -> std::io::Result<AggregateAnalytics> {
    let raw = std::fs::read_to_string(path)?;
    let mut builds: Vec<BuildMetrics> = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        builds.push(serde_json::from_str(line).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("telemetry line {}: {e}", index + 1),
            )
        })?);
    }

    if builds.is_empty() {
        return Ok(AggregateAnalytics {
            total_builds: 0,
            success_rate: 0.0,
            average_healing_iterations: 0.0,
            total_fixes_applied: 0,
            average_elapsed_ms: 0.0,
        });
    }

    let total = builds.len();
    let successes = builds.iter().filter(|b| b.success).count();
    let healing: u64 = builds.iter().map(|b| u64::from(b.healing_iterations)).sum();
    let fixes: u64 = builds.iter().map(|b| u64::from(b.fixes_applied)).sum();
    let elapsed: u64 = builds.iter().map(|b| b.elapsed_ms).sum();

    Ok(AggregateAnalytics {
        total_builds: total,
        success_rate: successes as f64 / total as f64,
        average_healing_iterations: healing as f64 / total as f64,
        total_fixes_applied: fixes,
        average_elapsed_ms: elapsed as f64 / total as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_accumulates() {
        let mut collector = MetricsCollector::new("build-1");
        collector.record_step();
        collector.record_step();
        collector.record_healing(3, 2);
        collector.record_checkpoint();
        collector.record_rollback();
        collector.record_score(85.0);

        let metrics = collector.finalize(true, "completed", 12);
        assert_eq!(metrics.build_id, "build-1");
        assert!(metrics.success);
        assert_eq!(metrics.steps_executed, 2);
        assert_eq!(metrics.healing_runs, 1);
        assert_eq!(metrics.healing_iterations, 3);
        assert_eq!(metrics.fixes_applied, 2);
        assert_eq!(metrics.checkpoints_created, 1);
        assert_eq!(metrics.rollbacks, 1);
        assert_eq!(metrics.final_score, 85.0);
        assert_eq!(metrics.transitions, 12);
    }

    #[test]
    fn test_snapshot_and_jsonl_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = MetricsCollector::new("build-2").finalize(false, "failed", 5);

        write_build_metrics(&metrics, dir.path());
        append_telemetry(&metrics, dir.path());
        append_telemetry(&metrics, dir.path());

        let snapshot = std::fs::read_to_string(dir.path().join(".forge-metrics.json")).unwrap();
        let restored: BuildMetrics = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(restored.build_id, "build-2");

        let log = std::fs::read_to_string(dir.path().join(".forge-telemetry.jsonl")).unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[test]
    fn test_read_analytics_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".forge-telemetry.jsonl");

        let good = MetricsCollector::new("a").finalize(true, "completed", 1);
        append_telemetry(&good, dir.path());
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{not json}\n");
        std::fs::write(&path, contents).unwrap();

        let err = read_analytics(&path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_read_analytics_aggregates() {
        let dir = tempfile::tempdir().unwrap();

        let mut a = MetricsCollector::new("a");
        a.record_healing(2, 1);
        let a = a.finalize(true, "completed", 8);
        let b = MetricsCollector::new("b").finalize(false, "failed", 4);

        append_telemetry(&a, dir.path());
        append_telemetry(&b, dir.path());

        let analytics = read_analytics(&dir.path().join(".forge-telemetry.jsonl")).unwrap();
        assert_eq!(analytics.total_builds, 2);
        assert!((analytics.success_rate - 0.5).abs() < 1e-9);
        assert!((analytics.average_healing_iterations - 1.0).abs() < 1e-9);
        assert_eq!(analytics.total_fixes_applied, 1);
    }
}
