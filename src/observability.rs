use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

/// Counters keyed by node path, so sibling stages running the same plugins
/// stay apart.
#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    /// Descriptor name of the stage at this path.
    pub stage: String,
    pub calls: u64,
    pub failures: u64,
    pub validation_failures: u64,
    pub batches: u64,
    pub records: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Execution counters shared by every stage of one run.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, path: &str, stage_name: &str) -> StageTimer {
        StageTimer {
            path: path.to_string(),
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            failed: false,
            recorded: false,
        }
    }

    pub fn record_batch(&self, path: &str, stage_name: &str, records: usize) {
        if let Ok(mut guard) = self.inner.lock() {
            let metrics = stage_entry(&mut guard, path, stage_name);
            metrics.batches += 1;
            metrics.records += records as u64;
        }
    }

    pub fn record_validation_failure(&self, path: &str, stage_name: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            stage_entry(&mut guard, path, stage_name).validation_failures += 1;
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

fn stage_entry<'a>(snapshot: &'a mut MetricsSnapshot, path: &str, stage_name: &str) -> &'a mut StageMetrics {
    snapshot
        .stages
        .entry(path.to_string())
        .or_insert_with(|| StageMetrics {
            stage: stage_name.to_string(),
            ..StageMetrics::default()
        })
}

pub struct StageTimer {
    path: String,
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    failed: bool,
    recorded: bool,
}

impl StageTimer {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = stage_entry(&mut guard, &self.path, &self.stage);
            metrics.calls += 1;
            if self.failed {
                metrics.failures += 1;
            }
            let duration_ms = duration.as_secs_f64() * 1_000.0;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            path = self.path.as_str(),
            stage = self.stage.as_str(),
            duration_ms = duration.as_secs_f64() * 1_000.0,
            failed = self.failed,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        "Pipeline metrics summary"
    );
    for (path, metrics) in &snapshot.stages {
        info!(
            path = path.as_str(),
            stage = metrics.stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            batches = metrics.batches,
            records = metrics.records,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP datajet_stage_calls_total Stage execution count\n");
        output.push_str("# TYPE datajet_stage_calls_total counter\n");
        output.push_str("# HELP datajet_stage_failures_total Failed stage executions\n");
        output.push_str("# TYPE datajet_stage_failures_total counter\n");
        output.push_str(
            "# HELP datajet_stage_validation_failures_total Stage executions skipped by validation\n",
        );
        output.push_str("# TYPE datajet_stage_validation_failures_total counter\n");
        output.push_str("# HELP datajet_stage_batches_total Batches transmitted\n");
        output.push_str("# TYPE datajet_stage_batches_total counter\n");
        output.push_str("# HELP datajet_stage_records_total Records transmitted\n");
        output.push_str("# TYPE datajet_stage_records_total counter\n");
        output.push_str(
            "# HELP datajet_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE datajet_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP datajet_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE datajet_stage_duration_seconds_max gauge\n");
        for (path, metrics) in &self.stages {
            let labels = format!("path=\"{}\",stage=\"{}\"", path, metrics.stage);
            output.push_str(&format!(
                "datajet_stage_calls_total{{{}}} {}\n",
                labels, metrics.calls
            ));
            output.push_str(&format!(
                "datajet_stage_failures_total{{{}}} {}\n",
                labels, metrics.failures
            ));
            output.push_str(&format!(
                "datajet_stage_validation_failures_total{{{}}} {}\n",
                labels, metrics.validation_failures
            ));
            output.push_str(&format!(
                "datajet_stage_batches_total{{{}}} {}\n",
                labels, metrics.batches
            ));
            output.push_str(&format!(
                "datajet_stage_records_total{{{}}} {}\n",
                labels, metrics.records
            ));
            output.push_str(&format!(
                "datajet_stage_duration_seconds_total{{{}}} {:.6}\n",
                labels,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "datajet_stage_duration_seconds_max{{{}}} {:.6}\n",
                labels,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP datajet_pipeline_duration_seconds Total pipeline duration\n");
        output.push_str("# TYPE datajet_pipeline_duration_seconds gauge\n");
        output.push_str(&format!(
            "datajet_pipeline_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}
