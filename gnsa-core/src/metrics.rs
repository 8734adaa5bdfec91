//! Prometheus metrics for GNSA

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_gauge, register_gauge_vec, register_histogram, register_int_counter_vec,
    register_int_gauge, Gauge, GaugeVec, Histogram, IntCounterVec, IntGauge,
};

use crate::executor::ExecutionOutcome;
use crate::policy::Verdict;
use crate::sampler::SampleSet;

/// Node score under the configured policy mode
static NODE_SCORE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(opts!("gnsa_node_score", "Node score under the configured policy mode"))
        .expect("Failed to create node_score metric")
});

/// Free/total memory ratio per device
static DEVICE_FREE_RATIO: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("gnsa_device_free_ratio", "GPU free memory as a fraction of total"),
        &["device"]
    )
    .expect("Failed to create device_free_ratio metric")
});

/// Free memory per device
static DEVICE_FREE_BYTES: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("gnsa_device_free_bytes", "GPU free memory in bytes"),
        &["device"]
    )
    .expect("Failed to create device_free_bytes metric")
});

/// Number of devices visible in the last successful sample
static VISIBLE_DEVICES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("gnsa_visible_devices", "Number of visible GPU devices"))
        .expect("Failed to create visible_devices metric")
});

/// Tick duration histogram
static TICK_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "gnsa_tick_duration_seconds",
        "Duration of a sample/evaluate/apply tick",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to create tick_duration metric")
});

/// Tick failure counter
static TICK_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("gnsa_tick_failures_total", "Total number of failed tick stages"),
        &["stage"]
    )
    .expect("Failed to create tick_failures metric")
});

/// Verdict counter
static VERDICTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("gnsa_verdicts_total", "Total number of verdicts by action and condition"),
        &["action", "condition"]
    )
    .expect("Failed to create verdicts metric")
});

/// Node action counter
static NODE_ACTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("gnsa_node_actions_total", "Total number of node action outcomes"),
        &["outcome"]
    )
    .expect("Failed to create node_actions metric")
});

/// 1 once the executor has degraded to observe-only
static OBSERVE_ONLY: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "gnsa_observe_only",
        "Whether node mutation has been disabled after a permission failure"
    ))
    .expect("Failed to create observe_only metric")
});

/// Metrics registry wrapper
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*NODE_SCORE;
        let _ = &*DEVICE_FREE_RATIO;
        let _ = &*DEVICE_FREE_BYTES;
        let _ = &*VISIBLE_DEVICES;
        let _ = &*TICK_DURATION;
        let _ = &*TICK_FAILURES;
        let _ = &*VERDICTS;
        let _ = &*NODE_ACTIONS;
        let _ = &*OBSERVE_ONLY;
        Self
    }

    /// Record per-device memory from a sample set
    pub fn record_samples(&self, set: &SampleSet) {
        VISIBLE_DEVICES.set(set.len() as i64);
        for sample in set.samples() {
            DEVICE_FREE_RATIO
                .with_label_values(&[sample.device_id()])
                .set(sample.free_ratio());
            DEVICE_FREE_BYTES
                .with_label_values(&[sample.device_id()])
                .set(sample.free_memory_bytes() as f64);
        }
    }

    /// Record a verdict and its score
    pub fn record_verdict(&self, verdict: &Verdict) {
        NODE_SCORE.set(verdict.score);
        VERDICTS
            .with_label_values(&[verdict.action.as_str(), verdict.condition.as_str()])
            .inc();
    }

    /// Record what the executor did
    pub fn record_outcome(&self, outcome: &ExecutionOutcome) {
        NODE_ACTIONS.with_label_values(&[outcome.as_str()]).inc();
    }

    /// Increment tick failure counter
    pub fn inc_tick_failure(&self, stage: &str) {
        TICK_FAILURES.with_label_values(&[stage]).inc();
    }

    /// Record tick duration
    pub fn observe_tick_duration(&self, duration_secs: f64) {
        TICK_DURATION.observe(duration_secs);
    }

    pub fn set_observe_only(&self, observe_only: bool) {
        OBSERVE_ONLY.set(i64::from(observe_only));
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
