//! Agent Loop
//!
//! Owns the tick cadence and wires sampler → evaluator → executor.
//! `Starting → Running → Draining → Stopped`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cluster::NodeIdentity;
use crate::device::{DeviceError, DeviceInterface};
use crate::error::TickError;
use crate::executor::{ExecutionOutcome, NodeActionExecutor};
use crate::metrics::MetricsRegistry;
use crate::policy::{NodeAction, PolicyEvaluator, Verdict};
use crate::sampler::{DeviceSampler, VisibleDeviceMask};

/// Agent lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Starting => write!(f, "STARTING"),
            AgentState::Running => write!(f, "RUNNING"),
            AgentState::Draining => write!(f, "DRAINING"),
            AgentState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// What happened in one tick
#[derive(Debug)]
pub struct TickReport {
    /// 1-based tick number
    pub tick: u64,
    pub verdict: Verdict,
    /// `None` when the tick was abandoned before reaching the executor
    pub outcome: Option<ExecutionOutcome>,
    pub errors: Vec<TickError>,
}

impl TickReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Per-node agent
pub struct Agent {
    node: NodeIdentity,
    mask: VisibleDeviceMask,
    sampler: DeviceSampler,
    evaluator: PolicyEvaluator,
    executor: NodeActionExecutor,
    metrics: Arc<MetricsRegistry>,
    interval: Duration,
    state: AgentState,
    ticks: u64,
}

impl Agent {
    /// Create a new agent. The agent stays in `Starting` until [`Agent::run`].
    pub fn new(
        node: NodeIdentity,
        mask: VisibleDeviceMask,
        device: Arc<dyn DeviceInterface>,
        evaluator: PolicyEvaluator,
        executor: NodeActionExecutor,
        metrics: Arc<MetricsRegistry>,
        interval: Duration,
    ) -> Self {
        let sampler = DeviceSampler::new(device, node.as_str());
        Self {
            node,
            mask,
            sampler,
            evaluator,
            executor,
            metrics,
            interval,
            state: AgentState::Starting,
            ticks: 0,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    fn set_state(&mut self, state: AgentState) {
        info!(node = %self.node, from = %self.state, to = %state, "Agent state changed");
        self.state = state;
    }

    /// Run until the shutdown signal flips to `true` (or its sender is dropped).
    ///
    /// The tick runs inside the select arm, so a shutdown arriving mid-tick
    /// waits for that tick to finish. A pending shutdown wins over a due tick.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        self.set_state(AgentState::Running);
        info!(
            node = %self.node,
            mode = %self.evaluator.mode(),
            mask = %self.mask,
            interval = %humantime::format_duration(self.interval),
            "Starting agent loop"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
            }
        }

        self.set_state(AgentState::Draining);
        info!(node = %self.node, "Leaving node state as-is");
        self.set_state(AgentState::Stopped);
    }

    /// Run one sample → evaluate → apply tick. Errors are contained in the
    /// report.
    pub async fn run_tick(&mut self) -> TickReport {
        self.ticks += 1;
        let tick = self.ticks;
        let start = Instant::now();
        let mut errors = Vec::new();

        let verdict = match self.sampler.sample(&self.mask).await {
            Ok(set) => {
                self.metrics.record_samples(&set);
                self.evaluator.evaluate(&set)
            }
            Err(e) => {
                warn!(tick, error = %e, "Sampling failed");
                let verdict = self.evaluator.record_sample_failure(&e);
                let e = TickError::from(e);
                self.metrics.inc_tick_failure(e.stage());
                errors.push(e);
                verdict
            }
        };
        self.metrics.record_verdict(&verdict);

        let sampled = errors.is_empty();
        let outcome = if !sampled && verdict.action == NodeAction::None {
            debug!(tick, reason = %verdict.reason, "Tick abandoned");
            None
        } else {
            match self.executor.apply(&verdict).await {
                Ok(outcome) => {
                    self.metrics.record_outcome(&outcome);
                    Some(outcome)
                }
                Err(e) => {
                    error!(tick, action = %verdict.action, error = %e, "Node action failed");
                    let e = TickError::from(e);
                    self.metrics.inc_tick_failure(e.stage());
                    errors.push(e);
                    None
                }
            }
        };
        self.metrics.set_observe_only(self.executor.is_observe_only());

        let elapsed = start.elapsed();
        self.metrics.observe_tick_duration(elapsed.as_secs_f64());
        debug!(
            tick,
            action = %verdict.action,
            condition = %verdict.condition,
            score = verdict.score,
            outcome = outcome.map(|o| o.as_str()).unwrap_or("abandoned"),
            duration = ?elapsed,
            "Tick complete"
        );

        TickReport {
            tick,
            verdict,
            outcome,
            errors,
        }
    }

    /// Sample and evaluate once without touching the cluster
    pub async fn run_once(&mut self) -> Result<Verdict, DeviceError> {
        let set = self.sampler.sample(&self.mask).await?;
        self.metrics.record_samples(&set);
        for sample in set.samples() {
            info!(
                device = sample.device_id(),
                free = sample.free_memory_bytes(),
                total = sample.total_memory_bytes(),
                ratio = sample.free_ratio(),
                "Device sample"
            );
        }
        Ok(self.evaluator.evaluate(&set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterError, ClusterOp, InMemoryCluster, NodeScope};
    use crate::device::MockDevice;
    use crate::executor::ExecutorConfig;
    use crate::policy::{Condition, PolicyMode, Thresholds};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn agent(
        device: Arc<MockDevice>,
        cluster: Arc<InMemoryCluster>,
        mask: VisibleDeviceMask,
    ) -> Agent {
        let node = NodeIdentity::new("node-a").unwrap();
        let scope = NodeScope::new(cluster, node.clone(), Duration::from_secs(1));
        let thresholds = Thresholds {
            cordon_floor_bytes: GIB,
            delete_floor_bytes: GIB / 4,
            debounce_ticks: 3,
        };
        Agent::new(
            node,
            mask,
            device,
            PolicyEvaluator::new(PolicyMode::MaxFreeMemory, thresholds),
            NodeActionExecutor::new(scope, ExecutorConfig::default(), PolicyMode::MaxFreeMemory),
            Arc::new(MetricsRegistry::new()),
            Duration::from_millis(10),
        )
    }

    fn cluster() -> Arc<InMemoryCluster> {
        Arc::new(InMemoryCluster::with_nodes(&["node-a", "node-b"]))
    }

    #[tokio::test]
    async fn test_healthy_tick_publishes_score() {
        let device = Arc::new(MockDevice::with_memory(&[(16 * GIB, 14 * GIB), (16 * GIB, 2 * GIB)]));
        let cluster = cluster();
        let mut agent = agent(device, cluster.clone(), VisibleDeviceMask::All);

        let report = agent.run_tick().await;
        assert!(report.is_clean());
        assert_eq!(report.verdict.action, NodeAction::None);
        assert_eq!(report.verdict.score, 0.875);
        assert_eq!(report.outcome, Some(ExecutionOutcome::NoAction));

        let node = cluster.node("node-a").unwrap();
        assert_eq!(node.labels.get("gnsa.io/score").map(String::as_str), Some("0.875000"));
        assert_eq!(node.labels.get("gnsa.io/condition").map(String::as_str), Some("healthy"));
    }

    #[tokio::test]
    async fn test_empty_mask_cordons_then_deletes() {
        let device = Arc::new(MockDevice::new());
        let cluster = cluster();
        let mut agent = agent(device, cluster.clone(), VisibleDeviceMask::None);

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            let report = agent.run_tick().await;
            assert_eq!(report.verdict.condition, Condition::NoDevices);
            outcomes.push((report.verdict.action, report.outcome));
        }

        assert_eq!(outcomes[0], (NodeAction::Cordon, Some(ExecutionOutcome::Cordoned)));
        assert_eq!(outcomes[2], (NodeAction::Cordon, Some(ExecutionOutcome::AlreadyCordoned)));
        assert_eq!(outcomes[3], (NodeAction::Delete, Some(ExecutionOutcome::Deleted)));
        assert!(cluster.node("node-a").is_none());
        assert!(cluster.node("node-b").is_some());
    }

    #[tokio::test]
    async fn test_sampling_failure_abandons_tick() {
        let device = Arc::new(MockDevice::new());
        device.set_fail_queries(true);
        let cluster = cluster();
        let mut agent = agent(device.clone(), cluster.clone(), VisibleDeviceMask::All);

        let report = agent.run_tick().await;
        assert_eq!(report.outcome, None);
        assert!(matches!(report.errors.as_slice(), [TickError::Sample(_)]));
        assert!(cluster.calls().is_empty());

        // Self-heals once the device answers again
        device.set_fail_queries(false);
        let report = agent.run_tick().await;
        assert!(report.is_clean());
        assert_eq!(report.verdict.action, NodeAction::None);
    }

    #[tokio::test]
    async fn test_persistent_sampling_failure_cordons() {
        let device = Arc::new(MockDevice::new());
        device.set_fail_queries(true);
        let cluster = cluster();
        let mut agent = agent(device, cluster.clone(), VisibleDeviceMask::All);

        let actions: Vec<NodeAction> = {
            let mut v = Vec::new();
            for _ in 0..3 {
                v.push(agent.run_tick().await.verdict.action);
            }
            v
        };
        assert_eq!(actions, vec![NodeAction::None, NodeAction::None, NodeAction::Cordon]);
        assert!(cluster.node("node-a").unwrap().unschedulable);
    }

    #[tokio::test]
    async fn test_cluster_error_contained_and_retried() {
        let device = Arc::new(MockDevice::with_memory(&[(16 * GIB, GIB / 2)]));
        let cluster = cluster();
        let mut agent = agent(device, cluster.clone(), VisibleDeviceMask::All);

        agent.run_tick().await;
        agent.run_tick().await;

        cluster.fail_next(ClusterOp::Cordon, ClusterError::Api("apiserver down".to_string()));
        let report = agent.run_tick().await;
        assert_eq!(report.verdict.action, NodeAction::Cordon);
        assert!(matches!(report.errors.as_slice(), [TickError::Execute(_)]));
        assert!(!cluster.node("node-a").unwrap().unschedulable);

        let report = agent.run_tick().await;
        assert_eq!(report.verdict.action, NodeAction::Cordon);
        assert_eq!(report.outcome, Some(ExecutionOutcome::Cordoned));
        assert!(cluster.node("node-a").unwrap().unschedulable);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let device = Arc::new(MockDevice::new());
        let cluster = cluster();
        let mut agent = agent(device, cluster.clone(), VisibleDeviceMask::All);
        assert_eq!(agent.state(), AgentState::Starting);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            agent.run(rx).await;
            agent
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let agent = handle.await.unwrap();

        assert_eq!(agent.state(), AgentState::Stopped);
        assert!(!cluster.calls().is_empty());
        assert!(cluster.calls().iter().all(|c| c.node == "node-a"));
        assert!(!cluster.node("node-a").unwrap().unschedulable);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_tick() {
        let device = Arc::new(MockDevice::new());
        let cluster = cluster();
        cluster.set_delay(Duration::from_millis(100));
        // Empty mask cordons on the first tick
        let mut agent = agent(device, cluster.clone(), VisibleDeviceMask::None);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            agent.run(rx).await;
            agent
        });

        // First tick is blocked on the node read
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!cluster.node("node-a").unwrap().unschedulable);
        tx.send(true).unwrap();

        let agent = handle.await.unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
        assert!(cluster.node("node-a").unwrap().unschedulable);
        assert_eq!(
            cluster.calls().iter().filter(|c| c.op == ClusterOp::Cordon).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_run_once_does_not_touch_cluster() {
        let device = Arc::new(MockDevice::new());
        let cluster = cluster();
        let mut agent = agent(device, cluster.clone(), VisibleDeviceMask::All);

        let verdict = agent.run_once().await.unwrap();
        assert_eq!(verdict.score, 0.75);
        assert!(cluster.calls().is_empty());
    }
}
