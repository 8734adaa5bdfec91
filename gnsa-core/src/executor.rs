//! Node Action Executor
//!
//! Applies verdicts to the agent's own node object with safety gating:
//!
//! - every call goes through a [`NodeScope`], so only our own node is touched
//! - Delete requires a cordon observed on an earlier tick and a node that still
//!   reads unschedulable; otherwise the tick cordons and the delete is deferred
//! - a cordon that failed transiently stays pending and is retried on a later
//!   tick, with tick-based exponential backoff
//! - a permission failure latches the executor into observe-only mode
//! - score labels are only patched when their values change
//! - after deleting our node, each tick only checks whether the node object
//!   was registered again

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::cluster::{ClusterError, NodeScope, NodeState};
use crate::error::ConfigError;
use crate::policy::{NodeAction, PolicyMode, Verdict};

static LABEL_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("valid label prefix regex")
});

/// Executor behaviour switches
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Whether Delete verdicts may remove the node object
    pub allow_delete: bool,
    /// Whether to publish score labels for the scheduler
    pub publish_score: bool,
    /// DNS prefix of the published labels
    pub label_prefix: String,
    /// Upper bound on ticks skipped after repeated transient failures
    pub max_backoff_ticks: u32,
    /// Log actions instead of performing them
    pub dry_run: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            allow_delete: true,
            publish_score: true,
            label_prefix: "gnsa.io".to_string(),
            max_backoff_ticks: 8,
            dry_run: false,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.label_prefix.len() > 253 || !LABEL_PREFIX.is_match(&self.label_prefix) {
            return Err(ConfigError::InvalidThresholds(format!(
                "label_prefix {:?} is not a DNS subdomain",
                self.label_prefix
            )));
        }
        Ok(())
    }

    pub fn score_label(&self) -> String {
        format!("{}/score", self.label_prefix)
    }

    pub fn mode_label(&self) -> String {
        format!("{}/mode", self.label_prefix)
    }

    pub fn condition_label(&self) -> String {
        format!("{}/condition", self.label_prefix)
    }
}

/// What a tick did to the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionOutcome {
    /// Nothing to do
    NoAction,
    /// Node was marked unschedulable this tick
    Cordoned,
    /// Node was already unschedulable
    AlreadyCordoned,
    /// Delete requested before a cordon was observed; cordoned instead
    DeleteDeferred,
    /// Node object removed
    Deleted,
    /// Skipped while backing off after transient failures
    BackingOff { remaining: u32 },
    /// Mutation disabled after a permission failure
    ObserveOnly,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::NoAction => "none",
            ExecutionOutcome::Cordoned => "cordoned",
            ExecutionOutcome::AlreadyCordoned => "already_cordoned",
            ExecutionOutcome::DeleteDeferred => "delete_deferred",
            ExecutionOutcome::Deleted => "deleted",
            ExecutionOutcome::BackingOff { .. } => "backing_off",
            ExecutionOutcome::ObserveOnly => "observe_only",
        }
    }
}

/// Ticks to skip after `failures` consecutive transient failures:
/// 0, 1, 3, 7, ... capped at `max`.
fn backoff_ticks(failures: u32, max: u32) -> u32 {
    let exp = failures.saturating_sub(1).min(31);
    ((1u64 << exp) - 1).min(u64::from(max)) as u32
}

/// Applies verdicts to the agent's own node
pub struct NodeActionExecutor {
    scope: NodeScope,
    config: ExecutorConfig,
    mode: PolicyMode,
    tick: u64,
    cordon_observed_at: Option<u64>,
    pending_cordon: bool,
    failures: u32,
    skip_ticks: u32,
    observe_only: bool,
    deleted: bool,
    published: Option<BTreeMap<String, String>>,
}

impl NodeActionExecutor {
    pub fn new(scope: NodeScope, config: ExecutorConfig, mode: PolicyMode) -> Self {
        Self {
            scope,
            config,
            mode,
            tick: 0,
            cordon_observed_at: None,
            pending_cordon: false,
            failures: 0,
            skip_ticks: 0,
            observe_only: false,
            deleted: false,
            published: None,
        }
    }

    pub fn is_observe_only(&self) -> bool {
        self.observe_only
    }

    pub fn has_pending_cordon(&self) -> bool {
        self.pending_cordon
    }

    /// Apply one tick's verdict
    pub async fn apply(&mut self, verdict: &Verdict) -> Result<ExecutionOutcome, ClusterError> {
        self.tick += 1;

        if self.observe_only {
            debug!(action = %verdict.action, "Observe-only, skipping node action");
            return Ok(ExecutionOutcome::ObserveOnly);
        }
        if self.skip_ticks > 0 {
            self.skip_ticks -= 1;
            info!(
                remaining = self.skip_ticks,
                failures = self.failures,
                "Backing off after cluster API failures"
            );
            return Ok(ExecutionOutcome::BackingOff {
                remaining: self.skip_ticks,
            });
        }

        let result = self.execute(verdict).await;

        match &result {
            Ok(_) => self.failures = 0,
            Err(e) if e.is_transient() => {
                self.failures = self.failures.saturating_add(1);
                self.skip_ticks = backoff_ticks(self.failures, self.config.max_backoff_ticks);
                warn!(
                    node = %self.scope.node(),
                    error = %e,
                    failures = self.failures,
                    skip_ticks = self.skip_ticks,
                    pending_cordon = self.pending_cordon,
                    "Cluster API call failed, will retry on a later tick"
                );
            }
            Err(e) => {
                self.observe_only = true;
                error!(
                    node = %self.scope.node(),
                    error = %e,
                    "Lost authority over node object, degrading to observe-only"
                );
            }
        }

        result
    }

    async fn execute(&mut self, verdict: &Verdict) -> Result<ExecutionOutcome, ClusterError> {
        if self.deleted {
            match self.scope.get().await {
                Err(ClusterError::NotFound(_)) => {
                    debug!("Node object already deleted by this agent");
                    return Ok(ExecutionOutcome::NoAction);
                }
                Err(e) => return Err(e),
                Ok(_) => {
                    info!(node = %self.scope.node(), "Node object registered again, resuming");
                    self.deleted = false;
                    self.cordon_observed_at = None;
                    self.published = None;
                }
            }
        }

        let mut action = verdict.action;

        if action == NodeAction::None && self.pending_cordon {
            info!(node = %self.scope.node(), "Retrying pending cordon");
            action = NodeAction::Cordon;
        }
        if action == NodeAction::Delete && !self.config.allow_delete {
            debug!("Node deletion disabled, cordoning instead");
            action = NodeAction::Cordon;
        }

        let outcome = match action {
            NodeAction::None => {
                self.cordon_observed_at = None;
                ExecutionOutcome::NoAction
            }
            NodeAction::Cordon => {
                self.pending_cordon = true;
                let node = self.scope.get().await?;
                self.cordon(&node).await?
            }
            NodeAction::Delete => {
                self.pending_cordon = true;
                let node = self.scope.get().await?;
                if self.delete_permitted(&node) {
                    self.delete(verdict).await?
                } else {
                    info!(
                        node = %self.scope.node(),
                        "Delete requested before cordon was observed, cordoning first"
                    );
                    self.cordon(&node).await?;
                    ExecutionOutcome::DeleteDeferred
                }
            }
        };

        if outcome != ExecutionOutcome::Deleted && self.config.publish_score {
            self.publish(verdict).await?;
        }

        Ok(outcome)
    }

    fn delete_permitted(&self, node: &NodeState) -> bool {
        let observed_earlier = matches!(self.cordon_observed_at, Some(t) if t < self.tick);
        observed_earlier && (node.unschedulable || self.config.dry_run)
    }

    async fn cordon(&mut self, node: &NodeState) -> Result<ExecutionOutcome, ClusterError> {
        let outcome = if node.unschedulable {
            debug!(node = %self.scope.node(), "Node already cordoned");
            ExecutionOutcome::AlreadyCordoned
        } else if self.config.dry_run {
            info!(node = %self.scope.node(), "[DRY-RUN] Would cordon node");
            ExecutionOutcome::Cordoned
        } else {
            self.scope.cordon().await?;
            info!(node = %self.scope.node(), "Node cordoned");
            ExecutionOutcome::Cordoned
        };

        self.pending_cordon = false;
        self.cordon_observed_at.get_or_insert(self.tick);
        Ok(outcome)
    }

    async fn delete(&mut self, verdict: &Verdict) -> Result<ExecutionOutcome, ClusterError> {
        if self.config.dry_run {
            info!(node = %self.scope.node(), reason = %verdict.reason, "[DRY-RUN] Would delete node");
            return Ok(ExecutionOutcome::Deleted);
        }

        self.scope.delete().await?;
        self.deleted = true;
        self.pending_cordon = false;
        self.published = None;
        warn!(node = %self.scope.node(), reason = %verdict.reason, "Node object deleted");
        Ok(ExecutionOutcome::Deleted)
    }

    async fn publish(&mut self, verdict: &Verdict) -> Result<(), ClusterError> {
        let labels = BTreeMap::from([
            (self.config.score_label(), format!("{:.6}", verdict.score)),
            (self.config.mode_label(), self.mode.to_string()),
            (
                self.config.condition_label(),
                verdict.condition.as_str().to_string(),
            ),
        ]);

        if self.published.as_ref() == Some(&labels) {
            trace!("Score labels unchanged");
            return Ok(());
        }

        if self.config.dry_run {
            debug!(node = %self.scope.node(), labels = ?labels, "[DRY-RUN] Would update node labels");
        } else {
            self.scope.update_labels(&labels).await?;
        }
        self.published = Some(labels);
        Ok(())
    }
}
