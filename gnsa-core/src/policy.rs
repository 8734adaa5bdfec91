//! Policy Evaluator
//!
//! Reduces a [`SampleSet`] to a [`Verdict`]:
//!
//! - scoring is a pure function of the sample set and the [`PolicyMode`]
//! - classification is a pure function of the sample set and [`Thresholds`]
//! - escalation is debounced: a degraded condition must persist for
//!   `debounce_ticks` consecutive ticks before it produces a Cordon, and
//!   Delete is only ever returned on a tick that directly follows a Cordon
//!   for the same condition
//!
//! Escalation table (`n` = consecutive ticks with the same condition,
//! `d` = debounce ticks):
//!
//! | condition      | None     | Cordon      | Delete                    |
//! |----------------|----------|-------------|---------------------------|
//! | Healthy        | always   |             |                           |
//! | NoDevices      |          | n <= d      | n > d, previous Cordon    |
//! | LowMemory      | n < d    | n >= d      | never                     |
//! | Exhausted      | n < d    | n >= d      | n > d, previous Cordon    |
//! | SampleFailure  | n < d    | n >= d      | n > d, previous Cordon    |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::device::DeviceError;
use crate::error::ConfigError;
use crate::sampler::{DeviceSample, SampleSet};

/// Selection policy, fixed for the agent's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PolicyMode {
    /// Score is the best free/total ratio across devices
    #[default]
    MaxFreeMemory,
    /// Score is the mean free/total ratio across devices
    MeanFreeMemory,
}

impl FromStr for PolicyMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "maxfreememory" => Ok(PolicyMode::MaxFreeMemory),
            "meanfreememory" => Ok(PolicyMode::MeanFreeMemory),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyMode::MaxFreeMemory => write!(f, "MaxFreeMemory"),
            PolicyMode::MeanFreeMemory => write!(f, "MeanFreeMemory"),
        }
    }
}

/// Static thresholds for unhealthy detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Every device below this many free bytes counts as low memory
    pub cordon_floor_bytes: u64,
    /// Every device below this many free bytes counts as exhausted
    pub delete_floor_bytes: u64,
    /// Consecutive ticks a condition must persist before it escalates
    pub debounce_ticks: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cordon_floor_bytes: 1024 * 1024 * 1024,
            delete_floor_bytes: 256 * 1024 * 1024,
            debounce_ticks: 3,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.debounce_ticks == 0 {
            return Err(ConfigError::InvalidThresholds(
                "debounce_ticks must be > 0".to_string(),
            ));
        }
        if self.delete_floor_bytes > self.cordon_floor_bytes {
            return Err(ConfigError::InvalidThresholds(format!(
                "delete_floor_bytes ({}) must not exceed cordon_floor_bytes ({})",
                self.delete_floor_bytes, self.cordon_floor_bytes
            )));
        }
        Ok(())
    }
}

/// Node lifecycle action, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeAction {
    None,
    Cordon,
    Delete,
}

impl NodeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeAction::None => "none",
            NodeAction::Cordon => "cordon",
            NodeAction::Delete => "delete",
        }
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-tick classification of the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Healthy,
    NoDevices,
    LowMemory,
    Exhausted,
    SampleFailure,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Healthy => "healthy",
            Condition::NoDevices => "no-devices",
            Condition::LowMemory => "low-memory",
            Condition::Exhausted => "exhausted",
            Condition::SampleFailure => "sample-failure",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The per-tick decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub action: NodeAction,
    pub reason: String,
    pub score: f64,
    pub condition: Condition,
    /// Device that produced the score, if any
    pub selected_device: Option<String>,
}

/// Score of a node under a policy mode
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub value: f64,
    pub device: Option<String>,
}

/// Preferred sample: highest free ratio, then lowest device id
fn best_sample(samples: &[DeviceSample]) -> Option<&DeviceSample> {
    samples.iter().min_by(|a, b| {
        b.free_ratio()
            .total_cmp(&a.free_ratio())
            .then_with(|| a.device_id().cmp(b.device_id()))
    })
}

/// Score a sample set. Independent of device enumeration order.
pub fn score(set: &SampleSet, mode: PolicyMode) -> Score {
    let best = best_sample(set.samples());
    let device = best.map(|s| s.device_id().to_string());

    let value = match mode {
        PolicyMode::MaxFreeMemory => best.map(DeviceSample::free_ratio).unwrap_or(0.0),
        PolicyMode::MeanFreeMemory => {
            if set.is_empty() {
                0.0
            } else {
                let mut ordered: Vec<&DeviceSample> = set.samples().iter().collect();
                ordered.sort_by(|a, b| a.device_id().cmp(b.device_id()));
                let sum: f64 = ordered.iter().map(|s| s.free_ratio()).sum();
                sum / ordered.len() as f64
            }
        }
    };

    Score { value, device }
}

/// Classify a sample set against the floors
pub fn classify(set: &SampleSet, thresholds: &Thresholds) -> Condition {
    if set.is_empty() {
        return Condition::NoDevices;
    }
    let all_below = |floor: u64| set.samples().iter().all(|s| s.free_memory_bytes() < floor);
    if all_below(thresholds.delete_floor_bytes) {
        Condition::Exhausted
    } else if all_below(thresholds.cordon_floor_bytes) {
        Condition::LowMemory
    } else {
        Condition::Healthy
    }
}

/// Debounced evaluator. Holds only the consecutive-condition counter and the
/// previous action.
#[derive(Debug)]
pub struct PolicyEvaluator {
    mode: PolicyMode,
    thresholds: Thresholds,
    condition: Condition,
    consecutive: u32,
    last_action: NodeAction,
}

impl PolicyEvaluator {
    pub fn new(mode: PolicyMode, thresholds: Thresholds) -> Self {
        Self {
            mode,
            thresholds,
            condition: Condition::Healthy,
            consecutive: 0,
            last_action: NodeAction::None,
        }
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Consecutive ticks the current condition has been observed
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Evaluate a freshly sampled tick
    pub fn evaluate(&mut self, set: &SampleSet) -> Verdict {
        let score = score(set, self.mode);
        let condition = classify(set, &self.thresholds);
        self.escalate(condition, score)
    }

    /// Account for a tick whose sampling failed
    pub fn record_sample_failure(&mut self, error: &DeviceError) -> Verdict {
        debug!(error = %error, "Recording sampling failure");
        self.escalate(
            Condition::SampleFailure,
            Score {
                value: 0.0,
                device: None,
            },
        )
    }

    fn escalate(&mut self, condition: Condition, score: Score) -> Verdict {
        if condition == self.condition {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            if self.condition != Condition::Healthy {
                info!(
                    from = %self.condition,
                    to = %condition,
                    ticks = self.consecutive,
                    "Node condition changed"
                );
            }
            self.condition = condition;
            self.consecutive = 1;
        }

        let action = self.decide();
        let reason = self.reason(action, &score);

        match action {
            NodeAction::None => {}
            NodeAction::Cordon => info!(condition = %condition, ticks = self.consecutive, reason = %reason, "Verdict: cordon"),
            NodeAction::Delete => warn!(condition = %condition, ticks = self.consecutive, reason = %reason, "Verdict: delete"),
        }

        self.last_action = action;

        Verdict {
            action,
            reason,
            score: score.value,
            condition,
            selected_device: score.device,
        }
    }

    fn decide(&self) -> NodeAction {
        let n = self.consecutive;
        let d = self.thresholds.debounce_ticks;
        let follows_cordon = self.last_action >= NodeAction::Cordon;

        match self.condition {
            Condition::Healthy => NodeAction::None,
            Condition::NoDevices => {
                if n > d && follows_cordon {
                    NodeAction::Delete
                } else {
                    NodeAction::Cordon
                }
            }
            Condition::LowMemory => {
                if n >= d {
                    NodeAction::Cordon
                } else {
                    NodeAction::None
                }
            }
            Condition::Exhausted | Condition::SampleFailure => {
                if n > d && follows_cordon {
                    NodeAction::Delete
                } else if n >= d {
                    NodeAction::Cordon
                } else {
                    NodeAction::None
                }
            }
        }
    }

    fn reason(&self, action: NodeAction, score: &Score) -> String {
        let progress = format!("{}/{} ticks", self.consecutive, self.thresholds.debounce_ticks);
        match self.condition {
            Condition::Healthy => match &score.device {
                Some(device) => format!("{} score {:.4} from {}", self.mode, score.value, device),
                None => format!("{} score {:.4}", self.mode, score.value),
            },
            Condition::NoDevices => "no visible devices".to_string(),
            Condition::LowMemory => format!(
                "all devices below {} free bytes ({})",
                self.thresholds.cordon_floor_bytes, progress
            ),
            Condition::Exhausted => format!(
                "all devices below {} free bytes ({})",
                self.thresholds.delete_floor_bytes, progress
            ),
            Condition::SampleFailure if action == NodeAction::None => {
                format!("sampling failed, tick abandoned ({})", progress)
            }
            Condition::SampleFailure => format!("repeated sampling failures ({})", progress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceId, MemoryInfo};
    use crate::sampler::VisibleDeviceMask;
    use chrono::Utc;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn set_of(memory: &[(&str, u64, u64)]) -> SampleSet {
        let readings = memory
            .iter()
            .enumerate()
            .map(|(i, (uuid, total, free))| {
                (
                    DeviceId {
                        index: i as u32,
                        uuid: Some(uuid.to_string()),
                        name: "Test GPU".to_string(),
                    },
                    MemoryInfo {
                        total: *total,
                        free: *free,
                    },
                )
            })
            .collect();
        SampleSet::from_readings("node-a", VisibleDeviceMask::All, Utc::now(), readings).unwrap()
    }

    fn empty() -> SampleSet {
        set_of(&[])
    }

    fn thresholds(debounce: u32) -> Thresholds {
        Thresholds {
            cordon_floor_bytes: GIB,
            delete_floor_bytes: GIB / 4,
            debounce_ticks: debounce,
        }
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("MaxFreeMemory".parse::<PolicyMode>().unwrap(), PolicyMode::MaxFreeMemory);
        assert_eq!("max_free_memory".parse::<PolicyMode>().unwrap(), PolicyMode::MaxFreeMemory);
        assert_eq!("mean-free-memory".parse::<PolicyMode>().unwrap(), PolicyMode::MeanFreeMemory);
        assert!(matches!(
            "Random".parse::<PolicyMode>(),
            Err(ConfigError::UnknownMode(ref m)) if m == "Random"
        ));
    }

    #[test]
    fn test_thresholds_validate() {
        assert!(Thresholds::default().validate().is_ok());
        assert!(thresholds(0).validate().is_err());
        let inverted = Thresholds {
            cordon_floor_bytes: 1,
            delete_floor_bytes: 2,
            debounce_ticks: 1,
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_max_free_memory_scenario() {
        let set = set_of(&[("dev0", 16 * GIB, 14 * GIB), ("dev1", 16 * GIB, 2 * GIB)]);
        let mut evaluator = PolicyEvaluator::new(PolicyMode::MaxFreeMemory, thresholds(3));

        let verdict = evaluator.evaluate(&set);
        assert_eq!(verdict.action, NodeAction::None);
        assert_eq!(verdict.score, 0.875);
        assert_eq!(verdict.condition, Condition::Healthy);
        assert_eq!(verdict.selected_device.as_deref(), Some("dev0"));
    }

    #[test]
    fn test_score_is_permutation_invariant() {
        let forward = set_of(&[
            ("a", 16 * GIB, 4 * GIB),
            ("b", 8 * GIB, 6 * GIB),
            ("c", 32 * GIB, 24 * GIB),
            ("d", 10 * GIB, 3 * GIB),
        ]);
        let reversed = set_of(&[
            ("d", 10 * GIB, 3 * GIB),
            ("c", 32 * GIB, 24 * GIB),
            ("b", 8 * GIB, 6 * GIB),
            ("a", 16 * GIB, 4 * GIB),
        ]);

        for mode in [PolicyMode::MaxFreeMemory, PolicyMode::MeanFreeMemory] {
            assert_eq!(score(&forward, mode), score(&reversed, mode));
        }

        let max = score(&forward, PolicyMode::MaxFreeMemory);
        assert_eq!(max.value, 0.75);
        // b and c tie at 0.75; lowest id wins
        assert_eq!(max.device.as_deref(), Some("b"));
    }

    #[test]
    fn test_mean_free_memory() {
        let set = set_of(&[("a", 16 * GIB, 8 * GIB), ("b", 16 * GIB, 4 * GIB)]);
        let s = score(&set, PolicyMode::MeanFreeMemory);
        assert_eq!(s.value, 0.375);
        assert_eq!(s.device.as_deref(), Some("a"));
    }

    #[test]
    fn test_classify() {
        let t = thresholds(3);
        assert_eq!(classify(&empty(), &t), Condition::NoDevices);
        assert_eq!(
            classify(&set_of(&[("a", 16 * GIB, GIB / 2), ("b", 16 * GIB, 2 * GIB)]), &t),
            Condition::Healthy
        );
        assert_eq!(
            classify(&set_of(&[("a", 16 * GIB, GIB / 2), ("b", 16 * GIB, GIB / 3)]), &t),
            Condition::LowMemory
        );
        assert_eq!(
            classify(&set_of(&[("a", 16 * GIB, 0), ("b", 16 * GIB, GIB / 8)]), &t),
            Condition::Exhausted
        );
    }

    #[test]
    fn test_no_devices_cordons_first_tick() {
        let mut evaluator = PolicyEvaluator::new(PolicyMode::MaxFreeMemory, thresholds(3));
        let verdict = evaluator.evaluate(&empty());
        assert_eq!(verdict.action, NodeAction::Cordon);
        assert_eq!(verdict.reason, "no visible devices");
        assert_eq!(verdict.score, 0.0);
    }

    #[test]
    fn test_no_devices_single_tick_debounce_never_deletes_first() {
        let mut evaluator = PolicyEvaluator::new(PolicyMode::MaxFreeMemory, thresholds(1));
        assert_eq!(evaluator.evaluate(&empty()).action, NodeAction::Cordon);
        assert_eq!(evaluator.evaluate(&empty()).action, NodeAction::Delete);
    }

    #[test]
    fn test_empty_ticks_escalate_to_delete() {
        let mut evaluator = PolicyEvaluator::new(PolicyMode::MaxFreeMemory, thresholds(3));
        let actions: Vec<NodeAction> = (0..4).map(|_| evaluator.evaluate(&empty()).action).collect();
        assert_eq!(actions[2], NodeAction::Cordon);
        assert_eq!(actions[3], NodeAction::Delete);
        assert!(actions[..3].iter().all(|a| *a == NodeAction::Cordon));
    }

    #[test]
    fn test_low_memory_debounced_and_never_deletes() {
        let low = set_of(&[("a", 16 * GIB, GIB / 2)]);
        let mut evaluator = PolicyEvaluator::new(PolicyMode::MaxFreeMemory, thresholds(3));

        assert_eq!(evaluator.evaluate(&low).action, NodeAction::None);
        assert_eq!(evaluator.evaluate(&low).action, NodeAction::None);
        assert_eq!(evaluator.evaluate(&low).action, NodeAction::Cordon);
        for _ in 0..10 {
            assert_eq!(evaluator.evaluate(&low).action, NodeAction::Cordon);
        }
    }

    #[test]
    fn test_exhausted_escalates_after_cordon() {
        let exhausted = set_of(&[("a", 16 * GIB, 0)]);
        let mut evaluator = PolicyEvaluator::new(PolicyMode::MaxFreeMemory, thresholds(2));

        assert_eq!(evaluator.evaluate(&exhausted).action, NodeAction::None);
        assert_eq!(evaluator.evaluate(&exhausted).action, NodeAction::Cordon);
        assert_eq!(evaluator.evaluate(&exhausted).action, NodeAction::Delete);
    }

    #[test]
    fn test_single_noisy_reading_resets() {
        let exhausted = set_of(&[("a", 16 * GIB, 0)]);
        let healthy = set_of(&[("a", 16 * GIB, 12 * GIB)]);
        let mut evaluator = PolicyEvaluator::new(PolicyMode::MaxFreeMemory, thresholds(3));

        evaluator.evaluate(&exhausted);
        evaluator.evaluate(&exhausted);
        assert_eq!(evaluator.evaluate(&healthy).action, NodeAction::None);
        assert_eq!(evaluator.consecutive(), 1);
        assert_eq!(evaluator.evaluate(&exhausted).action, NodeAction::None);
    }

    #[test]
    fn test_condition_change_restarts_debounce() {
        let low = set_of(&[("a", 16 * GIB, GIB / 2)]);
        let exhausted = set_of(&[("a", 16 * GIB, 0)]);
        let mut evaluator = PolicyEvaluator::new(PolicyMode::MaxFreeMemory, thresholds(2));

        evaluator.evaluate(&low);
        assert_eq!(evaluator.evaluate(&low).action, NodeAction::Cordon);
        // A new condition must earn its own cordon before any delete
        assert_eq!(evaluator.evaluate(&exhausted).action, NodeAction::None);
        assert_eq!(evaluator.evaluate(&exhausted).action, NodeAction::Cordon);
        assert_eq!(evaluator.evaluate(&exhausted).action, NodeAction::Delete);
    }

    #[test]
    fn test_sample_failures_escalate() {
        let err = DeviceError::QueryError("nvml gone".to_string());
        let mut evaluator = PolicyEvaluator::new(PolicyMode::MaxFreeMemory, thresholds(2));

        let first = evaluator.record_sample_failure(&err);
        assert_eq!(first.action, NodeAction::None);
        assert_eq!(first.condition, Condition::SampleFailure);
        assert!(first.reason.contains("tick abandoned"));
        assert_eq!(evaluator.record_sample_failure(&err).action, NodeAction::Cordon);
        assert_eq!(evaluator.record_sample_failure(&err).action, NodeAction::Delete);
    }

    #[test]
    fn test_delete_always_follows_cordon() {
        let inputs = [
            set_of(&[("a", 16 * GIB, 12 * GIB)]),
            set_of(&[("a", 16 * GIB, GIB / 2)]),
            set_of(&[("a", 16 * GIB, 0)]),
            empty(),
        ];

        // xorshift keeps the sequence reproducible
        let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
        for debounce in 1..=4 {
            let mut evaluator = PolicyEvaluator::new(PolicyMode::MaxFreeMemory, thresholds(debounce));
            let mut previous = NodeAction::None;
            for _ in 0..2000 {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let pick = (state % 5) as usize;
                let verdict = if pick == 4 {
                    evaluator.record_sample_failure(&DeviceError::QueryError("x".to_string()))
                } else {
                    evaluator.evaluate(&inputs[pick])
                };
                if verdict.action == NodeAction::Delete {
                    assert!(previous >= NodeAction::Cordon, "delete without prior cordon");
                }
                previous = verdict.action;
            }
        }
    }
}
