//! GNSA Core Library
//!
//! Decision core of the GPU Node Selection Agent: device sampling, policy
//! evaluation, self-scoped node actions and the agent loop that ties them
//! together.

pub mod agent;
pub mod cluster;
pub mod device;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod policy;
pub mod sampler;

// Re-export common types
pub use agent::{Agent, AgentState, TickReport};
pub use cluster::{ClusterApi, ClusterError, NodeIdentity, NodeScope, NodeState};
pub use device::{DeviceError, DeviceId, DeviceInterface, DeviceType, MemoryInfo};
pub use error::{ConfigError, TickError};
pub use executor::{ExecutionOutcome, ExecutorConfig, NodeActionExecutor};
pub use policy::{Condition, NodeAction, PolicyEvaluator, PolicyMode, Thresholds, Verdict};
pub use sampler::{DeviceSample, DeviceSampler, SampleSet, VisibleDeviceMask};
