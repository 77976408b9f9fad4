//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. All
//! fields have defaults so an empty or missing file yields a working engine.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Loop-guard ceiling: maximum step visits per execution.
    #[serde(default = "default_max_steps")]
    pub max_steps_per_execution: u32,

    /// Maximum number of executions driving the run loop at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,

    /// Timeout applied to handler invocations when a step has no policy.
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout_secs: u64,

    /// What a dead end (no matching transition) means.
    #[serde(default)]
    pub dead_end_policy: DeadEndPolicy,

    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Interval at which the wake scheduler polls for due timers.
    #[serde(default = "default_wake_poll_interval")]
    pub wake_poll_interval_ms: u64,

    /// Parallel branches required to join when a gateway sets no quorum.
    /// `None` means all branches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_parallel_quorum: Option<u32>,
}

fn default_max_steps() -> u32 {
    1000
}

fn default_max_concurrent() -> usize {
    64
}

fn default_step_timeout() -> u64 {
    300
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_wake_poll_interval() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_execution: default_max_steps(),
            max_concurrent_executions: default_max_concurrent(),
            default_step_timeout_secs: default_step_timeout(),
            dead_end_policy: DeadEndPolicy::default(),
            event_bus_capacity: default_event_bus_capacity(),
            wake_poll_interval_ms: default_wake_poll_interval(),
            default_parallel_quorum: None,
        }
    }
}

/// Treatment of a non-terminal step with no satisfied outgoing transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadEndPolicy {
    /// Fail the execution with `NoValidTransition`.
    #[default]
    Fail,
    /// Treat the dead end as implicit completion.
    Complete,
}
