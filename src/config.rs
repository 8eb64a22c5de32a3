//! Pipeline tuning knobs.
//!
//! Embedders deserialize this from their own settings file (or just use
//! `Default`, which matches the batching constants the stages were designed
//! around).

use serde::Deserialize;
use std::time::Duration;

fn default_maximum_wait_time_ms() -> u64 {
    10
}

fn default_listener_batch_size() -> usize {
    1000
}

fn default_stage_batch_size() -> usize {
    10_000
}

/// Configuration shared by the pipeline stages.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Longest a stage may sit on partial results before its listeners hear
    /// about them, in milliseconds. Also the idle delay between scheduler
    /// ticks when a stage is caught up.
    #[serde(default = "default_maximum_wait_time_ms")]
    pub maximum_wait_time_ms: u64,

    /// Largest coalesced append a stage delivers to one listener callback.
    #[serde(default = "default_listener_batch_size")]
    pub listener_batch_size: usize,

    /// Most source rows a stage processes in one scheduler tick.
    #[serde(default = "default_stage_batch_size")]
    pub stage_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            maximum_wait_time_ms: default_maximum_wait_time_ms(),
            listener_batch_size: default_listener_batch_size(),
            stage_batch_size: default_stage_batch_size(),
        }
    }
}

impl PipelineConfig {
    pub fn maximum_wait_time(&self) -> Duration {
        Duration::from_millis(self.maximum_wait_time_ms)
    }
}
