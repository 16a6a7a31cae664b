//! Run configuration.
//!
//! Loaded from a YAML file and overridable from the CLI. Solver settings
//! feed the built-in SGD driver; parallel settings pick the runtime
//! backend and the device list (first id is the root).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::runtime::RuntimeKind;

// Default value functions for serde
fn default_max_iter() -> usize { 500 }
fn default_learning_rate() -> f32 { 0.05 }
fn default_batch_size() -> usize { 32 }
fn default_feature_dim() -> usize { 16 }
fn default_dataset_size() -> usize { 1024 }
fn default_log_interval() -> usize { 100 }

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TrainConfig {
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub parallel: ParallelConfig,
}

impl TrainConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SolverConfig {
    /// Total iteration budget.
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    /// Per-replica minibatch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Synthetic regression problem dimensions.
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,
    #[serde(default = "default_dataset_size")]
    pub dataset_size: usize,

    /// Base random seed; replica i trains with `seed + device_id`.
    #[serde(default)]
    pub random_seed: Option<u64>,

    /// Iterations between loss log lines (0 = silent).
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            learning_rate: default_learning_rate(),
            batch_size: default_batch_size(),
            feature_dim: default_feature_dim(),
            dataset_size: default_dataset_size(),
            random_seed: None,
            log_interval: default_log_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ParallelConfig {
    /// Runtime backend.
    #[serde(default)]
    pub runtime: RuntimeKind,

    /// Device IDs to train on; the first is the root. Empty = device 0.
    #[serde(default)]
    pub gpu_ids: Vec<i32>,
}

impl ParallelConfig {
    pub fn devices(&self) -> Vec<i32> {
        if self.gpu_ids.is_empty() {
            vec![0]
        } else {
            self.gpu_ids.clone()
        }
    }

    pub fn world_size(&self) -> usize {
        self.devices().len()
    }
}
