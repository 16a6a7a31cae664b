//! Traits consumed from the training driver.
//!
//! The coordinator never looks inside the forward/backward/optimizer loop;
//! it sees a `Driver` it can fork per device, drive for a number of
//! iterations, and observe through two per-step hooks. The built-in
//! `SgdSolver` implements this surface for the demo binary and the tests;
//! an embedding application supplies its own.

use std::sync::Arc;

use crate::error::Result;
use crate::tensor::ParamTensor;

/// Per-step observer interface.
///
/// `on_start` runs before the forward pass, `on_gradients_ready` after the
/// backward pass. The replica synchronization state implements this; the
/// driver must invoke both hooks exactly once per iteration or the tree
/// deadlocks at the next mailbox exchange.
pub trait StepHooks: Send + Sync {
    fn on_start(&self) -> Result<()>;
    fn on_gradients_ready(&self) -> Result<()>;
}

/// Driver configuration consumed by the coordinator.
#[derive(Debug, Clone)]
pub struct DriverParams {
    /// Device this driver instance trains on.
    pub device_id: i32,
    /// Total iteration budget.
    pub max_iter: usize,
    /// Base random seed. Replica i reseeds its driver with
    /// `seed + device_id` to decorrelate per-replica stochastic ops while
    /// staying deterministic.
    pub random_seed: Option<u64>,
}

pub trait Driver: Send {
    fn params(&self) -> &DriverParams;

    fn set_device_id(&mut self, device: i32);

    /// Ordered list of learnable parameter tensors. The flat buffer
    /// manager walks this list to size and bind the replica's regions.
    fn learnable_params(&mut self) -> &mut Vec<ParamTensor>;

    /// Register a per-step observer.
    fn add_callback(&mut self, hooks: Arc<dyn StepHooks>);

    /// Run `iters` iterations, invoking the registered hooks at the two
    /// defined points of each.
    fn step(&mut self, iters: usize) -> Result<()>;

    /// Run to the configured iteration budget.
    fn solve(&mut self) -> Result<()>;

    /// Current iteration counter.
    fn iter(&self) -> usize;

    /// Non-root drivers skip the optimizer update; their parameters arrive
    /// from the root through the tree.
    fn set_root(&mut self, root: bool);

    /// Reset the driver's RNG state.
    fn reseed(&mut self, seed: u64);

    /// Construct the driver instance for another device's replica.
    fn fork(&self, params: DriverParams) -> Result<Box<dyn Driver>>;
}
