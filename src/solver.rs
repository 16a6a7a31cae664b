//! Built-in SGD driver: least-squares regression on synthetic data.
//!
//! This is the demo workload of the training binary and the end-to-end
//! test driver. It is deliberately small - a linear model `y = w.x + b`
//! fit by plain SGD - but it exercises the full driver contract: flat
//! parameter tensors, per-step hooks, minibatch sampling from a seeded
//! RNG (decorrelated per replica), mean-loss gradients, and an update the
//! root applies in place on its flat buffer.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SolverConfig;
use crate::driver::{Driver, DriverParams, StepHooks};
use crate::error::Result;
use crate::runtime::AcceleratorRuntime;
use crate::tensor::ParamTensor;

const DEFAULT_SEED: u64 = 1;

/// Synthetic regression dataset, shared by every replica of a run.
struct Dataset {
    features: Vec<f32>, // row-major, samples x dim
    targets: Vec<f32>,
    dim: usize,
}

impl Dataset {
    fn generate(config: &SolverConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let dim = config.feature_dim;
        let true_w: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let true_b: f32 = rng.gen_range(-0.5..0.5);

        let samples = config.dataset_size;
        let mut features = Vec::with_capacity(samples * dim);
        let mut targets = Vec::with_capacity(samples);
        for _ in 0..samples {
            let row: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let noise: f32 = rng.gen_range(-0.01..0.01);
            let y = row.iter().zip(true_w.iter()).map(|(x, w)| x * w).sum::<f32>() + true_b + noise;
            features.extend_from_slice(&row);
            targets.push(y);
        }
        Self { features, targets, dim }
    }

    fn len(&self) -> usize {
        self.targets.len()
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.features[i * self.dim..(i + 1) * self.dim]
    }
}

pub struct SgdSolver {
    params: DriverParams,
    config: SolverConfig,
    runtime: Arc<dyn AcceleratorRuntime>,
    // tensors[0] = weights, tensors[1] = bias
    tensors: Vec<ParamTensor>,
    dataset: Arc<Dataset>,
    rng: StdRng,
    hooks: Vec<Arc<dyn StepHooks>>,
    iter: usize,
    root: bool,
}

impl SgdSolver {
    pub fn new(
        runtime: Arc<dyn AcceleratorRuntime>,
        config: SolverConfig,
        params: DriverParams,
    ) -> Self {
        let seed = params.random_seed.unwrap_or(DEFAULT_SEED);
        let dataset = Arc::new(Dataset::generate(&config, seed));
        let tensors = vec![
            ParamTensor::zeros(config.feature_dim),
            ParamTensor::zeros(1),
        ];
        Self {
            rng: StdRng::seed_from_u64(seed),
            params,
            config,
            runtime,
            tensors,
            dataset,
            hooks: Vec::new(),
            iter: 0,
            root: true,
        }
    }

    /// One forward/backward pass over a sampled minibatch. Writes the mean
    /// gradients into the tensors' diff storage and returns the mean loss.
    fn forward_backward(&mut self) -> Result<f32> {
        let w = self.tensors[0].read_values(self.runtime.as_ref())?;
        let b = self.tensors[1].read_values(self.runtime.as_ref())?[0];

        let batch = self.config.batch_size.min(self.dataset.len()).max(1);
        let dim = self.dataset.dim;
        let mut grad_w = vec![0.0f32; dim];
        let mut grad_b = 0.0f32;
        let mut loss = 0.0f32;

        for _ in 0..batch {
            let i = self.rng.gen_range(0..self.dataset.len());
            let row = self.dataset.row(i);
            let pred = row.iter().zip(w.iter()).map(|(x, wi)| x * wi).sum::<f32>() + b;
            let err = pred - self.dataset.targets[i];
            loss += 0.5 * err * err;
            for (g, x) in grad_w.iter_mut().zip(row.iter()) {
                *g += err * x;
            }
            grad_b += err;
        }
        let inv = 1.0 / batch as f32;
        for g in grad_w.iter_mut() {
            *g *= inv;
        }
        grad_b *= inv;
        loss *= inv;

        self.tensors[0].write_diff(self.runtime.as_ref(), &grad_w)?;
        self.tensors[1].write_diff(self.runtime.as_ref(), &[grad_b])?;
        Ok(loss)
    }

    fn apply_update(&mut self) -> Result<()> {
        let lr = self.config.learning_rate;
        for tensor in self.tensors.iter_mut() {
            tensor.axpy_update(self.runtime.as_ref(), -lr)?;
        }
        Ok(())
    }

    /// Mean loss over the whole dataset with the current parameters.
    pub fn evaluate(&self) -> Result<f32> {
        let w = self.tensors[0].read_values(self.runtime.as_ref())?;
        let b = self.tensors[1].read_values(self.runtime.as_ref())?[0];
        let mut loss = 0.0f32;
        for i in 0..self.dataset.len() {
            let row = self.dataset.row(i);
            let pred = row.iter().zip(w.iter()).map(|(x, wi)| x * wi).sum::<f32>() + b;
            let err = pred - self.dataset.targets[i];
            loss += 0.5 * err * err;
        }
        Ok(loss / self.dataset.len() as f32)
    }
}

impl Driver for SgdSolver {
    fn params(&self) -> &DriverParams {
        &self.params
    }

    fn set_device_id(&mut self, device: i32) {
        self.params.device_id = device;
    }

    fn learnable_params(&mut self) -> &mut Vec<ParamTensor> {
        &mut self.tensors
    }

    fn add_callback(&mut self, hooks: Arc<dyn StepHooks>) {
        self.hooks.push(hooks);
    }

    fn step(&mut self, iters: usize) -> Result<()> {
        let stop = self.iter + iters;
        while self.iter < stop {
            for hook in &self.hooks {
                hook.on_start()?;
            }
            let loss = self.forward_backward()?;
            for hook in &self.hooks {
                hook.on_gradients_ready()?;
            }
            if self.root {
                self.apply_update()?;
            }
            self.iter += 1;

            if self.root
                && self.config.log_interval > 0
                && self.iter % self.config.log_interval == 0
            {
                log::info!("iteration {}, loss = {:.6}", self.iter, loss);
            }
        }
        Ok(())
    }

    fn solve(&mut self) -> Result<()> {
        let remaining = self.params.max_iter.saturating_sub(self.iter);
        log::info!("solving for {} iterations", remaining);
        self.step(remaining)?;
        log::info!("optimization done, final loss = {:.6}", self.evaluate()?);
        Ok(())
    }

    fn iter(&self) -> usize {
        self.iter
    }

    fn set_root(&mut self, root: bool) {
        self.root = root;
    }

    fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    fn fork(&self, params: DriverParams) -> Result<Box<dyn Driver>> {
        let seed = params.random_seed.unwrap_or(DEFAULT_SEED);
        Ok(Box::new(SgdSolver {
            rng: StdRng::seed_from_u64(seed),
            params,
            config: self.config.clone(),
            runtime: self.runtime.clone(),
            tensors: vec![
                ParamTensor::zeros(self.config.feature_dim),
                ParamTensor::zeros(1),
            ],
            dataset: Arc::clone(&self.dataset),
            hooks: Vec::new(),
            iter: self.iter,
            root: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::HostRuntime;

    fn quick_config() -> SolverConfig {
        SolverConfig {
            max_iter: 200,
            learning_rate: 0.1,
            batch_size: 16,
            feature_dim: 4,
            dataset_size: 128,
            random_seed: Some(7),
            log_interval: 0,
        }
    }

    #[test]
    fn test_standalone_training_converges() {
        let runtime: Arc<dyn AcceleratorRuntime> = Arc::new(HostRuntime::new(1));
        let config = quick_config();
        let params = DriverParams {
            device_id: 0,
            max_iter: config.max_iter,
            random_seed: config.random_seed,
        };
        let mut solver = SgdSolver::new(runtime, config, params);

        let before = solver.evaluate().unwrap();
        solver.solve().unwrap();
        let after = solver.evaluate().unwrap();

        assert!(after < before * 0.05, "loss {} -> {} did not converge", before, after);
        assert_eq!(solver.iter(), 200);
    }

    #[test]
    fn test_reseed_is_deterministic() {
        let runtime: Arc<dyn AcceleratorRuntime> = Arc::new(HostRuntime::new(1));
        let config = quick_config();
        let params = DriverParams {
            device_id: 0,
            max_iter: 50,
            random_seed: Some(7),
        };
        let mut a = SgdSolver::new(runtime.clone(), config.clone(), params.clone());
        let mut b = SgdSolver::new(runtime, config, params);
        a.reseed(99);
        b.reseed(99);
        a.step(50).unwrap();
        b.step(50).unwrap();
        assert_eq!(a.tensors[0].host_values(), b.tensors[0].host_values());
        assert_eq!(a.tensors[1].host_values(), b.tensors[1].host_values());
    }
}
