//! reducr: tree-based synchronous data-parallel training coordination.
//!
//! Given N accelerators and a training driver, reducr keeps the
//! learnable parameters of N replicas bit-identical across every
//! optimization step while minimizing cross-device transfer cost.
//!
//! # Architecture
//!
//! - `topology` - maps devices onto a binary reduction tree, preferring
//!   board-local then P2P-capable pairs
//! - `params` - one contiguous flat buffer per replica for values and one
//!   for gradients; tensors are rebound to alias into them
//! - `mailbox` / `replica` - per-step scatter of parameters down the tree
//!   and gather of gradients up it, over blocking mailboxes and async
//!   device-to-device copies
//! - `coordinator` - builds the tree, runs one worker thread per non-root
//!   replica, and the root driver on the calling thread
//! - `runtime` - pluggable accelerator backend (host emulation by
//!   default, CUDA via the `cuda` feature)
//!
//! The training driver itself (forward/backward/optimizer) stays outside:
//! it is consumed through the `Driver` trait, and `solver::SgdSolver`
//! ships as a small reference implementation.

pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod mailbox;
pub mod params;
pub mod replica;
pub mod runtime;
pub mod solver;
pub mod tensor;
pub mod topology;

pub use config::{ParallelConfig, SolverConfig, TrainConfig};
pub use coordinator::run;
pub use driver::{Driver, DriverParams, StepHooks};
pub use error::{Error, Result};
pub use runtime::{create_runtime, AcceleratorRuntime, DeviceBuffer, HostRuntime, RuntimeKind};
pub use solver::SgdSolver;
pub use tensor::ParamTensor;
pub use topology::{compute_pairs, DevicePair, ROOT_PARENT};
