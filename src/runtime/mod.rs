//! Accelerator runtime abstraction.
//!
//! The coordinator consumes a narrow slice of an accelerator runtime:
//! device selection, raw buffer allocation, async device-to-device copies,
//! stream synchronization, peer-access management, and a handful of
//! element-wise kernels. This module defines that surface as a trait with
//! pluggable backends:
//!
//! - `HostRuntime` - default backend emulating N devices in host memory,
//!   used by tests and for running the demo trainer without GPUs
//! - `CudaRuntime` - cudarc-backed CUDA backend (feature-gated)

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod host;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use host::HostRuntime;

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;

/// Non-owning handle to a contiguous device-resident region of `f32`
/// elements.
///
/// Handles are resolved by the runtime that allocated them; using a handle
/// after `free` is a runtime error, not undefined behavior. `slice` produces
/// an aliasing sub-view into the same allocation, which is how parameter
/// tensors are rebound into a replica's flat buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceBuffer {
    id: u64,
    device: i32,
    offset: usize,
    len: usize,
}

impl DeviceBuffer {
    pub(crate) fn new(id: u64, device: i32, len: usize) -> Self {
        Self { id, device, offset: 0, len }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Device the underlying allocation resides on.
    pub fn device(&self) -> i32 {
        self.device
    }

    /// Element offset of this view within the underlying allocation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// View length in elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Aliasing sub-view of `len` elements starting at `offset`.
    ///
    /// Panics when the requested range falls outside this view; an
    /// out-of-range rebind is a programmer error.
    pub fn slice(&self, offset: usize, len: usize) -> DeviceBuffer {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "slice of {} elements at offset {} exceeds buffer of {} elements",
            len,
            offset,
            self.len,
        );
        DeviceBuffer {
            id: self.id,
            device: self.device,
            offset: self.offset + offset,
            len,
        }
    }
}

/// The accelerator runtime surface consumed by the coordinator.
///
/// Device-to-device copies are issued asynchronously on the calling
/// thread's active device and ordered by `synchronize`; the tree protocol
/// relies on copy-then-synchronize-then-notify at every edge. The last
/// group of methods is the element-wise kernel surface the coordinator
/// and drivers consume (`fill`, `add`, `scale`, `axpy`).
pub trait AcceleratorRuntime: Send + Sync {
    /// Number of devices visible to this runtime.
    fn device_count(&self) -> Result<usize>;

    /// The calling thread's active device.
    fn current_device(&self) -> Result<i32>;

    /// Bind the calling thread to `device`.
    fn set_device(&self, device: i32) -> Result<()>;

    /// Allocate `len` elements of device memory on `device`, zero-filled.
    fn alloc(&self, device: i32, len: usize) -> Result<DeviceBuffer>;

    /// Release an allocation. The handle must be the full view returned by
    /// `alloc`, not a slice of it.
    fn free(&self, buffer: DeviceBuffer) -> Result<()>;

    /// Asynchronous device-to-device copy of `len` elements from `src` to
    /// `dst`, issued on the active device's stream. Source and destination
    /// may reside on different devices; the copy is staged by the runtime
    /// when no peer access exists.
    fn copy_async(&self, src: &DeviceBuffer, dst: &DeviceBuffer, len: usize) -> Result<()>;

    /// Block until all work issued on the active device's stream completes.
    fn synchronize(&self) -> Result<()>;

    /// Copy host values into a device region. Lengths must match.
    fn upload(&self, src: &[f32], dst: &DeviceBuffer) -> Result<()>;

    /// Copy a device region into host memory. Lengths must match.
    fn download(&self, src: &DeviceBuffer, dst: &mut [f32]) -> Result<()>;

    /// Whether `device` can directly access memory on `peer`.
    fn can_access_peer(&self, device: i32, peer: i32) -> Result<bool>;

    /// Enable direct access from `device` to `peer`. Idempotent within a
    /// process, but every enable must be paired with a disable.
    fn enable_peer_access(&self, device: i32, peer: i32) -> Result<()>;

    fn disable_peer_access(&self, device: i32, peer: i32) -> Result<()>;

    /// Multi-GPU board group of `device`, when the runtime exposes the
    /// query. Runtimes without board topology report `None` and the
    /// planner skips board-local pairing.
    fn board_group(&self, device: i32) -> Result<Option<i32>>;

    /// `dst[i] = value`.
    fn fill(&self, value: f32, dst: &DeviceBuffer) -> Result<()>;

    /// `dst[i] += src[i]` over the first `len` elements. Both regions must
    /// reside on the active device.
    fn add_assign(&self, src: &DeviceBuffer, dst: &DeviceBuffer, len: usize) -> Result<()>;

    /// `dst[i] *= alpha`.
    fn scale(&self, alpha: f32, dst: &DeviceBuffer) -> Result<()>;

    /// `y[i] += alpha * x[i]`. Lengths must match.
    fn axpy(&self, alpha: f32, x: &DeviceBuffer, y: &DeviceBuffer) -> Result<()>;
}

/// Scoped device binding: saves the calling thread's active device, binds a
/// new one, and restores the saved device on drop - on every exit path.
pub struct DeviceGuard<'a> {
    runtime: &'a dyn AcceleratorRuntime,
    previous: i32,
}

impl<'a> DeviceGuard<'a> {
    pub fn new(runtime: &'a dyn AcceleratorRuntime, device: i32) -> Result<Self> {
        let previous = runtime.current_device()?;
        runtime.set_device(device)?;
        Ok(Self { runtime, previous })
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.set_device(self.previous) {
            log::error!("failed to restore active device {}: {}", self.previous, e);
        }
    }
}

/// Peer-access lifetime manager for one child-to-parent edge.
///
/// Construction queries accessibility and enables direct access when the
/// hardware supports it; otherwise the edge falls back to runtime-staged
/// copies and the degradation is logged. Drop disables symmetrically.
pub struct PeerAccess {
    runtime: Arc<dyn AcceleratorRuntime>,
    device: i32,
    peer: i32,
    enabled: bool,
}

impl PeerAccess {
    pub fn establish(
        runtime: Arc<dyn AcceleratorRuntime>,
        device: i32,
        peer: i32,
    ) -> Result<Self> {
        let enabled = runtime.can_access_peer(device, peer)?;
        if enabled {
            runtime.enable_peer_access(device, peer)?;
        } else {
            log::info!(
                "device {} does not have p2p access to device {}",
                device,
                peer
            );
        }
        Ok(Self { runtime, device, peer, enabled })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Drop for PeerAccess {
    fn drop(&mut self) {
        if self.enabled {
            if let Err(e) = self.runtime.disable_peer_access(self.device, self.peer) {
                log::warn!(
                    "failed to disable p2p access {} -> {}: {}",
                    self.device,
                    self.peer,
                    e
                );
            }
        }
    }
}

/// Runtime backend selection.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Emulated devices in host memory (no accelerator required).
    #[default]
    Host,
    /// CUDA devices via cudarc (requires the 'cuda' feature).
    Cuda,
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" | "cpu" => Ok(RuntimeKind::Host),
            "cuda" | "gpu" => Ok(RuntimeKind::Cuda),
            _ => Err(format!(
                "Unknown runtime: {}. Valid options: host, cuda",
                s
            )),
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Host => write!(f, "host"),
            RuntimeKind::Cuda => write!(f, "cuda"),
        }
    }
}

/// Create a runtime based on configuration.
///
/// `device_count` sizes the emulated device fleet for the host backend and
/// is ignored by the CUDA backend, which enumerates real hardware.
pub fn create_runtime(
    kind: RuntimeKind,
    device_count: usize,
) -> Result<Arc<dyn AcceleratorRuntime>> {
    match kind {
        RuntimeKind::Host => Ok(Arc::new(HostRuntime::new(device_count))),
        #[cfg(feature = "cuda")]
        RuntimeKind::Cuda => {
            let _ = device_count;
            Ok(Arc::new(CudaRuntime::new()?))
        }
        #[cfg(not(feature = "cuda"))]
        RuntimeKind::Cuda => Err(Error::Config(
            "CUDA runtime requested but the 'cuda' feature is not enabled. \
             Compile with --features cuda to enable CUDA support."
                .to_string(),
        )),
    }
}
