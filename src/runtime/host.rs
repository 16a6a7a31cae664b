//! Host-memory runtime backend.
//!
//! Emulates a fleet of N devices with plain host allocations. Copies
//! complete immediately and `synchronize` is a no-op, which preserves the
//! copy-then-synchronize-then-notify ordering the tree protocol relies on.
//! Peer accessibility and board groups are configurable so tests can model
//! arbitrary interconnect topologies; by default every pair of devices is
//! peer-capable and no board information is reported.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};

use super::{AcceleratorRuntime, DeviceBuffer};

thread_local! {
    // Mirrors the CUDA model: the active device is per-thread state.
    static ACTIVE_DEVICE: Cell<i32> = const { Cell::new(0) };
}

struct HostAlloc {
    device: i32,
    data: Box<[f32]>,
}

pub struct HostRuntime {
    device_count: usize,
    peers: Vec<Vec<bool>>,
    boards: Vec<Option<i32>>,
    next_id: AtomicU64,
    allocs: Mutex<HashMap<u64, HostAlloc>>,
    enabled_peers: Mutex<HashSet<(i32, i32)>>,
}

impl HostRuntime {
    /// Create a runtime emulating `device_count` devices, all mutually
    /// peer-accessible.
    pub fn new(device_count: usize) -> Self {
        assert!(device_count > 0, "host runtime needs at least one device");
        let peers = (0..device_count)
            .map(|i| (0..device_count).map(|j| i != j).collect())
            .collect();
        Self {
            device_count,
            peers,
            boards: vec![None; device_count],
            next_id: AtomicU64::new(1),
            allocs: Mutex::new(HashMap::new()),
            enabled_peers: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the peer-accessibility matrix (`matrix[i][j]` = device i can
    /// access device j).
    pub fn with_peer_access(mut self, matrix: Vec<Vec<bool>>) -> Self {
        assert_eq!(matrix.len(), self.device_count);
        for row in &matrix {
            assert_eq!(row.len(), self.device_count);
        }
        self.peers = matrix;
        self
    }

    /// Disable peer access between every pair of devices.
    pub fn without_peer_access(mut self) -> Self {
        self.peers = vec![vec![false; self.device_count]; self.device_count];
        self
    }

    /// Report multi-GPU board membership per device (`None` = no board
    /// information, the planner skips board-local pairing for it).
    pub fn with_boards(mut self, boards: Vec<Option<i32>>) -> Self {
        assert_eq!(boards.len(), self.device_count);
        self.boards = boards;
        self
    }

    fn check_device(&self, device: i32) -> Result<()> {
        if device < 0 || device as usize >= self.device_count {
            return Err(Error::Runtime(format!(
                "device {} out of range (runtime has {} devices)",
                device, self.device_count
            )));
        }
        Ok(())
    }

    /// Read `src` out of the allocation table. Two-buffer operations copy
    /// the source region first so a single lock covers the whole call.
    fn read_region(
        &self,
        allocs: &HashMap<u64, HostAlloc>,
        buf: &DeviceBuffer,
        len: usize,
    ) -> Result<Vec<f32>> {
        let alloc = allocs
            .get(&buf.id())
            .ok_or_else(|| Error::Runtime(format!("invalid buffer handle {}", buf.id())))?;
        debug_assert_eq!(alloc.device, buf.device());
        let start = buf.offset();
        if start + len > alloc.data.len() {
            return Err(Error::Runtime(format!(
                "read of {} elements at offset {} exceeds allocation of {}",
                len,
                start,
                alloc.data.len()
            )));
        }
        Ok(alloc.data[start..start + len].to_vec())
    }

    fn region_mut<'m>(
        allocs: &'m mut HashMap<u64, HostAlloc>,
        buf: &DeviceBuffer,
        len: usize,
    ) -> Result<&'m mut [f32]> {
        let alloc = allocs
            .get_mut(&buf.id())
            .ok_or_else(|| Error::Runtime(format!("invalid buffer handle {}", buf.id())))?;
        debug_assert_eq!(alloc.device, buf.device());
        let start = buf.offset();
        if start + len > alloc.data.len() {
            return Err(Error::Runtime(format!(
                "write of {} elements at offset {} exceeds allocation of {}",
                len,
                start,
                alloc.data.len()
            )));
        }
        Ok(&mut alloc.data[start..start + len])
    }
}

impl AcceleratorRuntime for HostRuntime {
    fn device_count(&self) -> Result<usize> {
        Ok(self.device_count)
    }

    fn current_device(&self) -> Result<i32> {
        Ok(ACTIVE_DEVICE.get())
    }

    fn set_device(&self, device: i32) -> Result<()> {
        self.check_device(device)?;
        ACTIVE_DEVICE.set(device);
        Ok(())
    }

    fn alloc(&self, device: i32, len: usize) -> Result<DeviceBuffer> {
        self.check_device(device)?;
        if len == 0 {
            return Err(Error::Runtime(
                "zero-length device allocation".to_string(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let alloc = HostAlloc {
            device,
            data: vec![0.0; len].into_boxed_slice(),
        };
        self.allocs.lock().unwrap().insert(id, alloc);
        Ok(DeviceBuffer::new(id, device, len))
    }

    fn free(&self, buffer: DeviceBuffer) -> Result<()> {
        assert_eq!(buffer.offset(), 0, "free of a sliced buffer view");
        self.allocs
            .lock()
            .unwrap()
            .remove(&buffer.id())
            .map(|_| ())
            .ok_or_else(|| {
                Error::Runtime(format!("double free of buffer handle {}", buffer.id()))
            })
    }

    fn copy_async(&self, src: &DeviceBuffer, dst: &DeviceBuffer, len: usize) -> Result<()> {
        let mut allocs = self.allocs.lock().unwrap();
        let tmp = self.read_region(&allocs, src, len)?;
        let out = Self::region_mut(&mut allocs, dst, len)?;
        out.copy_from_slice(&tmp);
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        // Host copies complete eagerly; there is no stream to drain.
        Ok(())
    }

    fn upload(&self, src: &[f32], dst: &DeviceBuffer) -> Result<()> {
        if src.len() != dst.len() {
            return Err(Error::Runtime(format!(
                "upload length mismatch: {} host elements into {} device elements",
                src.len(),
                dst.len()
            )));
        }
        let mut allocs = self.allocs.lock().unwrap();
        let out = Self::region_mut(&mut allocs, dst, dst.len())?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn download(&self, src: &DeviceBuffer, dst: &mut [f32]) -> Result<()> {
        if src.len() != dst.len() {
            return Err(Error::Runtime(format!(
                "download length mismatch: {} device elements into {} host elements",
                src.len(),
                dst.len()
            )));
        }
        let allocs = self.allocs.lock().unwrap();
        let tmp = self.read_region(&allocs, src, src.len())?;
        dst.copy_from_slice(&tmp);
        Ok(())
    }

    fn can_access_peer(&self, device: i32, peer: i32) -> Result<bool> {
        self.check_device(device)?;
        self.check_device(peer)?;
        Ok(self.peers[device as usize][peer as usize])
    }

    fn enable_peer_access(&self, device: i32, peer: i32) -> Result<()> {
        if !self.can_access_peer(device, peer)? {
            return Err(Error::Runtime(format!(
                "peer access {} -> {} is not available",
                device, peer
            )));
        }
        self.enabled_peers.lock().unwrap().insert((device, peer));
        Ok(())
    }

    fn disable_peer_access(&self, device: i32, peer: i32) -> Result<()> {
        self.check_device(device)?;
        self.check_device(peer)?;
        if !self.enabled_peers.lock().unwrap().remove(&(device, peer)) {
            return Err(Error::Runtime(format!(
                "peer access {} -> {} was not enabled",
                device, peer
            )));
        }
        Ok(())
    }

    fn board_group(&self, device: i32) -> Result<Option<i32>> {
        self.check_device(device)?;
        Ok(self.boards[device as usize])
    }

    fn fill(&self, value: f32, dst: &DeviceBuffer) -> Result<()> {
        let mut allocs = self.allocs.lock().unwrap();
        let out = Self::region_mut(&mut allocs, dst, dst.len())?;
        out.fill(value);
        Ok(())
    }

    fn add_assign(&self, src: &DeviceBuffer, dst: &DeviceBuffer, len: usize) -> Result<()> {
        let mut allocs = self.allocs.lock().unwrap();
        let tmp = self.read_region(&allocs, src, len)?;
        let out = Self::region_mut(&mut allocs, dst, len)?;
        for (o, s) in out.iter_mut().zip(tmp.iter()) {
            *o += *s;
        }
        Ok(())
    }

    fn scale(&self, alpha: f32, dst: &DeviceBuffer) -> Result<()> {
        let mut allocs = self.allocs.lock().unwrap();
        let out = Self::region_mut(&mut allocs, dst, dst.len())?;
        for o in out.iter_mut() {
            *o *= alpha;
        }
        Ok(())
    }

    fn axpy(&self, alpha: f32, x: &DeviceBuffer, y: &DeviceBuffer) -> Result<()> {
        if x.len() != y.len() {
            return Err(Error::Runtime(format!(
                "axpy length mismatch: {} vs {}",
                x.len(),
                y.len()
            )));
        }
        let mut allocs = self.allocs.lock().unwrap();
        let tmp = self.read_region(&allocs, x, x.len())?;
        let out = Self::region_mut(&mut allocs, y, y.len())?;
        for (o, s) in out.iter_mut().zip(tmp.iter()) {
            *o += alpha * *s;
        }
        Ok(())
    }
}
