//! Flat parameter/gradient buffer management.
//!
//! Each replica keeps all parameter values in one contiguous device region
//! (`data`) and all gradients in another (`diff`), and rebinds the
//! driver's tensors to alias successive slices of them. That turns the
//! per-step scatter and gather into a single device-to-device copy of
//! `size` elements per tree edge instead of one copy per tensor.

use std::sync::Arc;

use crate::error::Result;
use crate::runtime::{AcceleratorRuntime, DeviceBuffer, DeviceGuard};
use crate::tensor::ParamTensor;

/// Operation applied while walking a tensor list against a flat region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOp {
    /// Initialize the region from the tensors' current host-side values.
    Copy,
    /// Rebind each tensor's device value storage into the region.
    BindValuesDevice,
    /// Rebind each tensor's host value storage into the region.
    BindValuesHost,
    /// Rebind each tensor's device gradient storage into the region.
    BindGradsDevice,
    /// Rebind each tensor's host gradient storage into the region.
    BindGradsHost,
}

/// Flat-buffer length for a tensor list: at least one element, so
/// allocation never collapses when a driver has no learnable parameters.
pub fn total_size(tensors: &[ParamTensor]) -> usize {
    let size: usize = tensors.iter().map(|t| t.count()).sum();
    size.max(1)
}

/// Walk `tensors` against successive slices of `buffer`, applying `op`.
///
/// Panics when the element counts walked do not add up to `total` (or the
/// list is empty and `total` is not the 1-element floor); a mismatch means
/// the buffer was sized against a different tensor list.
pub fn apply_buffers(
    runtime: &dyn AcceleratorRuntime,
    tensors: &mut [ParamTensor],
    buffer: DeviceBuffer,
    total: usize,
    op: BufferOp,
) -> Result<()> {
    let mut offset = 0usize;
    for tensor in tensors.iter_mut() {
        let count = tensor.count();
        let view = buffer.slice(offset, count);
        match op {
            BufferOp::Copy => runtime.upload(tensor.host_values(), &view)?,
            BufferOp::BindValuesDevice => tensor.set_device_data(Some(view)),
            BufferOp::BindValuesHost => tensor.set_host_data(Some(view)),
            BufferOp::BindGradsDevice => tensor.set_device_diff(Some(view)),
            BufferOp::BindGradsHost => tensor.set_host_diff(Some(view)),
        }
        offset += count;
    }
    let walked = if offset == 0 { 1 } else { offset };
    assert_eq!(
        walked, total,
        "parameter element count does not match flat buffer size"
    );
    Ok(())
}

/// A replica's flat buffers: `data` for values, `diff` for gradients, both
/// resident on the replica's device.
///
/// Construction sizes the regions from the root driver's tensor list,
/// initializes `data` from the root's current values (so every replica
/// starts from identical parameters) and zeroes `diff`. `configure`
/// rebinds an arbitrary driver's tensors into the regions.
pub struct ReplicaBuffers {
    runtime: Arc<dyn AcceleratorRuntime>,
    device: i32,
    size: usize,
    data: DeviceBuffer,
    diff: DeviceBuffer,
}

impl ReplicaBuffers {
    pub fn new(
        runtime: &Arc<dyn AcceleratorRuntime>,
        root_tensors: &mut [ParamTensor],
        device: i32,
    ) -> Result<Self> {
        let size = total_size(root_tensors);
        let _bind = DeviceGuard::new(runtime.as_ref(), device)?;

        let data = runtime.alloc(device, size)?;
        apply_buffers(runtime.as_ref(), root_tensors, data, size, BufferOp::Copy)?;

        let diff = runtime.alloc(device, size)?;
        runtime.fill(0.0, &diff)?;

        Ok(Self {
            runtime: runtime.clone(),
            device,
            size,
            data,
            diff,
        })
    }

    /// Rebind a driver's tensors to alias this replica's regions.
    pub fn configure(&self, tensors: &mut [ParamTensor]) -> Result<()> {
        apply_buffers(
            self.runtime.as_ref(),
            tensors,
            self.data,
            self.size,
            BufferOp::BindValuesDevice,
        )?;
        apply_buffers(
            self.runtime.as_ref(),
            tensors,
            self.diff,
            self.size,
            BufferOp::BindGradsDevice,
        )
    }

    /// Copy the current `data` region back into the tensors' host storage
    /// and detach the device views, leaving the driver usable after the
    /// buffers are released.
    pub fn restore_host(&self, tensors: &mut [ParamTensor]) -> Result<()> {
        let mut offset = 0usize;
        for tensor in tensors.iter_mut() {
            let count = tensor.count();
            let mut host = vec![0.0; count];
            self.runtime.download(&self.data.slice(offset, count), &mut host)?;
            tensor.set_host_values(&host);
            tensor.set_device_data(None);
            tensor.set_device_diff(None);
            offset += count;
        }
        Ok(())
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn data(&self) -> DeviceBuffer {
        self.data
    }

    pub fn diff(&self) -> DeviceBuffer {
        self.diff
    }
}

impl Drop for ReplicaBuffers {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.free(self.data) {
            log::warn!("failed to release data buffer on device {}: {}", self.device, e);
        }
        if let Err(e) = self.runtime.free(self.diff) {
            log::warn!("failed to release diff buffer on device {}: {}", self.device, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::HostRuntime;

    fn three_tensors() -> Vec<ParamTensor> {
        vec![
            ParamTensor::new(vec![1.0, 2.0, 3.0]),
            ParamTensor::new(vec![4.0]),
            ParamTensor::new(vec![5.0, 6.0]),
        ]
    }

    #[test]
    fn test_total_size() {
        assert_eq!(total_size(&three_tensors()), 6);
        // An empty parameter list still gets a 1-element buffer.
        assert_eq!(total_size(&[]), 1);
    }

    #[test]
    fn test_rebinding_is_a_bijection() {
        let runtime: Arc<dyn AcceleratorRuntime> = Arc::new(HostRuntime::new(1));
        let mut tensors = three_tensors();
        let buffers = ReplicaBuffers::new(&runtime, &mut tensors, 0).unwrap();
        buffers.configure(&mut tensors).unwrap();

        let mut expected_offset = 0;
        for t in &tensors {
            let data = t.device_data().unwrap();
            let diff = t.device_diff().unwrap();
            assert_eq!(data.id(), buffers.data().id());
            assert_eq!(diff.id(), buffers.diff().id());
            assert_eq!(data.offset(), expected_offset);
            assert_eq!(diff.offset(), expected_offset);
            assert_eq!(data.len(), t.count());
            expected_offset += t.count();
        }
        assert_eq!(expected_offset, buffers.size());
    }

    #[test]
    fn test_copy_initializes_from_host_values() {
        let runtime: Arc<dyn AcceleratorRuntime> = Arc::new(HostRuntime::new(1));
        let mut tensors = three_tensors();
        let buffers = ReplicaBuffers::new(&runtime, &mut tensors, 0).unwrap();

        let mut out = vec![0.0; 6];
        runtime.download(&buffers.data(), &mut out).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let mut diff = vec![1.0; 6];
        runtime.download(&buffers.diff(), &mut diff).unwrap();
        assert_eq!(diff, vec![0.0; 6]);
    }

    #[test]
    fn test_empty_tensor_list_allocates_one_element() {
        let runtime: Arc<dyn AcceleratorRuntime> = Arc::new(HostRuntime::new(1));
        let mut tensors: Vec<ParamTensor> = Vec::new();
        let buffers = ReplicaBuffers::new(&runtime, &mut tensors, 0).unwrap();
        assert_eq!(buffers.size(), 1);
        buffers.configure(&mut tensors).unwrap();
    }

    #[test]
    fn test_restore_host_roundtrip() {
        let runtime: Arc<dyn AcceleratorRuntime> = Arc::new(HostRuntime::new(1));
        let mut tensors = three_tensors();
        let buffers = ReplicaBuffers::new(&runtime, &mut tensors, 0).unwrap();
        buffers.configure(&mut tensors).unwrap();

        runtime.scale(10.0, &buffers.data()).unwrap();
        buffers.restore_host(&mut tensors).unwrap();

        assert_eq!(tensors[0].host_values(), &[10.0, 20.0, 30.0]);
        assert_eq!(tensors[1].host_values(), &[40.0]);
        assert_eq!(tensors[2].host_values(), &[50.0, 60.0]);
        assert!(tensors[0].device_data().is_none());
        assert!(tensors[0].device_diff().is_none());
    }

    #[test]
    fn test_host_rebinding_ops() {
        let runtime: Arc<dyn AcceleratorRuntime> = Arc::new(HostRuntime::new(1));
        let mut tensors = three_tensors();
        let total = total_size(&tensors);
        let region = runtime.alloc(0, total).unwrap();

        apply_buffers(runtime.as_ref(), &mut tensors, region, total, BufferOp::BindValuesHost)
            .unwrap();
        apply_buffers(runtime.as_ref(), &mut tensors, region, total, BufferOp::BindGradsHost)
            .unwrap();

        assert_eq!(tensors[1].host_data().unwrap().offset(), 3);
        assert_eq!(tensors[2].host_diff().unwrap().offset(), 4);
        runtime.free(region).unwrap();
    }
}
