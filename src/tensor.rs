//! The flat-buffer view surface consumed from the tensor library.
//!
//! A `ParamTensor` is one learnable parameter: an element count, host-side
//! storage for values and gradients, and rebindable device/host views.
//! After a replica configures its flat buffers, every tensor's device
//! views alias successive slices of the replica's `data` and `diff`
//! regions and no per-tensor device allocation remains.

use crate::error::Result;
use crate::runtime::{AcceleratorRuntime, DeviceBuffer};

pub struct ParamTensor {
    count: usize,
    values: Vec<f32>,
    grads: Vec<f32>,
    device_data: Option<DeviceBuffer>,
    device_diff: Option<DeviceBuffer>,
    host_data: Option<DeviceBuffer>,
    host_diff: Option<DeviceBuffer>,
}

impl ParamTensor {
    pub fn new(values: Vec<f32>) -> Self {
        let count = values.len();
        Self {
            count,
            values,
            grads: vec![0.0; count],
            device_data: None,
            device_diff: None,
            host_data: None,
            host_diff: None,
        }
    }

    pub fn zeros(count: usize) -> Self {
        Self::new(vec![0.0; count])
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn host_values(&self) -> &[f32] {
        &self.values
    }

    pub fn host_values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn set_host_values(&mut self, values: &[f32]) {
        assert_eq!(values.len(), self.count, "tensor shape is fixed");
        self.values.copy_from_slice(values);
    }

    // Storage rebinding. `None` detaches the view and falls back to the
    // owned host storage.

    pub fn set_device_data(&mut self, view: Option<DeviceBuffer>) {
        Self::check_view(&view, self.count);
        self.device_data = view;
    }

    pub fn set_device_diff(&mut self, view: Option<DeviceBuffer>) {
        Self::check_view(&view, self.count);
        self.device_diff = view;
    }

    pub fn set_host_data(&mut self, view: Option<DeviceBuffer>) {
        Self::check_view(&view, self.count);
        self.host_data = view;
    }

    pub fn set_host_diff(&mut self, view: Option<DeviceBuffer>) {
        Self::check_view(&view, self.count);
        self.host_diff = view;
    }

    pub fn device_data(&self) -> Option<DeviceBuffer> {
        self.device_data
    }

    pub fn device_diff(&self) -> Option<DeviceBuffer> {
        self.device_diff
    }

    pub fn host_data(&self) -> Option<DeviceBuffer> {
        self.host_data
    }

    pub fn host_diff(&self) -> Option<DeviceBuffer> {
        self.host_diff
    }

    fn check_view(view: &Option<DeviceBuffer>, count: usize) {
        if let Some(v) = view {
            assert_eq!(v.len(), count, "view length does not match tensor count");
        }
    }

    // View-aware access used by drivers. Bound device views win over the
    // owned host storage so a configured replica computes against its flat
    // buffers.

    pub fn read_values(&self, runtime: &dyn AcceleratorRuntime) -> Result<Vec<f32>> {
        match self.device_data {
            Some(view) => {
                let mut out = vec![0.0; self.count];
                runtime.download(&view, &mut out)?;
                Ok(out)
            }
            None => Ok(self.values.clone()),
        }
    }

    pub fn write_values(&mut self, runtime: &dyn AcceleratorRuntime, values: &[f32]) -> Result<()> {
        assert_eq!(values.len(), self.count);
        match self.device_data {
            Some(view) => runtime.upload(values, &view),
            None => {
                self.values.copy_from_slice(values);
                Ok(())
            }
        }
    }

    pub fn read_diff(&self, runtime: &dyn AcceleratorRuntime) -> Result<Vec<f32>> {
        match self.device_diff {
            Some(view) => {
                let mut out = vec![0.0; self.count];
                runtime.download(&view, &mut out)?;
                Ok(out)
            }
            None => Ok(self.grads.clone()),
        }
    }

    pub fn write_diff(&mut self, runtime: &dyn AcceleratorRuntime, grads: &[f32]) -> Result<()> {
        assert_eq!(grads.len(), self.count);
        match self.device_diff {
            Some(view) => runtime.upload(grads, &view),
            None => {
                self.grads.copy_from_slice(grads);
                Ok(())
            }
        }
    }

    /// `values += alpha * diff`, through the bound views when present.
    pub fn axpy_update(&mut self, runtime: &dyn AcceleratorRuntime, alpha: f32) -> Result<()> {
        match (self.device_data, self.device_diff) {
            (Some(data), Some(diff)) => runtime.axpy(alpha, &diff, &data),
            _ => {
                for (v, g) in self.values.iter_mut().zip(self.grads.iter()) {
                    *v += alpha * *g;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::HostRuntime;

    #[test]
    fn test_unbound_tensor_uses_host_storage() {
        let rt = HostRuntime::new(1);
        let mut t = ParamTensor::new(vec![1.0, 2.0]);
        t.write_diff(&rt, &[0.5, 0.5]).unwrap();
        t.axpy_update(&rt, -1.0).unwrap();
        assert_eq!(t.read_values(&rt).unwrap(), vec![0.5, 1.5]);
    }

    #[test]
    fn test_bound_tensor_reads_through_view() {
        let rt = HostRuntime::new(1);
        let buf = rt.alloc(0, 4).unwrap();
        rt.upload(&[9.0, 8.0, 7.0, 6.0], &buf).unwrap();

        let mut t = ParamTensor::zeros(2);
        t.set_device_data(Some(buf.slice(2, 2)));
        assert_eq!(t.read_values(&rt).unwrap(), vec![7.0, 6.0]);

        // Detaching falls back to the owned host values.
        t.set_device_data(None);
        assert_eq!(t.read_values(&rt).unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    #[should_panic(expected = "view length")]
    fn test_view_length_mismatch() {
        let rt = HostRuntime::new(1);
        let buf = rt.alloc(0, 4).unwrap();
        let mut t = ParamTensor::zeros(2);
        t.set_device_data(Some(buf));
    }
}
