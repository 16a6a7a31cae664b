//! Per-device replica: buffers, mailbox, tree links, and the step hooks.
//!
//! A replica owns its flat buffers and a driver instance, plus non-owning
//! links to its parent and children. The two hooks implement the per-step
//! protocol: `on_start` waits for the parent's updated parameters and
//! scatters them to the children; `on_gradients_ready` reduces the
//! children's gradients into `diff` and forwards the sum to the parent
//! (the root scales by 1/N instead). Every hand-off is a device copy,
//! a stream synchronize, then a mailbox push - in that order, which is
//! what makes the protocol race-free.

use std::sync::{Arc, Mutex};

use crate::driver::{Driver, StepHooks};
use crate::error::Result;
use crate::mailbox::{Mailbox, MailboxSender};
use crate::params::ReplicaBuffers;
use crate::runtime::{AcceleratorRuntime, DeviceBuffer, DeviceGuard, PeerAccess};
use crate::tensor::ParamTensor;

struct ParentLink {
    rank: usize,
    device: i32,
    /// Gradient staging buffer on the parent's device, owned by this
    /// replica and summed into the parent's `diff` after the hand-off.
    grads: DeviceBuffer,
    mailbox: MailboxSender<usize>,
}

struct ChildLink {
    rank: usize,
    data: DeviceBuffer,
    /// The child's staging buffer, which resides on this device.
    parent_grads: DeviceBuffer,
    mailbox: MailboxSender<usize>,
}

/// Synchronization state of one replica, shared with its driver as the
/// step-hook callback and with its tree neighbors through links.
pub struct ReplicaSync {
    runtime: Arc<dyn AcceleratorRuntime>,
    rank: usize,
    device: i32,
    size: usize,
    data: DeviceBuffer,
    diff: DeviceBuffer,
    parent: Option<ParentLink>,
    children: Mutex<Vec<ChildLink>>,
    mailbox: Mailbox<usize>,
    replica_count: usize,
    // Held for the replica's lifetime; drop disables peer access.
    _peer: Option<PeerAccess>,
}

impl ReplicaSync {
    fn new(
        runtime: Arc<dyn AcceleratorRuntime>,
        rank: usize,
        replica_count: usize,
        buffers: &ReplicaBuffers,
        parent: Option<&Arc<ReplicaSync>>,
    ) -> Result<Arc<Self>> {
        let device = buffers.device();
        let (parent_link, peer) = match parent {
            Some(p) => {
                let peer = PeerAccess::establish(runtime.clone(), device, p.device)?;
                // Receiving buffer for this replica's gradients, allocated
                // on the parent's device.
                let grads = {
                    let _bind = DeviceGuard::new(runtime.as_ref(), p.device)?;
                    runtime.alloc(p.device, buffers.size())?
                };
                let link = ParentLink {
                    rank: p.rank,
                    device: p.device,
                    grads,
                    mailbox: p.mailbox.sender(),
                };
                (Some(link), Some(peer))
            }
            None => (None, None),
        };

        Ok(Arc::new(Self {
            runtime,
            rank,
            device,
            size: buffers.size(),
            data: buffers.data(),
            diff: buffers.diff(),
            parent: parent_link,
            children: Mutex::new(Vec::new()),
            mailbox: Mailbox::new(),
            replica_count,
            _peer: peer,
        }))
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    /// Register `child` under this replica. Called by the coordinator
    /// while building the tree, before any worker thread starts.
    pub(crate) fn adopt(&self, child: &ReplicaSync) {
        let parent = child
            .parent
            .as_ref()
            .expect("adopted replica has no parent link");
        assert_eq!(parent.device, self.device, "adoption across the wrong edge");
        self.children.lock().unwrap().push(ChildLink {
            rank: child.rank,
            data: child.data,
            parent_grads: parent.grads,
            mailbox: child.mailbox.sender(),
        });
    }

    #[cfg(debug_assertions)]
    fn check_device_binding(&self) {
        let current = self.runtime.current_device().unwrap_or(self.device);
        assert_eq!(current, self.device, "hook invoked off the replica's device");
    }
}

impl StepHooks for ReplicaSync {
    fn on_start(&self) -> Result<()> {
        #[cfg(debug_assertions)]
        self.check_device_binding();

        // Wait for updated parameters from the parent.
        if let Some(parent) = &self.parent {
            let sender = self.mailbox.pop();
            assert_eq!(sender, parent.rank, "unexpected sender while waiting for parent");
        }

        // Push the fresh parameters down, deepest-registered child first.
        let children = self.children.lock().unwrap();
        for child in children.iter().rev() {
            self.runtime.copy_async(&self.data, &child.data, self.size)?;
            self.runtime.synchronize()?;
            child.mailbox.push(self.rank);
        }
        Ok(())
    }

    fn on_gradients_ready(&self) -> Result<()> {
        #[cfg(debug_assertions)]
        self.check_device_binding();

        // Sum child gradients as they arrive.
        let children = self.children.lock().unwrap();
        for _ in 0..children.len() {
            let sender = self.mailbox.pop();
            let child = children
                .iter()
                .find(|c| c.rank == sender)
                .expect("mailbox sender is not a child of this replica");
            self.runtime
                .add_assign(&child.parent_grads, &self.diff, self.size)?;
        }

        if let Some(parent) = &self.parent {
            // Stage the subtree sum on the parent's device, then notify.
            self.runtime.copy_async(&self.diff, &parent.grads, self.size)?;
            self.runtime.synchronize()?;
            parent.mailbox.push(self.rank);
        } else {
            // Loss functions average over the per-replica mini-batch, so
            // the root compensates for the split batch before the update.
            self.runtime
                .scale(1.0 / self.replica_count as f32, &self.diff)?;
        }
        Ok(())
    }
}

impl Drop for ReplicaSync {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.take() {
            if let Err(e) = self.runtime.free(parent.grads) {
                log::warn!(
                    "failed to release gradient staging buffer on device {}: {}",
                    parent.device,
                    e
                );
            }
        }
    }
}

/// One replica of the training driver, bound to one device.
///
/// The root replica runs on the coordinator's calling thread and keeps its
/// driver outside this struct; non-root replicas own their forked driver
/// and are moved onto a worker thread for the duration of the run.
pub struct Replica {
    sync: Arc<ReplicaSync>,
    buffers: ReplicaBuffers,
    driver: Option<Box<dyn Driver>>,
    initial_iter: usize,
}

impl Replica {
    /// Build the root replica around the caller's driver.
    pub(crate) fn new_root(
        runtime: &Arc<dyn AcceleratorRuntime>,
        replica_count: usize,
        driver: &mut dyn Driver,
    ) -> Result<Replica> {
        let device = driver.params().device_id;
        let initial_iter = driver.iter();
        let _bind = DeviceGuard::new(runtime.as_ref(), device)?;

        let buffers = ReplicaBuffers::new(runtime, driver.learnable_params(), device)?;
        buffers.configure(driver.learnable_params())?;

        let sync = ReplicaSync::new(runtime.clone(), 0, replica_count, &buffers, None)?;
        driver.add_callback(sync.clone());

        Ok(Replica { sync, buffers, driver: None, initial_iter })
    }

    /// Build a non-root replica from a forked driver and hang it under
    /// `parent`. `root_tensors` provides the initial parameter values.
    pub(crate) fn new_worker(
        runtime: &Arc<dyn AcceleratorRuntime>,
        rank: usize,
        replica_count: usize,
        parent: &Arc<ReplicaSync>,
        root_tensors: &mut [ParamTensor],
        mut driver: Box<dyn Driver>,
    ) -> Result<Replica> {
        let device = driver.params().device_id;
        let initial_iter = driver.iter();
        let _bind = DeviceGuard::new(runtime.as_ref(), device)?;

        let buffers = ReplicaBuffers::new(runtime, root_tensors, device)?;
        buffers.configure(driver.learnable_params())?;
        driver.set_root(false);

        let sync = ReplicaSync::new(runtime.clone(), rank, replica_count, &buffers, Some(parent))?;
        driver.add_callback(sync.clone());
        parent.adopt(&sync);

        Ok(Replica {
            sync,
            buffers,
            driver: Some(driver),
            initial_iter,
        })
    }

    pub(crate) fn sync(&self) -> &Arc<ReplicaSync> {
        &self.sync
    }

    pub(crate) fn buffers(&self) -> &ReplicaBuffers {
        &self.buffers
    }

    /// Worker thread entry: bind the thread to this replica's device,
    /// decorrelate the driver's RNG, and run out the iteration budget.
    /// The driver's step loop fires the hooks that keep the tree in sync.
    ///
    /// Takes `&mut self` so the replica (and with it the buffers its
    /// parent still reads from) survives until the coordinator has joined
    /// every thread.
    pub(crate) fn run_worker(&mut self) -> Result<()> {
        let driver = self
            .driver
            .as_mut()
            .expect("the root replica runs on the coordinator's thread");
        self.sync.runtime.set_device(self.sync.device)?;
        driver.set_root(false);

        if let Some(seed) = driver.params().random_seed {
            // Identical seeds across replicas destabilize training, so
            // modulate by device id - still deterministic per device.
            driver.reseed(seed + self.sync.device as u64);
        }

        let remaining = driver.params().max_iter.saturating_sub(self.initial_iter);
        driver.step(remaining)
    }
}
