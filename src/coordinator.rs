//! Tree construction and run orchestration.
//!
//! `run` plans the device pairing, builds every replica with its parent
//! already in place (sweeping because the pair list is not necessarily in
//! parent-before-child order), starts one worker thread per non-root
//! replica, and runs the root driver on the calling thread so the caller
//! observes training progress directly. Workers are joined after the root
//! returns; the implicit per-step barrier of the mailbox protocol keeps
//! everything aligned until then.

use std::collections::HashSet;
use std::thread;

use std::sync::Arc;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::replica::Replica;
use crate::runtime::AcceleratorRuntime;
use crate::topology::{compute_pairs, DevicePair};

fn validate_devices(runtime: &dyn AcceleratorRuntime, devices: &[i32]) -> Result<()> {
    if devices.is_empty() {
        return Err(Error::Config("empty device list".to_string()));
    }
    let available = runtime.device_count()?;
    let mut seen = HashSet::new();
    for &device in devices {
        if device < 0 || device as usize >= available {
            return Err(Error::Config(format!(
                "device {} out of range (runtime has {} devices)",
                device, available
            )));
        }
        if !seen.insert(device) {
            return Err(Error::Config(format!("duplicate device {}", device)));
        }
    }
    if devices.len() == 1 {
        log::warn!("running the tree coordinator on a single device; the plain driver path would do");
    }
    Ok(())
}

fn format_pairs(pairs: &[DevicePair]) -> String {
    pairs[1..]
        .iter()
        .map(|p| format!("{}:{}", p.parent(), p.device()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Train `driver` synchronously across `devices`, the first of which hosts
/// the root replica. Returns when the root driver's `solve` has returned
/// and every worker thread has been joined; the driver's tensors then hold
/// the trained parameters in host storage.
pub fn run(
    runtime: Arc<dyn AcceleratorRuntime>,
    driver: &mut dyn Driver,
    devices: &[i32],
) -> Result<()> {
    validate_devices(runtime.as_ref(), devices)?;
    let replica_count = devices.len();

    driver.set_device_id(devices[0]);
    // The calling thread hosts the root replica.
    runtime.set_device(devices[0])?;

    let pairs = compute_pairs(runtime.as_ref(), devices)?;
    if replica_count > 1 {
        log::info!("device pairs {}", format_pairs(&pairs));
    }

    let root = Replica::new_root(&runtime, replica_count, driver)?;

    // Build the tree by finding each pair's parent among the replicas
    // constructed so far. Pairs whose parent is still missing are retried
    // on the next sweep; the planner guarantees this terminates.
    let mut slots: Vec<Option<Replica>> = Vec::new();
    slots.resize_with(replica_count, || None);

    for _attempt in 0..pairs.len() {
        for i in 1..pairs.len() {
            if slots[i].is_some() {
                continue;
            }
            let parent_device = pairs[i].parent();
            let parent = if root.sync().device() == parent_device {
                Some(root.sync().clone())
            } else {
                slots
                    .iter()
                    .flatten()
                    .find(|r| r.sync().device() == parent_device)
                    .map(|r| r.sync().clone())
            };
            let Some(parent) = parent else { continue };

            let mut worker_params = driver.params().clone();
            worker_params.device_id = pairs[i].device();
            let worker_driver = driver.fork(worker_params)?;
            let replica = Replica::new_worker(
                &runtime,
                i,
                replica_count,
                &parent,
                driver.learnable_params(),
                worker_driver,
            )?;
            slots[i] = Some(replica);
        }
    }
    for i in 1..pairs.len() {
        assert!(
            slots[i].is_some(),
            "planner emitted an unreachable parent for device {}",
            pairs[i].device()
        );
    }

    log::debug!("starting {} worker threads", replica_count - 1);
    let mut handles = Vec::with_capacity(replica_count - 1);
    for mut replica in slots.into_iter().flatten() {
        let name = format!("replica-{}", replica.sync().device());
        // The thread hands the replica back so no buffer is released while
        // a parent may still be reading from it; teardown happens on this
        // thread after every worker has been joined.
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let result = replica.run_worker();
                (replica, result)
            })
            .map_err(|e| Error::Runtime(format!("failed to spawn worker thread: {}", e)))?;
        handles.push(handle);
    }

    log::info!("starting optimization on {} device(s)", replica_count);
    let root_result = driver.solve();

    log::debug!("stopping {} worker threads", handles.len());
    let mut workers = Vec::with_capacity(handles.len());
    let mut worker_result: Result<()> = Ok(());
    for handle in handles {
        match handle.join() {
            Ok((replica, result)) => {
                workers.push(replica);
                if let Err(e) = result {
                    if worker_result.is_ok() {
                        worker_result = Err(e);
                    }
                }
            }
            // A worker panic is an invariant violation; re-raise it.
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
    root_result?;
    worker_result?;
    drop(workers);

    // Leave the trained parameters readable after the flat buffers are
    // released with the replicas.
    root.buffers().restore_host(driver.learnable_params())?;
    Ok(())
}
