//! Reduction-tree topology planning.
//!
//! Maps a device list onto a binary in-tree that keeps expensive edges off
//! the interconnect where it can: devices sharing a multi-GPU board pair
//! first, then P2P-capable pairs, then whatever is left pairs by
//! adjacency. Each phase runs log2(remaining) halving passes; after all
//! three exactly one device remains and becomes the root.

use crate::error::Result;
use crate::runtime::AcceleratorRuntime;

/// Parent sentinel marking the root pair.
pub const ROOT_PARENT: i32 = -1;

/// One parent->child edge of the reduction tree. The root is encoded as
/// the pair `(-1, root_device)` at index 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevicePair {
    parent: i32,
    device: i32,
}

impl DevicePair {
    pub fn new(parent: i32, device: i32) -> Self {
        Self { parent, device }
    }

    pub fn parent(&self) -> i32 {
        self.parent
    }

    pub fn device(&self) -> i32 {
        self.device
    }
}

fn log2_ceil(n: usize) -> usize {
    if n <= 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()) as usize
    }
}

/// Pair devices for tree synchronization.
///
/// The output has one pair per input device, pair 0 is `(-1, root)`, and
/// non-root pairs are emitted in the order the coordinator should build
/// replicas (each pair's parent device appears earlier as a device, except
/// across phases - the coordinator sweeps to handle that).
pub fn compute_pairs(
    runtime: &dyn AcceleratorRuntime,
    devices: &[i32],
) -> Result<Vec<DevicePair>> {
    let mut remaining: Vec<i32> = devices.to_vec();
    let mut pairs: Vec<DevicePair> = Vec::with_capacity(devices.len());

    // Group devices by multi-GPU board. Skipped for devices whose runtime
    // does not report board membership.
    for _ in 0..log2_ceil(remaining.len()) {
        let mut i = 0;
        while i < remaining.len() {
            let mut j = i + 1;
            while j < remaining.len() {
                let a = runtime.board_group(remaining[i])?;
                let b = runtime.board_group(remaining[j])?;
                if let (Some(a), Some(b)) = (a, b) {
                    if a == b {
                        log::debug!("board pair: {}:{}", remaining[i], remaining[j]);
                        pairs.push(DevicePair::new(remaining[i], remaining[j]));
                        remaining.remove(j);
                        break;
                    }
                }
                j += 1;
            }
            i += 1;
        }
    }
    log::debug!("devices paired by board, remaining: {:?}", remaining);

    // Group by P2P accessibility.
    for _ in 0..log2_ceil(remaining.len()) {
        let mut i = 0;
        while i < remaining.len() {
            let mut j = i + 1;
            while j < remaining.len() {
                if runtime.can_access_peer(remaining[i], remaining[j])? {
                    log::debug!("p2p pair: {}:{}", remaining[i], remaining[j]);
                    pairs.push(DevicePair::new(remaining[i], remaining[j]));
                    remaining.remove(j);
                    break;
                }
                j += 1;
            }
            i += 1;
        }
    }
    log::debug!("devices paired by p2p access, remaining: {:?}", remaining);

    // Pair whatever is left by adjacency.
    for _ in 0..log2_ceil(remaining.len()) {
        let mut i = 0;
        while i + 1 < remaining.len() {
            log::debug!("remaining pair: {}:{}", remaining[i], remaining[i + 1]);
            pairs.push(DevicePair::new(remaining[i], remaining[i + 1]));
            remaining.remove(i + 1);
            i += 1;
        }
    }

    assert_eq!(
        remaining.len(),
        1,
        "pairing must reduce the device set to a single root"
    );
    pairs.insert(0, DevicePair::new(ROOT_PARENT, remaining[0]));

    assert_eq!(pairs.len(), devices.len(), "planner dropped a device");
    for i in 0..pairs.len() {
        assert_ne!(pairs[i].parent(), pairs[i].device(), "device paired with itself");
        for j in i + 1..pairs.len() {
            assert_ne!(
                pairs[i].device(),
                pairs[j].device(),
                "device appears in two pairs"
            );
        }
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::HostRuntime;
    use std::collections::HashSet;

    fn assert_well_formed(pairs: &[DevicePair], devices: &[i32]) {
        assert_eq!(pairs.len(), devices.len());
        assert_eq!(pairs[0].parent(), ROOT_PARENT);

        let emitted: HashSet<i32> = pairs.iter().map(|p| p.device()).collect();
        assert_eq!(emitted, devices.iter().copied().collect());

        // Every non-root parent is some pair's device, and every device
        // reaches the root by following parents.
        let root = pairs[0].device();
        for p in &pairs[1..] {
            assert!(emitted.contains(&p.parent()));
            let mut cur = p.device();
            for _ in 0..pairs.len() {
                if cur == root {
                    break;
                }
                cur = pairs
                    .iter()
                    .find(|q| q.device() == cur)
                    .map(|q| q.parent())
                    .unwrap();
            }
            assert_eq!(cur, root, "device {} does not reach the root", p.device());
        }
    }

    #[test]
    fn test_single_device() {
        let rt = HostRuntime::new(1);
        let pairs = compute_pairs(&rt, &[0]).unwrap();
        assert_eq!(pairs, vec![DevicePair::new(ROOT_PARENT, 0)]);
    }

    #[test]
    fn test_two_devices_p2p() {
        let rt = HostRuntime::new(2);
        let pairs = compute_pairs(&rt, &[0, 1]).unwrap();
        assert_eq!(
            pairs,
            vec![DevicePair::new(ROOT_PARENT, 0), DevicePair::new(0, 1)]
        );
    }

    #[test]
    fn test_all_peer_capable_counts() {
        for n in 1..=8 {
            let rt = HostRuntime::new(n);
            let devices: Vec<i32> = (0..n as i32).collect();
            let pairs = compute_pairs(&rt, &devices).unwrap();
            assert_well_formed(&pairs, &devices);
        }
    }

    #[test]
    fn test_partial_p2p_ring() {
        // 0<->1, 2<->3 and 0<->2 peer-capable, nothing else.
        let mut matrix = vec![vec![false; 4]; 4];
        for (a, b) in [(0usize, 1usize), (2, 3), (0, 2)] {
            matrix[a][b] = true;
            matrix[b][a] = true;
        }
        let rt = HostRuntime::new(4).with_peer_access(matrix);
        let devices = [0, 1, 2, 3];
        let pairs = compute_pairs(&rt, &devices).unwrap();
        assert_well_formed(&pairs, &devices);

        // First halving pass pairs 0:1 and 2:3; the second attaches 2 under 0.
        assert_eq!(pairs[0], DevicePair::new(ROOT_PARENT, 0));
        assert!(pairs.contains(&DevicePair::new(0, 1)));
        assert!(pairs.contains(&DevicePair::new(2, 3)));
        assert!(pairs.contains(&DevicePair::new(0, 2)));
    }

    #[test]
    fn test_no_p2p_falls_back_to_adjacency() {
        let rt = HostRuntime::new(3).without_peer_access();
        let devices = [0, 1, 2];
        let pairs = compute_pairs(&rt, &devices).unwrap();
        assert_well_formed(&pairs, &devices);
        assert_eq!(pairs[0], DevicePair::new(ROOT_PARENT, 0));
    }

    #[test]
    fn test_board_groups_pair_first() {
        // Devices 0/2 share a board, 1/3 share another; no p2p anywhere,
        // so phase 1 output determines the near-leaf edges.
        let rt = HostRuntime::new(4)
            .without_peer_access()
            .with_boards(vec![Some(0), Some(1), Some(0), Some(1)]);
        let devices = [0, 1, 2, 3];
        let pairs = compute_pairs(&rt, &devices).unwrap();
        assert_well_formed(&pairs, &devices);
        assert!(pairs.contains(&DevicePair::new(0, 2)));
        assert!(pairs.contains(&DevicePair::new(1, 3)));
    }

    #[test]
    fn test_devices_do_not_need_to_be_contiguous() {
        let rt = HostRuntime::new(8);
        let devices = [5, 1, 6];
        let pairs = compute_pairs(&rt, &devices).unwrap();
        assert_well_formed(&pairs, &devices);
        assert_eq!(pairs[0].device(), 5);
    }
}
