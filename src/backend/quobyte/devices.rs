//! Device aggregation & node ranking.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::Node;

use crate::backend::quobyte::layout::Segment;
use crate::error::ScheduleError;

/// A physical storage device holding some of the pod's data.
///
/// One instance exists per unique device ID per scheduling decision. The `host` field
/// starts empty, is filled by the storage API resolution step, and may then be rewritten
/// to a physical node address when the storage system runs in-cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Device {
    pub id: u64,
    pub host: String,
    pub data_size: u64,
    pub device_type: String,
}

/// Reduce the given segments into one device per referenced device ID.
///
/// Every stripe referencing a device contributes that segment's length to the device's
/// `data_size`, across all files of the request. Stripes are not deduplicated by version,
/// so overlapping stripe versions sharing a device are summed as if distinct. The second
/// return value is the device-ID list in first-seen order, for the batched resolution call.
pub fn aggregate_segments(segments: &[Segment]) -> (BTreeMap<u64, Device>, Vec<u64>) {
    let mut devices: BTreeMap<u64, Device> = BTreeMap::new();
    let mut request_ids = vec![];
    for segment in segments {
        for &device_id in &segment.stripe.device_ids {
            match devices.get_mut(&device_id) {
                Some(device) => device.data_size += segment.length,
                None => {
                    devices.insert(
                        device_id,
                        Device {
                            id: device_id,
                            data_size: segment.length,
                            ..Default::default()
                        },
                    );
                    request_ids.push(device_id);
                }
            }
        }
    }
    (devices, request_ids)
}

/// Rewrite device hosts which are storage pod addresses to their node's address.
///
/// Devices whose host has no entry in the table are left untouched, as are unresolved
/// devices with an empty host.
pub fn remap_device_hosts(devices: &mut BTreeMap<u64, Device>, table: &HashMap<String, String>) {
    for device in devices.values_mut() {
        if let Some(node_addr) = table.get(&device.host) {
            tracing::debug!(device = device.id, pod_addr = %device.host, node_addr = %node_addr, "remapping device host to node address");
            device.host = node_addr.clone();
        }
    }
}

/// Pick the candidate node holding the most bytes of the pod's data.
///
/// Builds a lookup from every candidate node address to its node, accumulates `data_size`
/// per matched address, and returns the node behind the strictly largest total. Equal
/// totals break to the lexicographically smallest address. The returned node is always a
/// member of `nodes`; zero matches is an error so the caller can apply its fallback policy.
pub fn rank_nodes<'a, I>(devices: I, nodes: &[Node]) -> Result<Node, ScheduleError>
where
    I: IntoIterator<Item = &'a Device>,
{
    let mut nodes_by_addr: HashMap<&str, usize> = HashMap::new();
    for (idx, node) in nodes.iter().enumerate() {
        let addresses = node
            .status
            .as_ref()
            .and_then(|status| status.addresses.as_ref())
            .map(|addresses| addresses.as_slice())
            .unwrap_or_default();
        for addr in addresses {
            nodes_by_addr.insert(addr.address.as_str(), idx);
        }
    }

    let mut totals: BTreeMap<&str, u64> = BTreeMap::new();
    for device in devices {
        if device.host.is_empty() {
            // Location unknown, never matches a candidate.
            continue;
        }
        if let Some((addr, _)) = nodes_by_addr.get_key_value(device.host.as_str()) {
            *totals.entry(addr).or_default() += device.data_size;
        }
    }

    // The totals map iterates in ascending address order and the winner is replaced only on
    // a strictly larger total, so ties keep the lexicographically smallest address.
    let mut best: Option<(&str, u64)> = None;
    for (addr, total) in &totals {
        if best.map(|(_, best_total)| *total > best_total).unwrap_or(true) {
            best = Some((addr, *total));
        }
    }
    let (addr, total) = best.ok_or(ScheduleError::NoLocalDevices)?;
    tracing::debug!(address = %addr, bytes = total, "ranked best-fitting node");
    Ok(nodes[nodes_by_addr[addr]].clone())
}
