#![allow(dead_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Node, NodeAddress, NodeStatus, Pod, PodSpec, QuobyteVolumeSource, ResourceRequirements, Volume};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// The length in bytes of every segment of the layout fixture below.
pub const SEGMENT_LENGTH: u64 = 10_737_418_240;

/// A captured layout attribute of a 40 GiB file striped over devices 3, 4, 5 and 10.
///
/// Every device is referenced by exactly 3 of the 4 stripes, so each aggregates to
/// `3 * SEGMENT_LENGTH` bytes.
pub const LAYOUT_FIXTURE: &str = r#"posix_attrs {
  owner: "root"
  group: "root"
  mode: 0644
  size: 42949672960
}
segment {
  start_offset: 0
  length: 10737418240
  stripe {
    version: 1
    device_id: 3
    device_id: 4
    device_id: 10
  }
}
segment {
  start_offset: 10737418240
  length: 10737418240
  stripe {
    version: 1
    device_id: 3
    device_id: 5
    device_id: 10
  }
}
segment {
  start_offset: 21474836480
  length: 10737418240
  stripe {
    version: 2
    device_id: 3
    device_id: 4
    device_id: 5
  }
}
segment {
  start_offset: 32212254720
  length: 10737418240
  stripe {
    version: 1
    device_id: 4
    device_id: 5
    device_id: 10
  }
}
"#;

/// Build a pod with the given name in the `default` namespace and an empty spec.
pub fn pod(name: &str) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.into());
    pod.metadata.namespace = Some("default".into());
    pod.spec = Some(PodSpec::default());
    pod
}

/// Add an annotation to the given pod.
pub fn annotate(mut pod: Pod, key: &str, val: &str) -> Pod {
    pod.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.into(), val.into());
    pod
}

/// Add a Quobyte-backed volume with the given volume name to the given pod.
pub fn with_quobyte_volume(mut pod: Pod, volume: &str) -> Pod {
    let vol = Volume {
        name: format!("{}-mount", volume),
        quobyte: Some(QuobyteVolumeSource {
            registry: "registry.quobyte:7861".into(),
            volume: volume.into(),
            ..Default::default()
        }),
        ..Default::default()
    };
    pod.spec
        .get_or_insert_with(Default::default)
        .volumes
        .get_or_insert_with(Default::default)
        .push(vol);
    pod
}

/// Add a container with the given resource requests to the given pod.
pub fn with_container_requests(mut pod: Pod, cpu: &str, memory: &str) -> Pod {
    let requests: BTreeMap<String, Quantity> = [
        ("cpu".to_string(), Quantity(cpu.into())),
        ("memory".to_string(), Quantity(memory.into())),
    ]
    .into_iter()
    .collect();
    let container = Container {
        name: "main".into(),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            ..Default::default()
        }),
        ..Default::default()
    };
    pod.spec.get_or_insert_with(Default::default).containers.push(container);
    pod
}

/// Build a node with the given name and internal addresses.
pub fn node(name: &str, addresses: &[&str]) -> Node {
    let mut node = Node::default();
    node.metadata.name = Some(name.into());
    node.status = Some(NodeStatus {
        addresses: Some(
            addresses
                .iter()
                .map(|addr| NodeAddress {
                    address: (*addr).into(),
                    type_: "InternalIP".into(),
                })
                .collect(),
        ),
        ..Default::default()
    });
    node
}

/// Build a node with the given allocatable CPU and memory quantities.
pub fn node_with_allocatable(name: &str, cpu: &str, memory: &str) -> Node {
    let mut node = node(name, &[]);
    let allocatable: BTreeMap<String, Quantity> = [
        ("cpu".to_string(), Quantity(cpu.into())),
        ("memory".to_string(), Quantity(memory.into())),
    ]
    .into_iter()
    .collect();
    node.status.get_or_insert_with(Default::default).allocatable = Some(allocatable);
    node
}
