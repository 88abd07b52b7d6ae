//! Scheduler error abstractions.

use thiserror::Error;

/// A recoverable failure of the data-locality pipeline for a single pod.
///
/// None of these variants ever blocks a pod from being scheduled: the scheduling loop
/// records a warning event against the pod and falls back to a uniformly random choice
/// from the candidate node list.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The pod declares no storage-backed volume and no explicit target volume.
    #[error("no storage-backed volume found in the spec of pod {0}")]
    NoVolume(String),
    /// The explicitly annotated target volume is not declared by the pod spec.
    #[error("volume {0} is not declared by the pod spec")]
    UnknownVolume(String),
    /// The requested paths yielded no storage devices.
    #[error("no storage devices found for the requested paths")]
    NoDevices,
    /// No resolved device maps onto any candidate node's addresses.
    #[error("no devices with local data on any candidate node")]
    NoLocalDevices,
}
