//! Quobyte data-locality backend.
//!
//! The pipeline per pod: resolve the pod spec into a set of local file paths, read each
//! file's layout attribute and parse it into segments, reduce the segments into devices
//! with per-device byte totals, resolve the devices to host endpoints via the Quobyte API
//! (optionally remapping storage pod addresses to node addresses when the storage system
//! runs in-cluster), and rank the candidate nodes by local bytes. Every stage tolerates
//! partial failure by degrading its input rather than aborting the attempt.


mod api;
mod devices;
mod layout;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams};
use kube::client::Client;
use tokio::time::timeout;

use crate::backend::quobyte::api::QuobyteApi;
use crate::backend::quobyte::devices::{aggregate_segments, rank_nodes, remap_device_hosts, Device};
use crate::backend::quobyte::layout::{parse_layout, Segment};
use crate::backend::{DataBackend, LocalityRequest};
use crate::config::Config;
use crate::error::ScheduleError;
use crate::k8s;

/// The annotation carrying a comma-separated list of target files.
pub const ANNOTATION_FILES: &str = "scheduler.alpha.quobyte.com.data-aware/files";
/// The annotation carrying a target directory.
pub const ANNOTATION_DIR: &str = "scheduler.alpha.quobyte.com.data-aware/dir";
/// The annotation naming the target volume explicitly.
pub const ANNOTATION_VOLUME: &str = "scheduler.alpha.quobyte.com.data-aware/volume";
/// The annotation carrying a disk-type preference.
///
/// Accepted as a reserved extension point; not used in ranking yet.
pub const ANNOTATION_DISK_TYPE: &str = "scheduler.alpha.quobyte.com.data-aware/type";

/// The extended attribute holding a file's layout metadata.
const LAYOUT_XATTR: &str = "quobyte.info";
/// The label selector for the storage system's data pods.
const DATA_POD_SELECTOR: &str = "role=data";
/// The content-type filter used when resolving devices.
const DEVICE_CONTENT_TYPES: &[&str] = &["DATA"];
/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// The Quobyte implementation of the data backend seam.
pub struct QuobyteBackend {
    /// Quobyte management API client.
    api: QuobyteApi,
    /// The local mountpoint under which Quobyte volumes appear.
    mountpoint: PathBuf,
    /// The namespace in which the storage data pods run.
    namespace: String,
    /// Whether the storage system runs as pods inside this cluster.
    in_cluster: bool,
    /// K8s client, used for the pod-address table refresh.
    client: Client,
}

impl QuobyteBackend {
    /// Create a new instance.
    pub fn new(config: &Config, client: Client) -> Result<Self> {
        let api = QuobyteApi::new(&config.quobyte_api_url, &config.quobyte_api_user, &config.quobyte_api_password)
            .context("error building Quobyte API client")?;
        Ok(Self {
            api,
            mountpoint: PathBuf::from(&config.quobyte_mountpoint),
            namespace: config.quobyte_namespace.clone(),
            in_cluster: config.in_cluster,
            client,
        })
    }

    /// Build the pod-IP to node-IP table from the storage system's data pods.
    ///
    /// Rebuilt fresh for every scheduling attempt and passed into the remap step, so
    /// concurrent attempts never share mutable state. A failed refresh degrades to an
    /// empty table; device hosts then simply stay unmatched.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn data_pod_addresses(&self) -> HashMap<String, String> {
        if !self.in_cluster {
            return HashMap::new();
        }
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams {
            label_selector: Some(DATA_POD_SELECTOR.into()),
            ..Default::default()
        };
        let pods = match timeout(API_TIMEOUT, api.list(&params))
            .await
            .context("timeout while listing storage data pods")
            .and_then(|res| res.context("error listing storage data pods"))
        {
            Ok(pods) => pods,
            Err(err) => {
                tracing::error!(error = ?err, "error refreshing pod address table");
                return HashMap::new();
            }
        };
        pods.items
            .into_iter()
            .filter_map(|pod| {
                let status = pod.status?;
                Some((status.pod_ip?, status.host_ip?))
            })
            .collect()
    }

    /// Resolve device hosts & disk types with one batched API call.
    ///
    /// A failed call leaves every device unresolved; devices absent from a successful
    /// response keep an empty host. Both degrade to "no match on any candidate node".
    #[tracing::instrument(level = "debug", skip(self, devices))]
    async fn resolve_devices(&self, devices: &mut BTreeMap<u64, Device>, request_ids: &[u64]) {
        let entries = match self.api.get_device_list(request_ids, DEVICE_CONTENT_TYPES).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = ?err, "error resolving device endpoints, devices stay unresolved");
                return;
            }
        };
        for entry in entries {
            if let Some(device) = devices.get_mut(&entry.device_id) {
                device.host = entry.host_name;
                device.device_type = entry.detected_disk_type;
            }
        }
    }
}

impl DataBackend for QuobyteBackend {
    async fn best_node(&self, nodes: &[Node], pod: &Pod) -> Result<Node, ScheduleError> {
        tracing::debug!(pod = k8s::pod_name(pod), "finding best-fitting node for pod");
        let request = parse_pod_spec(&self.mountpoint, pod)?;

        // The address table and the device set are independent; fetch both concurrently
        // and join before remapping, which needs the two of them.
        let gather = tokio::task::spawn_blocking(move || gather_segments(&request));
        let (table, gather_res) = tokio::join!(self.data_pod_addresses(), gather);
        let segments = match gather_res {
            Ok(segments) => segments,
            Err(err) => {
                tracing::error!(error = ?err, "error joining segment gathering task");
                vec![]
            }
        };

        let (mut devices, request_ids) = aggregate_segments(&segments);
        if devices.is_empty() {
            return Err(ScheduleError::NoDevices);
        }
        self.resolve_devices(&mut devices, &request_ids).await;
        remap_device_hosts(&mut devices, &table);
        rank_nodes(devices.values(), nodes)
    }
}

/// Derive the placement request from the pod's annotations and volume spec.
///
/// An explicitly annotated volume must be declared by the pod; without the annotation the
/// pod's single Quobyte-backed volume is used. All file & directory entries are joined
/// under `{mountpoint}/{volume}/`.
pub(crate) fn parse_pod_spec(mountpoint: &Path, pod: &Pod) -> Result<LocalityRequest, ScheduleError> {
    let annotation = |key: &str| pod.metadata.annotations.as_ref().and_then(|annotations| annotations.get(key));
    let volumes = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map(|volumes| volumes.as_slice())
        .unwrap_or_default();

    let volume = match annotation(ANNOTATION_VOLUME) {
        Some(name) => {
            let declared = volumes
                .iter()
                .any(|vol| vol.quobyte.as_ref().map(|quobyte| &quobyte.volume == name).unwrap_or(false));
            if !declared {
                return Err(ScheduleError::UnknownVolume(name.clone()));
            }
            name.clone()
        }
        None => volumes
            .iter()
            .find_map(|vol| vol.quobyte.as_ref().map(|quobyte| quobyte.volume.clone()))
            .ok_or_else(|| ScheduleError::NoVolume(k8s::pod_name(pod).to_string()))?,
    };

    if let Some(disk_type) = annotation(ANNOTATION_DISK_TYPE) {
        tracing::debug!(%disk_type, "disk type preference noted but not applied");
    }

    let root = mountpoint.join(&volume);
    let files = annotation(ANNOTATION_FILES)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(|entry| root.join(entry.trim_start_matches('/')))
                .collect()
        })
        .unwrap_or_default();
    let dir = annotation(ANNOTATION_DIR).map(|entry| root.join(entry.trim_start_matches('/')));

    Ok(LocalityRequest { files, dir })
}

/// Read & parse the layout attribute of every requested file.
///
/// Blocking; run on the blocking thread pool. Files which cannot be read or parsed
/// contribute zero segments.
fn gather_segments(request: &LocalityRequest) -> Vec<Segment> {
    let mut files = request.files.clone();
    if let Some(dir) = &request.dir {
        files.extend(files_in_dir(dir));
    }
    let mut segments = vec![];
    for file in &files {
        tracing::debug!(file = %file.display(), "fetching layout attribute");
        match read_layout(file) {
            Ok(Some(raw)) => segments.extend(parse_layout(&raw)),
            Ok(None) => tracing::warn!(file = %file.display(), "file has no layout attribute"),
            Err(err) => tracing::warn!(error = ?err, file = %file.display(), "error fetching layout attribute, skipping file"),
        }
    }
    segments
}

fn read_layout(path: &Path) -> std::io::Result<Option<String>> {
    Ok(xattr::get(path, LAYOUT_XATTR)?.map(|raw| String::from_utf8_lossy(&raw).into_owned()))
}

/// The direct file children of the given directory; subdirectories are not expanded.
fn files_in_dir(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(error = ?err, dir = %dir.display(), "error reading directory, it contributes no files");
            return vec![];
        }
    };
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| !path.is_dir())
        .collect()
}
