//! Cluster API collaborators.
//!
//! Everything in this module talks to the Kubernetes API on behalf of the scheduling loop:
//! listing nodes and unscheduled pods, the generic resource-fit filter which produces the
//! candidate node list, the bind call which commits a placement decision, and event posting.
//! The locality pipeline itself never touches the cluster API directly.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Event, EventSource, Node, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, ListParams, PostParams};
use kube::client::Client;
use tokio::time::timeout;

/// The name under which this scheduler identifies itself.
pub const SCHEDULER_NAME: &str = "data-locality-scheduler";
/// The annotation by which pods opt into this scheduler.
pub const ANNOTATION_SCHEDULER_NAME: &str = "scheduler.alpha.kubernetes.io/name";

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// The cluster-facing surface of a scheduling decision.
///
/// The scheduling loop drives candidate production, event posting and the bind through
/// this trait, so decisions can be exercised against a recording implementation.
pub trait ClusterApi: Send + Sync + 'static {
    /// Produce the candidate node list for the given pod.
    fn fit(&self, pod: &Pod) -> impl Future<Output = Result<Vec<Node>>> + Send;
    /// Bind the given pod to the given node.
    fn bind(&self, pod: &Pod, node: &Node) -> impl Future<Output = Result<()>> + Send;
    /// Create an event recording a scheduling outcome for the given pod.
    fn post_event(&self, pod: &Pod, message: &str, reason: &str, type_: &str) -> impl Future<Output = Result<()>> + Send;
}

/// The live cluster behind the K8s API.
pub struct Cluster {
    client: Client,
}

impl Cluster {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ClusterApi for Cluster {
    async fn fit(&self, pod: &Pod) -> Result<Vec<Node>> {
        fit(&self.client, pod).await
    }

    async fn bind(&self, pod: &Pod, node: &Node) -> Result<()> {
        bind(&self.client, pod, node).await
    }

    async fn post_event(&self, pod: &Pod, message: &str, reason: &str, type_: &str) -> Result<()> {
        post_event(&self.client, pod, message, reason, type_).await
    }
}

/// Check whether the given pod has opted into this scheduler.
pub fn is_opted_in(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_SCHEDULER_NAME))
        .map(|val| val == SCHEDULER_NAME)
        .unwrap_or(false)
}

/// Check whether the given pod is still unscheduled.
pub fn is_unscheduled(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .map(|spec| spec.node_name.is_none())
        .unwrap_or(true)
}

/// The name of the given pod, or an empty string when unset.
pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

/// The namespace of the given pod, defaulting to `default`.
pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or("default")
}

/// List params selecting pods which have not been assigned to a node yet.
pub fn unscheduled_pod_params() -> ListParams {
    ListParams {
        field_selector: Some("spec.nodeName=".into()),
        ..Default::default()
    }
}

/// List all pods which are unscheduled and have opted into this scheduler.
pub async fn list_unscheduled_pods(client: &Client) -> Result<Vec<Pod>> {
    let api: Api<Pod> = Api::all(client.clone());
    let pods = timeout(API_TIMEOUT, api.list(&unscheduled_pod_params()))
        .await
        .context("timeout while listing unscheduled pods")?
        .context("error listing unscheduled pods")?;
    Ok(pods.items.into_iter().filter(|pod| is_opted_in(pod) && is_unscheduled(pod)).collect())
}

/// List all nodes of the cluster.
pub async fn list_nodes(client: &Client) -> Result<Vec<Node>> {
    let api: Api<Node> = Api::all(client.clone());
    let nodes = timeout(API_TIMEOUT, api.list(&ListParams::default()))
        .await
        .context("timeout while listing nodes")?
        .context("error listing nodes")?;
    Ok(nodes.items)
}

/// Produce the candidate node list for the given pod.
///
/// Nodes are filtered on allocatable CPU and memory against the sum of the pod's container
/// requests. When no node fits, a `FailedScheduling` warning event carrying the per-node
/// failures is posted and an empty list is returned; the pod is retried by the next sweep.
#[tracing::instrument(level = "debug", skip(client, pod), fields(pod = pod_name(pod)))]
pub async fn fit(client: &Client, pod: &Pod) -> Result<Vec<Node>> {
    let nodes = list_nodes(client).await?;
    let required = required_resources(pod);
    let (fit_nodes, failures) = allocatable_nodes(nodes, &required);
    if fit_nodes.is_empty() {
        let msg = format!("pod ({}) failed to fit in any node\n{}", pod_name(pod), failures.join("\n"));
        post_event(client, pod, &msg, "FailedScheduling", "Warning").await?;
    }
    Ok(fit_nodes)
}

/// The resources a pod requests, summed over its containers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

/// Sum the resource requests of all containers of the given pod.
pub fn required_resources(pod: &Pod) -> ResourceRequest {
    let mut required = ResourceRequest::default();
    let containers = pod.spec.as_ref().map(|spec| spec.containers.as_slice()).unwrap_or_default();
    for container in containers {
        let requests = match container.resources.as_ref().and_then(|resources| resources.requests.as_ref()) {
            Some(requests) => requests,
            None => continue,
        };
        for (name, quantity) in requests {
            match name.as_str() {
                "cpu" => required.cpu_millis += quantity_millis(quantity).unwrap_or(0),
                "memory" => required.memory_bytes += quantity_value(quantity).unwrap_or(0),
                _ => tracing::debug!(resource = %name, "ignoring unknown resource request"),
            }
        }
    }
    required
}

/// Filter the given nodes down to those with enough allocatable CPU and memory,
/// collecting a human-readable failure reason for every node which does not fit.
pub fn allocatable_nodes(nodes: Vec<Node>, required: &ResourceRequest) -> (Vec<Node>, Vec<String>) {
    let mut fit_nodes = Vec::with_capacity(nodes.len());
    let mut failures = vec![];
    for node in nodes {
        let name = node.metadata.name.clone().unwrap_or_default();
        let allocatable = node.status.as_ref().and_then(|status| status.allocatable.as_ref());
        if let Some(cpu) = allocatable.and_then(|resources| resources.get("cpu")) {
            let alloc_millis = quantity_millis(cpu).unwrap_or(i64::MAX);
            if alloc_millis < required.cpu_millis {
                failures.push(format!("fit failure on node ({}): requested {}m CPU, only {}m CPU allocatable", name, required.cpu_millis, alloc_millis));
                continue;
            }
        }
        if let Some(memory) = allocatable.and_then(|resources| resources.get("memory")) {
            let alloc_bytes = quantity_value(memory).unwrap_or(i64::MAX);
            if alloc_bytes < required.memory_bytes {
                failures.push(format!("fit failure on node ({}): requested {} memory, only {} memory allocatable", name, required.memory_bytes, alloc_bytes));
                continue;
            }
        }
        fit_nodes.push(node);
    }
    (fit_nodes, failures)
}

/// Parse the given quantity as a whole number of its base unit (bytes for memory).
pub fn quantity_value(quantity: &Quantity) -> Option<i64> {
    let raw = quantity.0.trim();
    if let Some(number) = raw.strip_suffix('m') {
        return parse_scaled(number, 1).map(|millis| millis / 1000);
    }
    for (suffix, multiplier) in QUANTITY_SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return parse_scaled(number, *multiplier);
        }
    }
    parse_scaled(raw, 1)
}

/// Parse the given quantity as milli-units, the granularity used for CPU comparison.
pub fn quantity_millis(quantity: &Quantity) -> Option<i64> {
    let raw = quantity.0.trim();
    if let Some(number) = raw.strip_suffix('m') {
        return parse_scaled(number, 1);
    }
    for (suffix, multiplier) in QUANTITY_SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return parse_scaled(number, *multiplier)?.checked_mul(1000);
        }
    }
    parse_scaled(raw, 1000)
}

/// Multipliers of the quantity suffixes recognized here, `m` excepted.
///
/// Binary suffixes must come before their single-letter decimal counterparts so that
/// `strip_suffix` matches the longer form first.
const QUANTITY_SUFFIXES: &[(&str, i64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Scale the given decimal number by the multiplier.
///
/// Whole numbers stay in checked integer arithmetic, so large quantities keep full
/// precision and overflow reads as unparseable. Only fractional input (seen for CPU,
/// e.g. `2.5`) goes through `f64`.
fn parse_scaled(number: &str, multiplier: i64) -> Option<i64> {
    if let Ok(whole) = number.parse::<i64>() {
        return whole.checked_mul(multiplier);
    }
    number.parse::<f64>().ok().map(|val| (val * multiplier as f64) as i64)
}

/// Bind the given pod to the given node & post a `Scheduled` event on success.
#[tracing::instrument(level = "debug", skip(client, pod, node), fields(pod = pod_name(pod)))]
pub async fn bind(client: &Client, pod: &Pod, node: &Node) -> Result<()> {
    let name = pod_name(pod);
    let namespace = pod_namespace(pod);
    let node_name = node.metadata.name.as_deref().unwrap_or_default();
    tracing::info!(pod = %name, node = %node_name, "binding pod");

    // The typed Api surface has no binding subresource, so POST the Binding directly.
    let binding = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Binding",
        "metadata": { "name": name, "namespace": namespace },
        "target": { "apiVersion": "v1", "kind": "Node", "name": node_name },
    });
    let req = http::Request::builder()
        .method(http::Method::POST)
        .uri(format!("/api/v1/namespaces/{}/pods/{}/binding", namespace, name))
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(&binding).context("error serializing binding")?)
        .context("error building binding request")?;
    let _res: serde_json::Value = timeout(API_TIMEOUT, client.request(req))
        .await
        .context("timeout while binding pod")?
        .context("error binding pod")?;

    post_event(client, pod, &format!("Successfully assigned {} to {}", name, node_name), "Scheduled", "Normal").await
}

/// Create an event recording a scheduling outcome for the given pod.
#[tracing::instrument(level = "debug", skip(client, pod, message), fields(pod = pod_name(pod)))]
pub async fn post_event(client: &Client, pod: &Pod, message: &str, reason: &str, type_: &str) -> Result<()> {
    let namespace = pod_namespace(pod);
    let now = Time(chrono::Utc::now());
    let event = Event {
        count: Some(1),
        message: Some(message.into()),
        reason: Some(reason.into()),
        type_: Some(type_.into()),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        source: Some(EventSource {
            component: Some(SCHEDULER_NAME.into()),
            ..Default::default()
        }),
        involved_object: ObjectReference {
            kind: Some("Pod".into()),
            name: pod.metadata.name.clone(),
            namespace: pod.metadata.namespace.clone(),
            uid: pod.metadata.uid.clone(),
            ..Default::default()
        },
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", pod_name(pod))),
            namespace: Some(namespace.into()),
            ..Default::default()
        },
        ..Default::default()
    };
    let api: Api<Event> = Api::namespaced(client.clone(), namespace);
    timeout(API_TIMEOUT, api.create(&PostParams::default(), &event))
        .await
        .context("timeout while creating event")?
        .context("error creating event")?;
    Ok(())
}
