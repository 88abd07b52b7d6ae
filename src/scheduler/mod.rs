//! The scheduling loop.
//!
//! Two drivers push pods into the same per-pod pipeline: an event path fed by a K8s watcher
//! over unscheduled pods, and a periodic sweep which re-lists everything still unscheduled
//! with the opt-in annotation, catching missed or failed events. Both drivers funnel every
//! pod through the dispatcher, whose single decision lock serializes the full decision —
//! candidate production through bind — so the event path and the sweep never race on
//! placement. Scheduling decisions are infrequent relative to lock hold time, so the lost
//! throughput is acceptable.
//!
//! No failure of the locality pipeline blocks a pod: the dispatcher posts a warning event
//! and binds to a uniformly random candidate instead. Only an empty candidate list leaves a
//! pod unscheduled, to be retried on the next sweep.

#[cfg(test)]
mod mod_test;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::Api;
use kube::client::Client;
use kube::runtime::watcher::{watcher, Event};
use rand::prelude::*;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use crate::backend::DataBackend;
use crate::config::Config;
use crate::k8s::{self, Cluster, ClusterApi};

/// The delay before an event-driven pod is processed, letting cluster API state settle.
const SETTLE_DELAY: Duration = Duration::from_secs(2);
/// The pause after an error on the pod watch stream.
const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// The scheduling loop driving locality-aware placement.
pub struct Scheduler<B: DataBackend> {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The serialized decision section shared by both drivers.
    dispatcher: Dispatcher<Cluster, B>,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl<B: DataBackend> Scheduler<B> {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, backend: Arc<B>, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            dispatcher: Dispatcher::new(Cluster::new(client.clone()), backend),
            client,
            config,
            shutdown: BroadcastStream::new(shutdown),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = watcher(api, k8s::unscheduled_pod_params());
        tokio::pin!(pods);
        let mut sweep = IntervalStream::new(tokio::time::interval(Duration::from_secs(self.config.sweep_interval_seconds)));

        tracing::info!("scheduling loop initialized");
        loop {
            tokio::select! {
                Some(pod_event_res) = pods.next() => match pod_event_res {
                    Ok(event) => self.handle_pod_event(event).await,
                    Err(err) => {
                        tracing::error!(error = ?err, "error from k8s pod watch stream");
                        // Stay responsive to shutdown while backing off; the sweep
                        // timer just fires late.
                        tokio::select! {
                            _ = tokio::time::sleep(WATCH_ERROR_BACKOFF) => (),
                            _ = self.shutdown.next() => break,
                        }
                    }
                },
                Some(_) = sweep.next() => self.sweep().await,
                _ = self.shutdown.next() => break,
            }
        }

        tracing::debug!("scheduling loop shutting down");
        Ok(())
    }

    /// Handle watcher events coming from K8s.
    #[tracing::instrument(level = "debug", skip(self, event))]
    async fn handle_pod_event(&mut self, event: Event<Pod>) {
        match event {
            Event::Applied(pod) => {
                if !(k8s::is_unscheduled(&pod) && k8s::is_opted_in(&pod)) {
                    return;
                }
                tokio::time::sleep(SETTLE_DELAY).await;
                if let Err(err) = self.dispatcher.dispatch(&pod).await {
                    tracing::error!(error = ?err, pod = k8s::pod_name(&pod), "error scheduling pod");
                }
            }
            Event::Deleted(_pod) => (),
            // The periodic sweep re-lists everything still unscheduled, so a watcher
            // restart needs no dedicated replay here.
            Event::Restarted(_pods) => tracing::debug!("pod watcher restarted"),
        }
    }

    /// Re-scan every still-unscheduled opted-in pod and drive each through the pipeline.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn sweep(&mut self) {
        let pods = match k8s::list_unscheduled_pods(&self.client).await {
            Ok(pods) => pods,
            Err(err) => {
                tracing::error!(error = ?err, "error listing unscheduled pods for sweep");
                return;
            }
        };
        for pod in pods {
            if let Err(err) = self.dispatcher.dispatch(&pod).await {
                tracing::error!(error = ?err, pod = k8s::pod_name(&pod), "error scheduling pod");
            }
        }
    }
}

/// The serialized decision section of the scheduling loop.
///
/// Generic over the cluster surface and the storage backend, so decisions can be driven
/// end to end against recording implementations.
pub(crate) struct Dispatcher<C: ClusterApi, B: DataBackend> {
    /// The cluster surface behind candidate production, events and the bind.
    cluster: C,
    /// The storage backend producing placement decisions.
    backend: Arc<B>,
    /// The lock serializing every placement decision across both drivers.
    decision_lock: Mutex<()>,
}

impl<C: ClusterApi, B: DataBackend> Dispatcher<C, B> {
    /// Create a new instance.
    pub(crate) fn new(cluster: C, backend: Arc<B>) -> Self {
        Self {
            cluster,
            backend,
            decision_lock: Mutex::new(()),
        }
    }

    /// Drive one pod through the full decision, holding the decision lock throughout.
    pub(crate) async fn dispatch(&self, pod: &Pod) -> Result<()> {
        let _guard = self.decision_lock.lock().await;
        self.schedule_pod(pod).await
    }

    /// Drive one pod through candidate production, locality ranking and bind.
    async fn schedule_pod(&self, pod: &Pod) -> Result<()> {
        let name = k8s::pod_name(pod);
        let nodes = self.cluster.fit(pod).await?;
        if nodes.is_empty() {
            // The FailedScheduling event was already posted; the next sweep retries.
            tracing::warn!(pod = %name, "pod does not fit on any node, leaving unscheduled");
            return Ok(());
        }

        let node = match self.backend.best_node(&nodes, pod).await {
            Ok(node) => node,
            Err(err) => {
                tracing::warn!(error = %err, pod = %name, "locality lookup failed, falling back to random placement");
                let message = format!("no data-locality placement possible ({}), falling back to a random node", err);
                if let Err(event_err) = self.cluster.post_event(pod, &message, "SchedulingFallback", "Warning").await {
                    tracing::error!(error = ?event_err, pod = %name, "error posting fallback event");
                }
                choose_fallback(&nodes).clone()
            }
        };
        self.cluster.bind(pod, &node).await
    }
}

/// Pick a node uniformly at random from the candidate list.
///
/// Panics on an empty slice; callers check for candidates first.
pub(crate) fn choose_fallback(nodes: &[Node]) -> &Node {
    let idx = rand::thread_rng().gen_range(0..nodes.len());
    &nodes[idx]
}
