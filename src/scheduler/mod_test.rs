use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use k8s_openapi::api::core::v1::{Node, Pod};

use super::{choose_fallback, Dispatcher};
use crate::backend::DataBackend;
use crate::error::ScheduleError;
use crate::fixtures;
use crate::k8s::ClusterApi;

/// An in-memory cluster recording every decision driven through it.
#[derive(Clone)]
struct RecordingCluster {
    inner: Arc<ClusterState>,
}

#[derive(Default)]
struct ClusterState {
    nodes: Vec<Node>,
    /// The fit timestamp of the decision currently in flight.
    decision_start: Mutex<Option<Instant>>,
    /// The fit-through-bind span of every committed decision.
    commits: Mutex<Vec<(Instant, Instant)>>,
    /// The node names bound, in bind order.
    binds: Mutex<Vec<String>>,
    /// The reasons of every event posted.
    events: Mutex<Vec<String>>,
}

impl RecordingCluster {
    fn new(nodes: Vec<Node>) -> Self {
        Self {
            inner: Arc::new(ClusterState {
                nodes,
                ..Default::default()
            }),
        }
    }
}

impl ClusterApi for RecordingCluster {
    async fn fit(&self, _pod: &Pod) -> Result<Vec<Node>> {
        *self.inner.decision_start.lock().unwrap() = Some(Instant::now());
        Ok(self.inner.nodes.clone())
    }

    async fn bind(&self, _pod: &Pod, node: &Node) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        let start = self.inner.decision_start.lock().unwrap().take().expect("bind without a preceding fit");
        self.inner.commits.lock().unwrap().push((start, Instant::now()));
        self.inner.binds.lock().unwrap().push(node.metadata.name.clone().unwrap_or_default());
        Ok(())
    }

    async fn post_event(&self, _pod: &Pod, _message: &str, reason: &str, _type_: &str) -> Result<()> {
        self.inner.events.lock().unwrap().push(reason.into());
        Ok(())
    }
}

/// A backend which always picks the first candidate, or always fails.
struct StaticBackend {
    fail: bool,
}

impl DataBackend for StaticBackend {
    async fn best_node(&self, nodes: &[Node], _pod: &Pod) -> std::result::Result<Node, ScheduleError> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        if self.fail {
            return Err(ScheduleError::NoDevices);
        }
        Ok(nodes[0].clone())
    }
}

fn candidate_nodes() -> Vec<Node> {
    vec![
        fixtures::node("node-a", &["192.168.0.1"]),
        fixtures::node("node-b", &["192.168.0.2"]),
        fixtures::node("node-c", &["192.168.0.3"]),
    ]
}

#[tokio::test]
async fn concurrent_decisions_never_overlap_their_commits() {
    let cluster = RecordingCluster::new(candidate_nodes());
    let dispatcher = Arc::new(Dispatcher::new(cluster.clone(), Arc::new(StaticBackend { fail: false })));

    let mut handles = vec![];
    for task in 0..2 {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            for idx in 0..3 {
                let pod = fixtures::pod(&format!("app-{}-{}", task, idx));
                dispatcher.dispatch(&pod).await.expect("error dispatching pod");
            }
        }));
    }
    for handle in handles {
        handle.await.expect("error joining test task");
    }

    let commits = cluster.inner.commits.lock().unwrap();
    assert_eq!(commits.len(), 6, "unexpected commit count, got {}, expected {}", commits.len(), 6);
    for (idx, (start_a, end_a)) in commits.iter().enumerate() {
        for (start_b, end_b) in commits.iter().skip(idx + 1) {
            let overlaps = start_a < end_b && start_b < end_a;
            assert!(!overlaps, "decisions overlapped their commits: {:?}-{:?} and {:?}-{:?}", start_a, end_a, start_b, end_b);
        }
    }
}

#[tokio::test]
async fn failing_backend_still_binds_a_candidate() {
    let cluster = RecordingCluster::new(candidate_nodes());
    let dispatcher = Dispatcher::new(cluster.clone(), Arc::new(StaticBackend { fail: true }));

    dispatcher
        .dispatch(&fixtures::pod("app-0"))
        .await
        .expect("expected the fallback to complete the bind");

    let binds = cluster.inner.binds.lock().unwrap();
    assert_eq!(binds.len(), 1, "unexpected bind count, got {}, expected {}", binds.len(), 1);
    let candidates: HashSet<String> = candidate_nodes()
        .iter()
        .map(|node| node.metadata.name.clone().unwrap_or_default())
        .collect();
    assert!(candidates.contains(&binds[0]), "fallback bound a non-candidate node {}", binds[0]);
    let events = cluster.inner.events.lock().unwrap();
    assert_eq!(events.as_slice(), ["SchedulingFallback"], "unexpected events, got {:?}", events);
}

#[tokio::test]
async fn pod_without_candidates_is_left_unscheduled() {
    let cluster = RecordingCluster::new(vec![]);
    let dispatcher = Dispatcher::new(cluster.clone(), Arc::new(StaticBackend { fail: false }));

    dispatcher
        .dispatch(&fixtures::pod("app-0"))
        .await
        .expect("expected an empty candidate list to be non-fatal");

    let binds = cluster.inner.binds.lock().unwrap();
    assert!(binds.is_empty(), "expected no bind without candidates, got {:?}", binds);
}

#[test]
fn fallback_choice_is_always_a_candidate() {
    let nodes = candidate_nodes();
    let candidates: HashSet<_> = nodes.iter().map(|node| node.metadata.name.clone()).collect();

    for _ in 0..50 {
        let node = choose_fallback(&nodes);
        assert!(candidates.contains(&node.metadata.name), "fallback chose a non-candidate node {:?}", node.metadata.name);
    }
}

#[test]
fn fallback_on_single_candidate_is_that_candidate() {
    let nodes = vec![fixtures::node("node-a", &["192.168.0.1"])];
    let node = choose_fallback(&nodes);
    assert_eq!(node.metadata.name.as_deref(), Some("node-a"), "unexpected fallback node, got {:?}", node.metadata.name);
}
