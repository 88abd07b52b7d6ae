//! Storage backend seam.
//!
//! A data backend answers exactly one question: given a pod and the candidate nodes which
//! passed generic resource-fit filtering, which node holds the most of the pod's data?
//! Additional storage systems are new implementations of this trait, not new scheduling logic.

pub mod quobyte;

use std::future::Future;
use std::path::PathBuf;

use k8s_openapi::api::core::v1::{Node, Pod};

use crate::error::ScheduleError;

/// A placement request derived once from a pod's annotations and volume spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalityRequest {
    /// The target files, as absolute paths under the backend's local mountpoint.
    pub files: Vec<PathBuf>,
    /// An optional target directory whose direct children are considered.
    pub dir: Option<PathBuf>,
}

/// A pluggable source of data-locality placement decisions.
pub trait DataBackend: Send + Sync + 'static {
    /// Choose the candidate node holding the most bytes of the given pod's data.
    ///
    /// The returned node is always a member of `nodes`. Any error is recoverable at the
    /// pod level and triggers the caller's fallback placement policy.
    fn best_node(&self, nodes: &[Node], pod: &Pod) -> impl Future<Output = Result<Node, ScheduleError>> + Send;
}
