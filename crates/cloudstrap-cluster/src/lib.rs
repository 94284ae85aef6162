//! Cluster-manager collaborator for cloudstrap.
//!
//! The cluster manager is the system of record for deployed service units and
//! their live relations. This crate defines the narrow `ClusterManager`
//! interface the deployment queue drives, a `JujuClient` backed by the `juju`
//! command line, an in-memory `MockManager`, and the error classification
//! that separates "try again later" from "will never succeed".

pub mod juju;
pub mod manager;
pub mod mock;
pub mod status;

pub use juju::JujuClient;
pub use manager::{endpoint, ClusterManager, DeployOptions, Placement};
pub use mock::{ManagerCall, MockManager};
pub use status::{Relation, ServiceStatus};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    /// The request may succeed later: the peer is not deployed yet, the
    /// manager is busy, or the command could not reach it.
    #[error("cluster manager not ready: {0}")]
    NotReady(String),
    /// The manager refused the request and repeating it will not help.
    #[error("cluster manager rejected request: {0}")]
    Rejected(String),
    #[error("cluster manager I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse cluster status: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to render service config: {0}")]
    Config(#[from] serde_yaml::Error),
}

impl ManagerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ManagerError::NotReady(_) | ManagerError::Io(_))
    }
}
