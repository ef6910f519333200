//! Error types for provisioning.

use std::fmt;

use dockfleet_id::{CloudName, TemplateName};
use thiserror::Error;

use crate::cache::CacheError;
use crate::node::RegistryError;
use crate::runtime::RuntimeError;

/// Step of node creation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationStage {
    Create,
    Start,
}

impl fmt::Display for CreationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Start => f.write_str("start"),
        }
    }
}

/// Provisioning errors.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A cap would be breached. Soft: the engine moves on to the next
    /// template.
    #[error("{cloud}/{template} at capacity: {detail}")]
    CapacityExceeded {
        cloud: CloudName,
        template: TemplateName,
        detail: String,
    },

    /// The runtime could not be queried while making a capacity decision.
    #[error("failed to query cloud {cloud}: {source}")]
    RemoteQuery {
        cloud: CloudName,
        #[source]
        source: RuntimeError,
    },

    /// Creating or starting the container failed.
    #[error("node {node_name} failed to {stage}: {source}")]
    NodeCreation {
        node_name: String,
        stage: CreationStage,
        #[source]
        source: RuntimeError,
    },

    /// The node registry rejected the new node.
    #[error("node {node_name} could not be registered: {source}")]
    Registration {
        node_name: String,
        #[source]
        source: RegistryError,
    },

    /// The client pool protocol was violated.
    #[error("client pool error for cloud {cloud}: {source}")]
    ClientPool {
        cloud: CloudName,
        #[source]
        source: CacheError,
    },

    /// Stopping or removing a node's container failed.
    #[error("failed to terminate node {node_name}: {source}")]
    Termination {
        node_name: String,
        #[source]
        source: RuntimeError,
    },

    /// The creation task died before reporting a result.
    #[error("provisioning task for {node_name} was lost: {reason}")]
    WorkerLost { node_name: String, reason: String },

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("unknown cloud: {0}")]
    UnknownCloud(String),
}

impl ProvisionError {
    /// Short machine-readable reason.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::RemoteQuery { .. } => "remote_query",
            Self::NodeCreation { .. } => "node_creation",
            Self::Registration { .. } => "registration",
            Self::ClientPool { .. } => "client_pool",
            Self::Termination { .. } => "termination",
            Self::WorkerLost { .. } => "worker_lost",
            Self::UnknownNode(_) => "unknown_node",
            Self::UnknownCloud(_) => "unknown_cloud",
        }
    }

    /// Returns true for errors handled inside the provisioning loop.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}
