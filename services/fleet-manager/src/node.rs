//! Provisioned nodes and the registry that tracks them.
//!
//! The registry is the scheduler's view of which nodes exist. The fleet
//! manager registers nodes it provisions and the watchdog reads a snapshot
//! of it on every sweep.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockfleet_id::{CloudName, NodeId, TemplateName};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::connector::Launcher;

/// Node lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Provisioning,
    Registered,
    Running,
    Terminating,
    Gone,
}

impl NodeState {
    /// Returns true if a backing container is expected to exist.
    pub fn expects_container(&self) -> bool {
        matches!(self, Self::Registered | Self::Running)
    }

    /// Returns true if `next` is a legal transition from this state.
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Provisioning, Registered)
                | (Provisioning, Gone)
                | (Registered, Running)
                | (Registered, Terminating)
                | (Running, Terminating)
                | (Terminating, Gone)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Registered => "registered",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Gone => "gone",
        };
        f.write_str(s)
    }
}

/// What the scheduler has run on a node so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeActivity {
    /// Executors currently running a task.
    pub busy_executors: u32,

    /// Tasks that ran to completion, successfully or not.
    pub completed_tasks: u32,

    /// When the node last became idle. `None` while busy.
    pub idle_since: Option<DateTime<Utc>>,
}

impl NodeActivity {
    /// Activity of a node that has not run anything since `at`.
    pub fn idle_since(at: DateTime<Utc>) -> Self {
        Self {
            busy_executors: 0,
            completed_tasks: 0,
            idle_since: Some(at),
        }
    }
}

/// A container-backed compute node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub cloud: CloudName,
    pub template: TemplateName,
    pub container_id: String,
    pub executors: u32,
    pub state: NodeState,
    pub launcher: Launcher,
    pub created_at: DateTime<Utc>,
    pub activity: NodeActivity,
}

/// Registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node {0} is already registered")]
    AlreadyRegistered(String),

    #[error("node {0} is not registered")]
    NotFound(String),

    #[error("node {name} cannot move from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: NodeState,
        to: NodeState,
    },

    #[error("node {0} has no task running")]
    NotBusy(String),
}

/// The scheduler's node registry.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Add a new node.
    async fn register(&self, node: Node) -> Result<(), RegistryError>;

    /// Move a node to a new lifecycle state.
    async fn update_state(&self, name: &str, state: NodeState) -> Result<(), RegistryError>;

    /// Remove a node, returning it.
    async fn remove(&self, name: &str) -> Result<Node, RegistryError>;

    /// An executor on the node picked up a task.
    async fn task_started(&self, name: &str) -> Result<(), RegistryError>;

    /// A task on the node finished at `at`.
    async fn task_finished(&self, name: &str, at: DateTime<Utc>) -> Result<(), RegistryError>;

    /// Look up a node by name.
    async fn get(&self, name: &str) -> Option<Node>;

    /// All nodes, keyed by name.
    async fn snapshot(&self) -> BTreeMap<String, Node>;
}

/// Registry held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryNodeRegistry {
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl InMemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

#[async_trait]
impl NodeRegistry for InMemoryNodeRegistry {
    async fn register(&self, node: Node) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.name) {
            return Err(RegistryError::AlreadyRegistered(node.name));
        }
        debug!(node = %node.name, cloud = %node.cloud, container_id = %node.container_id, "Registered node");
        nodes.insert(node.name.clone(), node);
        Ok(())
    }

    async fn update_state(&self, name: &str, state: NodeState) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if node.state == state {
            return Ok(());
        }
        if !node.state.can_transition_to(state) {
            return Err(RegistryError::InvalidTransition {
                name: name.to_string(),
                from: node.state,
                to: state,
            });
        }
        debug!(node = %name, from = %node.state, to = %state, "Node state changed");
        node.state = state;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<Node, RegistryError> {
        self.nodes
            .write()
            .await
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    async fn task_started(&self, name: &str) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if node.state == NodeState::Registered {
            node.state = NodeState::Running;
        }
        node.activity.busy_executors += 1;
        node.activity.idle_since = None;
        Ok(())
    }

    async fn task_finished(&self, name: &str, at: DateTime<Utc>) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let activity = &mut node.activity;
        if activity.busy_executors == 0 {
            return Err(RegistryError::NotBusy(name.to_string()));
        }
        activity.busy_executors -= 1;
        activity.completed_tasks += 1;
        if activity.busy_executors == 0 {
            activity.idle_since = Some(at);
        }
        Ok(())
    }

    async fn get(&self, name: &str) -> Option<Node> {
        self.nodes.read().await.get(name).cloned()
    }

    async fn snapshot(&self) -> BTreeMap<String, Node> {
        self.nodes.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> Node {
        Node {
            id: NodeId::new(),
            name: name.to_string(),
            cloud: CloudName::parse("local").unwrap(),
            template: TemplateName::parse("jdk17").unwrap(),
            container_id: "abc".to_string(),
            executors: 1,
            state: NodeState::Registered,
            launcher: Launcher::Jnlp {
                node_name: name.to_string(),
            },
            created_at: Utc::now(),
            activity: NodeActivity::idle_since(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_register_and_snapshot() {
        let registry = InMemoryNodeRegistry::new();
        registry.register(node("n1")).await.unwrap();
        registry.register(node("n2")).await.unwrap();

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["n1", "n2"]);
        assert_eq!(
            registry.register(node("n1")).await,
            Err(RegistryError::AlreadyRegistered("n1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let registry = InMemoryNodeRegistry::new();
        registry.register(node("n1")).await.unwrap();

        registry.update_state("n1", NodeState::Running).await.unwrap();
        registry.update_state("n1", NodeState::Running).await.unwrap();
        assert!(matches!(
            registry.update_state("n1", NodeState::Provisioning).await,
            Err(RegistryError::InvalidTransition { .. })
        ));

        registry.update_state("n1", NodeState::Terminating).await.unwrap();
        registry.update_state("n1", NodeState::Gone).await.unwrap();
        assert_eq!(registry.get("n1").await.unwrap().state, NodeState::Gone);
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = InMemoryNodeRegistry::new();
        registry.register(node("n1")).await.unwrap();
        assert_eq!(registry.remove("n1").await.unwrap().name, "n1");
        assert!(registry.is_empty().await);
        assert!(registry.remove("n1").await.is_err());
    }

    #[tokio::test]
    async fn test_task_activity() {
        let registry = InMemoryNodeRegistry::new();
        let mut n = node("n1");
        n.executors = 2;
        registry.register(n).await.unwrap();

        registry.task_started("n1").await.unwrap();
        registry.task_started("n1").await.unwrap();
        let busy = registry.get("n1").await.unwrap();
        assert_eq!(busy.state, NodeState::Running);
        assert_eq!(busy.activity.busy_executors, 2);
        assert_eq!(busy.activity.idle_since, None);

        let done = Utc::now();
        registry.task_finished("n1", done).await.unwrap();
        assert_eq!(registry.get("n1").await.unwrap().activity.idle_since, None);
        registry.task_finished("n1", done).await.unwrap();

        let idle = registry.get("n1").await.unwrap().activity;
        assert_eq!(idle.completed_tasks, 2);
        assert_eq!(idle.idle_since, Some(done));
        assert_eq!(
            registry.task_finished("n1", done).await,
            Err(RegistryError::NotBusy("n1".to_string()))
        );
        assert!(registry.task_started("missing").await.is_err());
    }

    #[test]
    fn test_expects_container() {
        assert!(NodeState::Registered.expects_container());
        assert!(NodeState::Running.expects_container());
        assert!(!NodeState::Provisioning.expects_container());
        assert!(!NodeState::Terminating.expects_container());
        assert!(!NodeState::Gone.expects_container());
    }
}
