//! Correlation primitives for the reconciliation watchdog.
//!
//! The watchdog compares two views of the world:
//!
//! - **Remote state**: containers the runtime reports, each carrying the
//!   node name it was created for.
//! - **Scheduler state**: nodes the registry believes are alive.
//!
//! This crate holds the pure part of that comparison. It performs no I/O,
//! so every decision is deterministic given the same inputs.
//!
//! # Invariants
//!
//! - A container id maps to at most one node name and vice versa
//! - Containers younger than the grace period are never classified as orphans
//! - Stale nodes are only ever reported; nothing here decides to remove them
//! - A node whose container exists but could not be correlated is not stale

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Correlation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Two containers claim the same node name.
    #[error("node '{node_name}' already mapped to container {existing}, refusing {duplicate}")]
    DuplicateNodeName {
        node_name: String,
        existing: String,
        duplicate: String,
    },

    /// The same container was registered twice.
    #[error("container {0} already mapped")]
    DuplicateContainer(String),
}

/// Why a remote container was left out of the correlation map.
///
/// These are warnings rather than errors: the container is skipped and an
/// operator has to clean it up by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationSkip {
    /// The runtime returned no status for the container.
    MissingStatus,

    /// The container carries no node-name label.
    MissingNodeName,
}

impl CorrelationSkip {
    /// Short machine-readable reason.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::MissingStatus => "missing_status",
            Self::MissingNodeName => "missing_node_name",
        }
    }
}

impl std::fmt::Display for CorrelationSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason_code())
    }
}

/// A remote container that was successfully correlated with a node name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedContainer {
    pub container_id: String,
    pub node_name: String,
    pub status: String,
    pub created: DateTime<Utc>,
}

impl MappedContainer {
    /// Returns true once the container is older than `grace`.
    pub fn is_past_grace(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        is_past_grace(self.created, now, grace)
    }
}

/// Returns true if something created at `created` is older than `grace`.
///
/// Timestamps in the future (clock skew between hosts) are treated as
/// brand new.
pub fn is_past_grace(created: DateTime<Utc>, now: DateTime<Utc>, grace: Duration) -> bool {
    now.signed_duration_since(created) > grace
}

/// Bidirectional container id ↔ node name map for one cloud.
///
/// Built fresh on every sweep and discarded afterwards.
#[derive(Debug, Default, Clone)]
pub struct ContainerNodeMap {
    by_container: BTreeMap<String, MappedContainer>,
    by_node: BTreeMap<String, String>,
    /// Containers that exist remotely but were left out of the map.
    skipped: BTreeSet<String>,
}

impl ContainerNodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a correlated container.
    pub fn register(&mut self, container: MappedContainer) -> Result<(), ReconcileError> {
        if self.by_container.contains_key(&container.container_id) {
            return Err(ReconcileError::DuplicateContainer(container.container_id));
        }
        if let Some(existing) = self.by_node.get(&container.node_name) {
            return Err(ReconcileError::DuplicateNodeName {
                node_name: container.node_name,
                existing: existing.clone(),
                duplicate: container.container_id,
            });
        }
        self.by_node
            .insert(container.node_name.clone(), container.container_id.clone());
        self.by_container
            .insert(container.container_id.clone(), container);
        Ok(())
    }

    /// Node name recorded for a container.
    pub fn node_name(&self, container_id: &str) -> Option<&str> {
        self.by_container
            .get(container_id)
            .map(|c| c.node_name.as_str())
    }

    /// Container id recorded for a node name.
    pub fn container_id(&self, node_name: &str) -> Option<&str> {
        self.by_node.get(node_name).map(String::as_str)
    }

    pub fn contains_container(&self, container_id: &str) -> bool {
        self.by_container.contains_key(container_id)
    }

    /// Record a container that exists but could not be correlated.
    pub fn mark_skipped(&mut self, container_id: impl Into<String>) {
        self.skipped.insert(container_id.into());
    }

    /// Returns true if the container was seen remotely, mapped or not.
    pub fn was_seen(&self, container_id: &str) -> bool {
        self.contains_container(container_id) || self.skipped.contains(container_id)
    }

    pub fn containers(&self) -> impl Iterator<Item = &MappedContainer> {
        self.by_container.values()
    }

    pub fn len(&self) -> usize {
        self.by_container.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_container.is_empty()
    }
}

/// A node the registry believes is alive but whose container is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleNode {
    pub node_name: String,
    pub container_id: String,
}

/// Result of comparing one cloud's map against the live node set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DriftReport {
    /// Containers with no live node, past the grace period. Safe to remove.
    pub orphans: Vec<MappedContainer>,

    /// Containers with no live node that are still within the grace period.
    /// Most likely a node that is being provisioned right now.
    pub in_grace: Vec<MappedContainer>,

    /// Live nodes whose container no longer exists remotely.
    pub stale: Vec<StaleNode>,
}

impl DriftReport {
    /// Returns true if the cloud has fully converged.
    pub fn is_converged(&self) -> bool {
        self.orphans.is_empty() && self.in_grace.is_empty() && self.stale.is_empty()
    }
}

/// Classify drift between the remote map and the live nodes of one cloud.
///
/// `live_nodes` maps node name to the container id the registry recorded
/// for it. Pass only nodes that belong to this cloud and are in a state
/// where a container is expected to exist.
pub fn classify_drift(
    map: &ContainerNodeMap,
    live_nodes: &BTreeMap<String, String>,
    now: DateTime<Utc>,
    grace: Duration,
) -> DriftReport {
    let mut report = DriftReport::default();

    for container in map.containers() {
        if live_nodes.contains_key(&container.node_name) {
            continue;
        }
        if container.is_past_grace(now, grace) {
            report.orphans.push(container.clone());
        } else {
            report.in_grace.push(container.clone());
        }
    }

    for (node_name, container_id) in live_nodes {
        if !map.was_seen(container_id) {
            report.stale.push(StaleNode {
                node_name: node_name.clone(),
                container_id: container_id.clone(),
            });
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn container(id: &str, node: &str, created: DateTime<Utc>) -> MappedContainer {
        MappedContainer {
            container_id: id.to_string(),
            node_name: node.to_string(),
            status: "running".to_string(),
            created,
        }
    }

    #[test]
    fn test_map_is_bidirectional() {
        let mut map = ContainerNodeMap::new();
        map.register(container("c1", "node-a", at(0))).unwrap();

        assert_eq!(map.node_name("c1"), Some("node-a"));
        assert_eq!(map.container_id("node-a"), Some("c1"));
        assert!(map.contains_container("c1"));
        assert_eq!(map.node_name("c2"), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_map_rejects_duplicate_node_name() {
        let mut map = ContainerNodeMap::new();
        map.register(container("c1", "node-a", at(0))).unwrap();

        let err = map.register(container("c2", "node-a", at(0))).unwrap_err();
        assert_eq!(
            err,
            ReconcileError::DuplicateNodeName {
                node_name: "node-a".to_string(),
                existing: "c1".to_string(),
                duplicate: "c2".to_string(),
            }
        );
        assert_eq!(map.container_id("node-a"), Some("c1"));
    }

    #[test]
    fn test_map_rejects_duplicate_container() {
        let mut map = ContainerNodeMap::new();
        map.register(container("c1", "node-a", at(0))).unwrap();
        assert!(matches!(
            map.register(container("c1", "node-b", at(0))),
            Err(ReconcileError::DuplicateContainer(_))
        ));
    }

    #[test]
    fn test_grace_boundary() {
        let grace = Duration::seconds(60);
        assert!(!is_past_grace(at(0), at(60), grace));
        assert!(is_past_grace(at(0), at(61), grace));
        // created in the future
        assert!(!is_past_grace(at(100), at(0), grace));
    }

    #[test]
    fn test_classify_orphans_respect_grace() {
        let mut map = ContainerNodeMap::new();
        map.register(container("old", "gone-node", at(0))).unwrap();
        map.register(container("new", "booting-node", at(100))).unwrap();
        map.register(container("live", "live-node", at(0))).unwrap();

        let live = BTreeMap::from([("live-node".to_string(), "live".to_string())]);
        let report = classify_drift(&map, &live, at(120), Duration::seconds(60));

        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].container_id, "old");
        assert_eq!(report.in_grace.len(), 1);
        assert_eq!(report.in_grace[0].container_id, "new");
        assert!(report.stale.is_empty());
    }

    #[test]
    fn test_classify_stale_nodes() {
        let map = ContainerNodeMap::new();
        let live = BTreeMap::from([("node-x".to_string(), "c-missing".to_string())]);

        let report = classify_drift(&map, &live, at(0), Duration::seconds(60));
        assert_eq!(
            report.stale,
            vec![StaleNode {
                node_name: "node-x".to_string(),
                container_id: "c-missing".to_string(),
            }]
        );
        assert!(report.orphans.is_empty());
        assert!(!report.is_converged());
    }

    #[test]
    fn test_skipped_container_does_not_make_node_stale() {
        let mut map = ContainerNodeMap::new();
        map.mark_skipped("c-unlabelled");
        let live = BTreeMap::from([
            ("node-x".to_string(), "c-unlabelled".to_string()),
            ("node-y".to_string(), "c-missing".to_string()),
        ]);

        let report = classify_drift(&map, &live, at(0), Duration::seconds(60));
        assert_eq!(report.stale.len(), 1);
        assert_eq!(report.stale[0].node_name, "node-y");
        assert!(map.was_seen("c-unlabelled"));
        assert!(!map.contains_container("c-unlabelled"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_converged_when_everything_matches() {
        let mut map = ContainerNodeMap::new();
        map.register(container("c1", "n1", at(0))).unwrap();
        let live = BTreeMap::from([("n1".to_string(), "c1".to_string())]);

        assert!(classify_drift(&map, &live, at(1000), Duration::seconds(60)).is_converged());
    }

    #[test]
    fn test_skip_reason_codes() {
        assert_eq!(CorrelationSkip::MissingStatus.reason_code(), "missing_status");
        assert_eq!(
            CorrelationSkip::MissingNodeName.to_string(),
            "missing_node_name"
        );
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn every_container_lands_in_exactly_one_bucket(
                ages in proptest::collection::vec(0i64..300, 0..20),
                live_mask in proptest::collection::vec(any::<bool>(), 20),
            ) {
                let mut map = ContainerNodeMap::new();
                let mut live = BTreeMap::new();
                for (i, age) in ages.iter().enumerate() {
                    let id = format!("c{i}");
                    let node = format!("n{i}");
                    map.register(container(&id, &node, at(300 - age))).unwrap();
                    if live_mask[i] {
                        live.insert(node, id);
                    }
                }

                let report = classify_drift(&map, &live, at(300), Duration::seconds(60));
                prop_assert_eq!(report.orphans.len() + report.in_grace.len() + live.len(), ages.len());
                prop_assert!(report.stale.is_empty());
                for orphan in &report.orphans {
                    prop_assert!(!live.contains_key(&orphan.node_name));
                }
            }
        }
    }
}
