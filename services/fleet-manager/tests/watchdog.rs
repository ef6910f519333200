//! Integration tests for the reconciliation watchdog.
//!
//! Nodes are provisioned through the engine, then drift is introduced by
//! hand (lost registrations, vanished containers, broken endpoints) and a
//! sweep is expected to repair or report it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dockfleet_id::FleetInstanceId;
use dockfleet_manager::config::FleetSpec;
use dockfleet_manager::runtime::{ContainerRuntime, RemoveOptions};
use dockfleet_manager::watchdog::ManualClock;
use dockfleet_manager::{
    CapacityTracker, ClientPool, Cloud, InMemoryNodeRegistry, LabelExpr, MockRuntime,
    NodeRegistry, ProvisionerConfig, ProvisioningEngine, ReconciliationWatchdog,
    StaticClientFactory, WatchdogConfig,
};

const GRACE: Duration = Duration::from_secs(60);

const FLEET: &str = r#"
[[cloud]]
name = "alpha"
uri = "tcp://alpha:2375"

[[cloud.template]]
name = "runner"
image = "runner:latest"
labels = "linux"

[[cloud]]
name = "beta"
uri = "tcp://beta:2375"

[[cloud.template]]
name = "runner"
image = "runner:latest"
labels = "linux"
"#;

struct Fleet {
    alpha: Arc<MockRuntime>,
    beta: Arc<MockRuntime>,
    clouds: Vec<Arc<Cloud>>,
    pool: Arc<ClientPool>,
    owner: FleetInstanceId,
    clock: Arc<ManualClock>,
}

impl Fleet {
    fn new() -> Self {
        let alpha = Arc::new(MockRuntime::new());
        let beta = Arc::new(MockRuntime::new());
        let factory = StaticClientFactory::new()
            .with("tcp://alpha:2375", alpha.clone())
            .with("tcp://beta:2375", beta.clone());
        let clouds = FleetSpec::from_toml_str(FLEET)
            .unwrap()
            .build()
            .into_iter()
            .map(Arc::new)
            .collect();

        Self {
            alpha,
            beta,
            clouds,
            pool: Arc::new(ClientPool::new(Arc::new(factory), Duration::from_secs(300))),
            owner: FleetInstanceId::new(),
            clock: Arc::new(ManualClock::new(Utc::now())),
        }
    }

    fn engine(&self, registry: Arc<InMemoryNodeRegistry>) -> ProvisioningEngine {
        ProvisioningEngine::new(
            self.owner,
            self.clouds.clone(),
            Arc::new(CapacityTracker::new()),
            self.pool.clone(),
            registry,
            ProvisionerConfig::default(),
        )
    }

    fn watchdog(&self, registry: Arc<InMemoryNodeRegistry>) -> ReconciliationWatchdog {
        ReconciliationWatchdog::new(
            self.owner,
            self.clouds.clone(),
            self.pool.clone(),
            registry,
            WatchdogConfig {
                interval: Duration::from_secs(300),
                grace: GRACE,
            },
        )
        .with_clock(self.clock.clone())
    }

    fn clock_after_grace(&self) {
        self.clock.advance(GRACE + Duration::from_secs(1));
    }
}

#[tokio::test]
async fn test_lost_registrations_become_orphans_after_grace() {
    let fleet = Fleet::new();
    let registry = Arc::new(InMemoryNodeRegistry::new());
    let engine = fleet.engine(registry.clone());

    for plan in engine
        .request_capacity(Some(&"linux".parse::<LabelExpr>().unwrap()), 2)
        .await
    {
        plan.resolve().await.unwrap();
    }
    assert_eq!(fleet.alpha.len(), 2);

    // A restart with the same instance id but an empty registry.
    let watchdog = fleet.watchdog(Arc::new(InMemoryNodeRegistry::new()));

    let report = watchdog.sweep().await;
    assert_eq!(report.removed(), 0);
    assert_eq!(report.cloud("alpha").unwrap().in_grace.len(), 2);

    fleet.clock_after_grace();
    let report = watchdog.sweep().await;
    assert_eq!(report.cloud("alpha").unwrap().removed.len(), 2);
    assert!(fleet.alpha.is_empty());
    assert_eq!(fleet.alpha.calls.remove.load(Ordering::SeqCst), 2);

    // Nothing left to do.
    let report = watchdog.sweep().await;
    assert_eq!(report.removed(), 0);
    assert_eq!(fleet.alpha.calls.remove.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_registered_nodes_are_left_alone() {
    let fleet = Fleet::new();
    let registry = Arc::new(InMemoryNodeRegistry::new());
    let engine = fleet.engine(registry.clone());

    let node = engine
        .request_capacity(None, 1)
        .await
        .into_iter()
        .next()
        .unwrap()
        .resolve()
        .await
        .unwrap();

    fleet.clock_after_grace();
    let report = fleet.watchdog(registry.clone()).sweep().await;

    let alpha = report.cloud("alpha").unwrap();
    assert_eq!(alpha.mapped, 1);
    assert!(alpha.removed.is_empty());
    assert!(alpha.stale.is_empty());
    assert!(fleet.alpha.get(&node.container_id).is_some());
}

#[tokio::test]
async fn test_vanished_container_reported_as_stale() {
    let fleet = Fleet::new();
    let registry = Arc::new(InMemoryNodeRegistry::new());
    let engine = fleet.engine(registry.clone());

    let node = engine
        .request_capacity(None, 1)
        .await
        .into_iter()
        .next()
        .unwrap()
        .resolve()
        .await
        .unwrap();

    // Someone removed the container behind the fleet manager's back.
    fleet
        .alpha
        .remove(
            &node.container_id,
            RemoveOptions {
                force: true,
                volumes: false,
            },
        )
        .await
        .unwrap();

    let report = fleet.watchdog(registry.clone()).sweep().await;
    let stale = &report.cloud("alpha").unwrap().stale;
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].node_name, node.name);

    // Flagged only: the node stays registered.
    assert!(registry.get(&node.name).await.is_some());
}

#[tokio::test]
async fn test_unreachable_cloud_does_not_block_others() {
    let fleet = Fleet::new();
    let registry = Arc::new(InMemoryNodeRegistry::new());
    let engine = fleet.engine(registry.clone());

    // One node on alpha, then one on beta while alpha is disabled.
    engine
        .request_capacity(None, 1)
        .await
        .into_iter()
        .next()
        .unwrap()
        .resolve()
        .await
        .unwrap();
    fleet.clouds[0].disabled.set_disabled_by_choice(true);
    engine
        .request_capacity(None, 1)
        .await
        .into_iter()
        .next()
        .unwrap()
        .resolve()
        .await
        .unwrap();
    assert_eq!(fleet.beta.len(), 1);

    fleet.alpha.set_fail_list(true);
    let watchdog = fleet.watchdog(Arc::new(InMemoryNodeRegistry::new()));
    fleet.clock_after_grace();
    let report = watchdog.sweep().await;

    assert!(report.failures.keys().any(|c| c.as_str() == "alpha"));
    assert_eq!(report.cloud("beta").unwrap().removed.len(), 1);
    assert!(fleet.beta.is_empty());
    assert_eq!(fleet.alpha.len(), 1);

    // Every lease was returned.
    assert_eq!(fleet.pool.counts().0, 0);
}

#[tokio::test]
async fn test_clouds_sharing_an_endpoint_keep_each_others_nodes() {
    let shared_fleet = r#"
[[cloud]]
name = "alpha"
uri = "tcp://shared:2375"

[[cloud.template]]
name = "runner"
image = "runner:latest"

[[cloud]]
name = "beta"
uri = "tcp://shared:2375"

[[cloud.template]]
name = "runner"
image = "runner:latest"
"#;
    let runtime = Arc::new(MockRuntime::new());
    let factory = StaticClientFactory::new().with("tcp://shared:2375", runtime.clone());
    let clouds: Vec<Arc<Cloud>> = FleetSpec::from_toml_str(shared_fleet)
        .unwrap()
        .build()
        .into_iter()
        .map(Arc::new)
        .collect();
    let pool = Arc::new(ClientPool::new(Arc::new(factory), Duration::from_secs(300)));
    let owner = FleetInstanceId::new();
    let registry = Arc::new(InMemoryNodeRegistry::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));

    let engine = ProvisioningEngine::new(
        owner,
        clouds.clone(),
        Arc::new(CapacityTracker::new()),
        pool.clone(),
        registry.clone(),
        ProvisionerConfig::default(),
    );
    let node = engine
        .request_capacity(None, 1)
        .await
        .into_iter()
        .next()
        .unwrap()
        .resolve()
        .await
        .unwrap();
    assert_eq!(node.cloud.as_str(), "alpha");

    let watchdog = ReconciliationWatchdog::new(
        owner,
        clouds,
        pool,
        registry.clone(),
        WatchdogConfig {
            interval: Duration::from_secs(300),
            grace: GRACE,
        },
    )
    .with_clock(clock.clone());
    clock.advance(Duration::from_secs(120));
    let report = watchdog.sweep().await;

    assert_eq!(report.removed(), 0);
    assert_eq!(report.cloud("alpha").unwrap().mapped, 1);
    assert_eq!(report.cloud("beta").unwrap().mapped, 0);
    assert!(report.cloud("alpha").unwrap().stale.is_empty());
    assert!(runtime.get(&node.container_id).unwrap().running);
    assert!(registry.get(&node.name).await.is_some());
}
