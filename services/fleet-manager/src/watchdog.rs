//! Reconciliation watchdog.
//!
//! Periodically correlates the containers each cloud reports against the
//! node registry:
//! - Containers labelled with this fleet's instance id but backing no live
//!   node are removed once they are older than the grace period
//! - Live nodes whose container has disappeared are reported, never
//!   terminated
//!
//! Nothing is carried between sweeps. A failure contacting one cloud is
//! logged and recorded without affecting the other clouds.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dockfleet_id::{CloudName, FleetInstanceId};
use dockfleet_reconcile::{
    classify_drift, ContainerNodeMap, CorrelationSkip, MappedContainer, StaleNode,
};
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cloud::Cloud;
use crate::connection::{ClientPool, PoolError};
use crate::labels;
use crate::node::{Node, NodeRegistry};
use crate::runtime::{ContainerRuntime, ListFilter, RuntimeError};
use crate::termination::stop_and_remove;

/// Source of wall-clock time for grace-period decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += to_chrono(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Watchdog configuration.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Time between sweeps.
    pub interval: Duration,

    /// Minimum age before an unmatched container counts as an orphan.
    pub grace: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            grace: Duration::from_secs(60),
        }
    }
}

/// Errors that abort the sweep of a single cloud.
#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("failed to list containers on {cloud}: {source}")]
    List {
        cloud: CloudName,
        #[source]
        source: RuntimeError,
    },

    #[error("no client for {cloud}: {source}")]
    Client {
        cloud: CloudName,
        #[source]
        source: PoolError,
    },
}

/// A container left out of the correlation map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedContainer {
    pub container_id: String,
    pub reason: CorrelationSkip,
}

/// What one sweep found on one cloud.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudSweep {
    /// Containers correlated with a node name.
    pub mapped: usize,

    /// Containers that could not be correlated and need manual cleanup.
    pub skipped: Vec<SkippedContainer>,

    /// Orphan containers removed by this sweep.
    pub removed: Vec<String>,

    /// Orphans whose removal failed; retried on the next sweep.
    pub removal_failures: Vec<String>,

    /// Unmatched containers still inside the grace period.
    pub in_grace: Vec<String>,

    /// Live nodes with no remote container.
    pub stale: Vec<StaleNode>,
}

/// Result of one sweep over every cloud.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub clouds: BTreeMap<CloudName, CloudSweep>,
    pub failures: BTreeMap<CloudName, String>,
}

impl SweepReport {
    pub fn cloud(&self, name: &str) -> Option<&CloudSweep> {
        self.clouds.iter().find(|(k, _)| k.as_str() == name).map(|(_, v)| v)
    }

    pub fn removed(&self) -> usize {
        self.clouds.values().map(|c| c.removed.len()).sum()
    }

    pub fn stale(&self) -> usize {
        self.clouds.values().map(|c| c.stale.len()).sum()
    }
}

/// Periodic drift detection and orphan cleanup.
pub struct ReconciliationWatchdog {
    owner: FleetInstanceId,
    clouds: Vec<Arc<Cloud>>,
    pool: Arc<ClientPool>,
    registry: Arc<dyn NodeRegistry>,
    clock: Arc<dyn Clock>,
    config: WatchdogConfig,
}

impl ReconciliationWatchdog {
    pub fn new(
        owner: FleetInstanceId,
        clouds: Vec<Arc<Cloud>>,
        pool: Arc<ClientPool>,
        registry: Arc<dyn NodeRegistry>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            owner,
            clouds,
            pool,
            registry,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run sweeps until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            grace_secs = self.config.grace.as_secs(),
            "Starting reconciliation watchdog"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        // The first tick completes immediately; the first sweep waits a full
        // period so startup provisioning is not raced.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep().await;
                    debug!(
                        removed = report.removed(),
                        stale = report.stale(),
                        failed_clouds = report.failures.len(),
                        "Sweep complete"
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Watchdog shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single sweep over every cloud.
    pub async fn sweep(&self) -> SweepReport {
        let nodes = self.registry.snapshot().await;
        let mut report = SweepReport::default();

        // Clouds are independent, so sweep them concurrently.
        let results = join_all(
            self.clouds
                .iter()
                .map(|cloud| self.sweep_cloud(cloud, &nodes)),
        )
        .await;

        for (cloud, result) in self.clouds.iter().zip(results) {
            match result {
                Ok(sweep) => {
                    report.clouds.insert(cloud.name.clone(), sweep);
                }
                Err(e) => {
                    error!(cloud = %cloud.name, error = %e, "Watchdog sweep failed for cloud");
                    report.failures.insert(cloud.name.clone(), e.to_string());
                }
            }
        }
        report
    }

    async fn sweep_cloud(
        &self,
        cloud: &Cloud,
        nodes: &BTreeMap<String, Node>,
    ) -> Result<CloudSweep, WatchdogError> {
        let runtime = self
            .pool
            .lease(&cloud.endpoint)
            .map_err(|source| WatchdogError::Client {
                cloud: cloud.name.clone(),
                source,
            })?;

        let mut sweep = CloudSweep::default();
        let (map, labels_by_container) = self.correlate(cloud, &*runtime, &mut sweep).await?;
        sweep.mapped = map.len();

        let live: BTreeMap<String, String> = nodes
            .values()
            .filter(|n| n.cloud == cloud.name && n.state.expects_container())
            .map(|n| (n.name.clone(), n.container_id.clone()))
            .collect();

        let drift = classify_drift(&map, &live, self.clock.now(), to_chrono(self.config.grace));

        for container in &drift.in_grace {
            debug!(
                cloud = %cloud.name,
                container_id = %container.container_id,
                node = %container.node_name,
                "Unmatched container inside grace period"
            );
            sweep.in_grace.push(container.container_id.clone());
        }

        for orphan in &drift.orphans {
            let remove_volumes = labels_by_container
                .get(&orphan.container_id)
                .is_some_and(labels::remove_volumes);
            let stop_timeout = cloud
                .templates
                .iter()
                .find(|t| {
                    labels_by_container
                        .get(&orphan.container_id)
                        .and_then(|l| l.get(labels::TEMPLATE))
                        .is_some_and(|name| name == t.name.as_str())
                })
                .map_or(Duration::from_secs(10), |t| t.stop_timeout);

            info!(
                cloud = %cloud.name,
                container_id = %orphan.container_id,
                node = %orphan.node_name,
                "Removing orphan container"
            );
            match stop_and_remove(&*runtime, &orphan.container_id, stop_timeout, remove_volumes)
                .await
            {
                Ok(_) => sweep.removed.push(orphan.container_id.clone()),
                Err(e) => {
                    error!(
                        cloud = %cloud.name,
                        container_id = %orphan.container_id,
                        error = %e,
                        "Failed to remove orphan container"
                    );
                    sweep.removal_failures.push(orphan.container_id.clone());
                }
            }
        }

        for stale in &drift.stale {
            warn!(
                cloud = %cloud.name,
                node = %stale.node_name,
                container_id = %stale.container_id,
                "Node has no container on the cloud, leaving it for manual review"
            );
        }
        sweep.stale = drift.stale;

        Ok(sweep)
    }

    /// List this fleet's containers for `cloud` and map them to node names.
    ///
    /// Several clouds may share one endpoint, so the list is narrowed to
    /// containers created for this cloud. Otherwise a sibling cloud's live
    /// containers would look like orphans here.
    async fn correlate(
        &self,
        cloud: &Cloud,
        runtime: &dyn ContainerRuntime,
        sweep: &mut CloudSweep,
    ) -> Result<(ContainerNodeMap, BTreeMap<String, BTreeMap<String, String>>), WatchdogError>
    {
        let filter = ListFilter::all()
            .label(labels::OWNER_INSTANCE_ID, self.owner.to_string())
            .label(labels::CLOUD, cloud.name.as_str());
        let containers = runtime
            .list(&filter)
            .await
            .map_err(|source| WatchdogError::List {
                cloud: cloud.name.clone(),
                source,
            })?;

        let mut map = ContainerNodeMap::new();
        let mut labels_by_container = BTreeMap::new();

        for summary in containers {
            let Some(status) = summary.status else {
                warn!(
                    cloud = %cloud.name,
                    container_id = %summary.id,
                    "Container has no status, skipping"
                );
                map.mark_skipped(summary.id.clone());
                sweep.skipped.push(SkippedContainer {
                    container_id: summary.id,
                    reason: CorrelationSkip::MissingStatus,
                });
                continue;
            };

            let details = match runtime.inspect(&summary.id).await {
                Ok(details) => details,
                Err(e) if e.is_not_found() => {
                    debug!(container_id = %summary.id, "Container vanished before inspect");
                    continue;
                }
                Err(e) => {
                    warn!(container_id = %summary.id, error = %e, "Failed to inspect container, skipping");
                    map.mark_skipped(summary.id);
                    continue;
                }
            };

            let Some(node_name) = details.labels.get(labels::NODE_NAME).cloned() else {
                warn!(
                    cloud = %cloud.name,
                    container_id = %summary.id,
                    "Container has no node name label, manual cleanup required"
                );
                map.mark_skipped(summary.id.clone());
                sweep.skipped.push(SkippedContainer {
                    container_id: summary.id,
                    reason: CorrelationSkip::MissingNodeName,
                });
                continue;
            };

            let mapped = MappedContainer {
                container_id: summary.id.clone(),
                node_name,
                status,
                created: summary.created,
            };
            if let Err(e) = map.register(mapped) {
                warn!(cloud = %cloud.name, error = %e, "Ignoring container in correlation map");
                continue;
            }
            labels_by_container.insert(summary.id, details.labels);
        }

        Ok((map, labels_by_container))
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX / 1_000))
}
