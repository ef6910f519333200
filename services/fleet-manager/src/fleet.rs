//! Fleet manager root: wires the shared services together.
//!
//! The capacity tracker, the client pool and the node registry are owned
//! here and injected into the provisioning engine, the watchdog and the
//! retention reaper.

use std::sync::Arc;
use std::time::Duration;

use dockfleet_id::{CloudName, FleetInstanceId, TemplateName};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::capacity::CapacityTracker;
use crate::cloud::Cloud;
use crate::config::{Config, FleetSpec};
use crate::connection::{ClientFactory, ClientPool, DockerClientFactory, StaticClientFactory};
use crate::node::{InMemoryNodeRegistry, NodeRegistry};
use crate::provisioner::{ProvisionerConfig, ProvisioningEngine};
use crate::retention::{RetentionConfig, RetentionReaper};
use crate::runtime::MockRuntime;
use crate::watchdog::{ReconciliationWatchdog, WatchdogConfig};

/// Tunables for the services owned by [`FleetManager`].
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub provisioner: ProvisionerConfig,
    pub watchdog: WatchdogConfig,
    pub retention: RetentionConfig,
    pub client_idle: Duration,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            provisioner: ProvisionerConfig::default(),
            watchdog: WatchdogConfig::default(),
            retention: RetentionConfig::default(),
            client_idle: Duration::from_secs(300),
        }
    }
}

impl From<&Config> for FleetSettings {
    fn from(config: &Config) -> Self {
        Self {
            provisioner: ProvisionerConfig {
                workers: config.provision_workers,
                disable_duration: config.disable_duration,
            },
            watchdog: WatchdogConfig {
                interval: config.watchdog_interval,
                grace: config.watchdog_grace,
            },
            retention: RetentionConfig {
                interval: config.retention_interval,
            },
            client_idle: config.client_idle,
        }
    }
}

/// Point-in-time view of one template.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateStatus {
    pub name: TemplateName,
    pub disabled: String,
    pub in_progress: u32,
}

/// Point-in-time view of one cloud.
#[derive(Debug, Clone, Serialize)]
pub struct CloudStatus {
    pub name: CloudName,
    pub disabled: String,
    pub in_progress: u32,
    pub templates: Vec<TemplateStatus>,
}

/// The fleet manager.
pub struct FleetManager {
    instance_id: FleetInstanceId,
    pool: Arc<ClientPool>,
    registry: Arc<dyn NodeRegistry>,
    engine: Arc<ProvisioningEngine>,
    watchdog: Arc<ReconciliationWatchdog>,
    reaper: Arc<RetentionReaper>,
}

impl FleetManager {
    pub fn new(
        instance_id: FleetInstanceId,
        clouds: Vec<Cloud>,
        factory: Arc<dyn ClientFactory>,
        registry: Arc<dyn NodeRegistry>,
        settings: FleetSettings,
    ) -> Self {
        let clouds: Vec<Arc<Cloud>> = clouds.into_iter().map(Arc::new).collect();
        let tracker = Arc::new(CapacityTracker::new());
        let pool = Arc::new(ClientPool::new(factory, settings.client_idle));

        let engine = Arc::new(ProvisioningEngine::new(
            instance_id,
            clouds.clone(),
            tracker,
            Arc::clone(&pool),
            Arc::clone(&registry),
            settings.provisioner,
        ));
        let watchdog = Arc::new(ReconciliationWatchdog::new(
            instance_id,
            clouds,
            Arc::clone(&pool),
            Arc::clone(&registry),
            settings.watchdog,
        ));
        let reaper = Arc::new(RetentionReaper::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            settings.retention,
        ));

        Self {
            instance_id,
            pool,
            registry,
            engine,
            watchdog,
            reaper,
        }
    }

    /// Build a fleet manager from process configuration and a fleet
    /// definition.
    ///
    /// In dry-run mode every cloud endpoint is served by its own in-memory
    /// runtime.
    pub fn from_config(config: &Config, spec: &FleetSpec) -> Self {
        let factory: Arc<dyn ClientFactory> = if config.dry_run {
            let factory = spec.clouds.iter().fold(StaticClientFactory::new(), |f, cloud| {
                f.with(cloud.uri.clone(), Arc::new(MockRuntime::new()))
            });
            Arc::new(factory)
        } else {
            Arc::new(DockerClientFactory)
        };

        Self::new(
            config.instance_id,
            spec.build(),
            factory,
            Arc::new(InMemoryNodeRegistry::new()),
            FleetSettings::from(config),
        )
    }

    pub fn instance_id(&self) -> FleetInstanceId {
        self.instance_id
    }

    pub fn engine(&self) -> &ProvisioningEngine {
        &self.engine
    }

    pub fn watchdog(&self) -> &Arc<ReconciliationWatchdog> {
        &self.watchdog
    }

    pub fn reaper(&self) -> &Arc<RetentionReaper> {
        &self.reaper
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<dyn NodeRegistry> {
        &self.registry
    }

    /// Start the watchdog, the retention reaper and the client pool janitor.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let watchdog = Arc::clone(&self.watchdog);
        let watchdog_shutdown = shutdown.clone();
        let watchdog_handle = tokio::spawn(async move {
            watchdog.run(watchdog_shutdown).await;
        });

        let reaper = Arc::clone(&self.reaper);
        let reaper_shutdown = shutdown.clone();
        let reaper_handle = tokio::spawn(async move {
            reaper.run(reaper_shutdown).await;
        });

        let janitor_handle = tokio::spawn(Arc::clone(&self.pool).run_janitor(shutdown));

        info!(instance_id = %self.instance_id, "Background loops started");
        vec![watchdog_handle, reaper_handle, janitor_handle]
    }

    /// Disabled state and in-flight creations for every cloud.
    pub fn status(&self) -> Vec<CloudStatus> {
        let tracker = self.engine.tracker();
        self.engine
            .clouds()
            .iter()
            .map(|cloud| CloudStatus {
                name: cloud.name.clone(),
                disabled: cloud.disabled.to_string(),
                in_progress: tracker.in_progress(cloud.name.as_str(), None),
                templates: cloud
                    .templates
                    .iter()
                    .map(|t| TemplateStatus {
                        name: t.name.clone(),
                        disabled: t.disabled.to_string(),
                        in_progress: tracker
                            .in_progress(cloud.name.as_str(), Some(t.name.as_str())),
                    })
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::LabelExpr;

    const FLEET: &str = r#"
[[cloud]]
name = "local"
uri = "unix:///var/run/docker.sock"
container_cap = 2

[[cloud.template]]
name = "jdk17"
image = "eclipse-temurin:17"
labels = "docker"
"#;

    fn dry_run_config() -> Config {
        Config {
            fleet_path: "fleet.toml".into(),
            instance_id: FleetInstanceId::new(),
            watchdog_interval: Duration::from_secs(300),
            watchdog_grace: Duration::from_secs(60),
            client_idle: Duration::from_secs(300),
            provision_workers: 2,
            disable_duration: Duration::from_secs(300),
            retention_interval: Duration::from_secs(60),
            dry_run: true,
        }
    }

    #[tokio::test]
    async fn test_dry_run_fleet_provisions_against_memory() {
        let config = dry_run_config();
        let spec = FleetSpec::from_toml_str(FLEET).unwrap();
        let fleet = FleetManager::from_config(&config, &spec);
        let label: LabelExpr = "docker".parse().unwrap();

        let plans = fleet.engine().request_capacity(Some(&label), 5).await;
        assert_eq!(plans.len(), 2);
        for plan in plans {
            plan.resolve().await.unwrap();
        }

        assert_eq!(fleet.registry().snapshot().await.len(), 2);
        let report = fleet.watchdog().sweep().await;
        assert_eq!(report.cloud("local").unwrap().mapped, 2);
        assert_eq!(report.removed(), 0);
    }

    #[tokio::test]
    async fn test_status_reports_disablement() {
        let spec = FleetSpec::from_toml_str(FLEET).unwrap();
        let fleet = FleetManager::from_config(&dry_run_config(), &spec);

        let status = fleet.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].disabled, "No");
        assert_eq!(status[0].in_progress, 0);

        fleet.engine().clouds()[0].disabled.set_disabled_by_choice(true);
        assert_eq!(fleet.status()[0].disabled, "ByChoice");
        let json = serde_json::to_value(fleet.status()).unwrap();
        assert_eq!(json[0]["templates"][0]["name"], "jdk17");
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reaper_reclaims_idle_nodes() {
        let raw = r#"
[[cloud]]
name = "local"
uri = "unix:///var/run/docker.sock"

[[cloud.template]]
name = "jdk17"
image = "eclipse-temurin:17"
retention = { type = "idle", idle_minutes = 0 }
"#;
        let spec = FleetSpec::from_toml_str(raw).unwrap();
        let fleet = FleetManager::from_config(&dry_run_config(), &spec);
        let node = fleet
            .engine()
            .request_capacity(None, 1)
            .await
            .into_iter()
            .next()
            .unwrap()
            .resolve()
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handles = fleet.spawn_background(rx);

        // Wall-clock idle time has to be measurable before the first pass.
        std::thread::sleep(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(fleet.registry().get(&node.name).await.is_none());

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loops_stop_on_shutdown() {
        let spec = FleetSpec::from_toml_str(FLEET).unwrap();
        let fleet = FleetManager::from_config(&dry_run_config(), &spec);
        let (tx, rx) = watch::channel(false);

        let handles = fleet.spawn_background(rx);
        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
