//! Capacity-driven node provisioning.
//!
//! The engine turns a scheduler request ("N executors for label L") into
//! planned nodes without breaching cloud or template caps:
//!
//! 1. Walk the matching templates in declaration order and always try the
//!    first one still in the running (first-fit).
//! 2. Under the cloud's capacity lock, count remote containers plus
//!    in-flight creations and reject the template if a cap would be hit.
//! 3. On accept, reserve in-flight capacity *before* spawning the creation
//!    task. The task owns the reservation, so the count is released only
//!    after the task has finished, whatever the outcome.
//!
//! Runtime failures trip the cloud's circuit breaker so subsequent requests
//! skip it without a remote round-trip until the window elapses.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dockfleet_id::{CloudName, FleetInstanceId, NodeId, TemplateName};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capacity::{CapacityTracker, Reservation};
use crate::cloud::{Cloud, Template};
use crate::connection::{ClientLease, ClientPool, PoolError};
use crate::disabled::DEFAULT_DISABLE_DURATION;
use crate::error::{CreationStage, ProvisionError};
use crate::labels::{self, ContainerIdentity};
use crate::node::{Node, NodeActivity, NodeRegistry, NodeState};
use crate::runtime::{ListFilter, RuntimeError};
use crate::selector::LabelExpr;
use crate::termination::{force_remove, stop_and_remove};

/// Provisioning engine configuration.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Maximum number of concurrent create/start sequences.
    pub workers: usize,

    /// How long a cloud stays disabled after a runtime failure.
    pub disable_duration: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            disable_duration: DEFAULT_DISABLE_DURATION,
        }
    }
}

enum Outcome {
    Pending(JoinHandle<Result<Node, ProvisionError>>),
    Failed(ProvisionError),
}

/// A node that has been planned and is being created in the background.
pub struct PlannedNode {
    pub display_name: String,
    pub cloud: CloudName,
    pub template: Option<TemplateName>,
    pub executors: u32,
    outcome: Outcome,
}

impl PlannedNode {
    fn failed(cloud: &CloudName, error: ProvisionError) -> Self {
        Self {
            display_name: format!("{cloud} (unavailable)"),
            cloud: cloud.clone(),
            template: None,
            executors: 0,
            outcome: Outcome::Failed(error),
        }
    }

    /// Returns true if the plan failed before any creation was attempted.
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }

    /// Wait for the node to be created and registered.
    pub async fn resolve(self) -> Result<Node, ProvisionError> {
        match self.outcome {
            Outcome::Failed(e) => Err(e),
            Outcome::Pending(handle) => handle.await.map_err(|e| ProvisionError::WorkerLost {
                node_name: self.display_name,
                reason: e.to_string(),
            })?,
        }
    }
}

impl std::fmt::Debug for PlannedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedNode")
            .field("display_name", &self.display_name)
            .field("cloud", &self.cloud)
            .field("template", &self.template)
            .field("executors", &self.executors)
            .field("failed", &self.is_failed())
            .finish()
    }
}

/// Everything a creation task needs, cheap to clone into the task.
#[derive(Clone)]
struct CreationContext {
    owner: FleetInstanceId,
    pool: Arc<ClientPool>,
    registry: Arc<dyn NodeRegistry>,
    workers: Arc<Semaphore>,
    disable_duration: Duration,
}

/// Provisioning engine.
pub struct ProvisioningEngine {
    clouds: Vec<Arc<Cloud>>,
    tracker: Arc<CapacityTracker>,
    ctx: CreationContext,
}

impl ProvisioningEngine {
    pub fn new(
        owner: FleetInstanceId,
        clouds: Vec<Arc<Cloud>>,
        tracker: Arc<CapacityTracker>,
        pool: Arc<ClientPool>,
        registry: Arc<dyn NodeRegistry>,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            clouds,
            tracker,
            ctx: CreationContext {
                owner,
                pool,
                registry,
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
                disable_duration: config.disable_duration,
            },
        }
    }

    pub fn clouds(&self) -> &[Arc<Cloud>] {
        &self.clouds
    }

    pub fn cloud(&self, name: &str) -> Option<&Arc<Cloud>> {
        self.clouds.iter().find(|c| c.name.as_str() == name)
    }

    pub fn tracker(&self) -> &Arc<CapacityTracker> {
        &self.tracker
    }

    /// Returns true if some enabled template could serve `label`.
    pub fn can_provision(&self, label: Option<&LabelExpr>) -> bool {
        !self.candidates(label).is_empty()
    }

    /// First enabled template that could serve `label`.
    pub fn template_for(&self, label: Option<&LabelExpr>) -> Option<(CloudName, TemplateName)> {
        self.candidates(label)
            .first()
            .map(|(cloud, idx)| (cloud.name.clone(), cloud.templates[*idx].name.clone()))
    }

    /// Plan enough nodes to cover `executors_needed`, within caps.
    ///
    /// The returned list may cover fewer executors than requested; the
    /// scheduler asks again on its next round.
    pub async fn request_capacity(
        &self,
        label: Option<&LabelExpr>,
        executors_needed: u32,
    ) -> Vec<PlannedNode> {
        let label_text = label.map(ToString::to_string).unwrap_or_default();
        info!(executors = executors_needed, label = %label_text, "Asked to provision");

        let mut remaining = executors_needed;
        let mut candidates = self.candidates(label);
        let mut planned = Vec::new();

        while remaining > 0 {
            // The breaker may have tripped since the candidates were chosen.
            candidates.retain(|(cloud, idx)| {
                !cloud.disabled.is_disabled() && !cloud.templates[*idx].disabled.is_disabled()
            });
            let Some((cloud, idx)) = candidates.first().cloned() else {
                break;
            };
            let template = &cloud.templates[idx];

            match self.try_reserve(&cloud, template).await {
                Ok(reservation) => {
                    let plan = self.spawn_creation(Arc::clone(&cloud), idx, reservation);
                    info!(
                        cloud = %cloud.name,
                        template = %template.name,
                        node = %plan.display_name,
                        label = %label_text,
                        "Will provision node"
                    );
                    remaining = remaining.saturating_sub(template.executors.max(1));
                    planned.push(plan);
                }
                Err(e) if e.is_soft() => {
                    info!(cloud = %cloud.name, template = %template.name, reason = %e, "Not provisioning");
                    candidates.remove(0);
                }
                Err(e) => {
                    warn!(cloud = %cloud.name, error = %e, "Capacity check failed, disabling cloud");
                    cloud.disabled.disable_by_system(
                        format!("capacity check failed: {e}"),
                        self.ctx.disable_duration,
                        Some(&e),
                    );
                    candidates.retain(|(c, _)| !Arc::ptr_eq(c, &cloud));
                    planned.push(PlannedNode::failed(&cloud.name, e));
                }
            }
        }

        if remaining > 0 {
            debug!(unsatisfied = remaining, "Capacity request only partially planned");
        }
        planned
    }

    /// Stop and remove a node's container and drop it from the registry.
    pub async fn terminate_node(&self, name: &str) -> Result<(), ProvisionError> {
        let registry = &self.ctx.registry;
        let node = registry
            .get(name)
            .await
            .ok_or_else(|| ProvisionError::UnknownNode(name.to_string()))?;
        let cloud = self
            .cloud(node.cloud.as_str())
            .ok_or_else(|| ProvisionError::UnknownCloud(node.cloud.to_string()))?;

        let registration = |source| ProvisionError::Registration {
            node_name: name.to_string(),
            source,
        };
        registry
            .update_state(name, NodeState::Terminating)
            .await
            .map_err(registration)?;

        let (stop_timeout, remove_volumes) = match cloud.template(node.template.as_str()) {
            Some(t) => (t.stop_timeout, t.remove_volumes),
            None => (Duration::from_secs(10), false),
        };

        let lease = lease(&self.ctx.pool, cloud)?;
        let outcome = stop_and_remove(&*lease, &node.container_id, stop_timeout, remove_volumes)
            .await
            .map_err(|source| ProvisionError::Termination {
                node_name: name.to_string(),
                source,
            })?;
        drop(lease);

        registry
            .update_state(name, NodeState::Gone)
            .await
            .map_err(registration)?;
        registry.remove(name).await.map_err(registration)?;
        info!(node = %name, container_id = %node.container_id, outcome = ?outcome, "Node terminated");
        Ok(())
    }

    fn candidates(&self, label: Option<&LabelExpr>) -> Vec<(Arc<Cloud>, usize)> {
        self.clouds
            .iter()
            .filter(|cloud| !cloud.disabled.is_disabled())
            .flat_map(|cloud| {
                cloud
                    .templates
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| !t.disabled.is_disabled() && t.matches(label))
                    .map(|(idx, _)| (Arc::clone(cloud), idx))
            })
            .collect()
    }

    /// Check caps under the cloud lock and reserve in-flight capacity.
    async fn try_reserve(
        &self,
        cloud: &Cloud,
        template: &Template,
    ) -> Result<Reservation, ProvisionError> {
        let _guard = cloud.lock_capacity().await;

        // Read in-flight counts before listing. A creation that finishes in
        // between is then seen by the list instead of being missed by both.
        let cloud_in_progress = self.tracker.in_progress(cloud.name.as_str(), None);
        let template_in_progress = self
            .tracker
            .in_progress(cloud.name.as_str(), Some(template.name.as_str()));
        let (remote_total, remote_template) = self.remote_counts(cloud, template).await?;

        let estimated_total = remote_total + cloud_in_progress;
        if let Some(cap) = cloud.container_cap {
            if estimated_total >= cap {
                return Err(ProvisionError::CapacityExceeded {
                    cloud: cloud.name.clone(),
                    template: template.name.clone(),
                    detail: format!("cloud full with {estimated_total} of {cap} containers"),
                });
            }
        }

        let estimated_template = remote_template + template_in_progress;
        if let Some(cap) = template.instance_cap {
            if estimated_template >= cap {
                return Err(ProvisionError::CapacityExceeded {
                    cloud: cloud.name.clone(),
                    template: template.name.clone(),
                    detail: format!("instance limit of {cap} reached"),
                });
            }
        }

        debug!(
            cloud = %cloud.name,
            template = %template.name,
            remote_total,
            cloud_in_progress,
            remote_template,
            template_in_progress,
            "Capacity available"
        );
        Ok(self.tracker.reserve(&cloud.name, &template.name))
    }

    /// Running containers on the cloud, in total and for one template.
    ///
    /// The total counts every running container on the endpoint, including
    /// ones this fleet manager did not create.
    async fn remote_counts(
        &self,
        cloud: &Cloud,
        template: &Template,
    ) -> Result<(u32, u32), ProvisionError> {
        let lease = lease(&self.ctx.pool, cloud)?;
        let running = lease
            .list(&ListFilter::default())
            .await
            .map_err(|source| ProvisionError::RemoteQuery {
                cloud: cloud.name.clone(),
                source,
            })?;

        let owned = ListFilter::default()
            .label(labels::OWNER_INSTANCE_ID, self.ctx.owner.to_string())
            .label(labels::CLOUD, cloud.name.as_str())
            .label(labels::TEMPLATE, template.name.as_str());
        let for_template = running
            .iter()
            .filter(|c| owned.matches_labels(&c.labels))
            .count();

        Ok((running.len() as u32, for_template as u32))
    }

    fn spawn_creation(
        &self,
        cloud: Arc<Cloud>,
        template_idx: usize,
        reservation: Reservation,
    ) -> PlannedNode {
        let template = &cloud.templates[template_idx];
        let node_id = NodeId::new();
        let node_name = node_id.node_name(&template.name_prefix);

        let plan_cloud = cloud.name.clone();
        let plan_template = template.name.clone();
        let executors = template.executors;
        let ctx = self.ctx.clone();
        let task_name = node_name.clone();

        let handle = tokio::spawn(async move {
            // Released when the task ends, after any cleanup below.
            let _reservation = reservation;
            let result = create_node(&ctx, &cloud, template_idx, node_id, &task_name).await;
            if let Err(e) = &result {
                error!(
                    cloud = %cloud.name,
                    node = %task_name,
                    reason = e.reason_code(),
                    error = %e,
                    "Error in provisioning"
                );
            }
            result
        });

        PlannedNode {
            display_name: node_name,
            cloud: plan_cloud,
            template: Some(plan_template),
            executors,
            outcome: Outcome::Pending(handle),
        }
    }
}

fn lease(pool: &Arc<ClientPool>, cloud: &Cloud) -> Result<ClientLease, ProvisionError> {
    pool.lease(&cloud.endpoint).map_err(|e| match e {
        PoolError::Connect { source, .. } => ProvisionError::RemoteQuery {
            cloud: cloud.name.clone(),
            source,
        },
        PoolError::Protocol(source) => ProvisionError::ClientPool {
            cloud: cloud.name.clone(),
            source,
        },
    })
}

/// Create, start and register one node.
async fn create_node(
    ctx: &CreationContext,
    cloud: &Cloud,
    template_idx: usize,
    node_id: NodeId,
    node_name: &str,
) -> Result<Node, ProvisionError> {
    let template = &cloud.templates[template_idx];
    let _permit = ctx
        .workers
        .acquire()
        .await
        .map_err(|e| ProvisionError::WorkerLost {
            node_name: node_name.to_string(),
            reason: e.to_string(),
        })?;

    let trip = |stage: CreationStage, e: &RuntimeError| {
        cloud.disabled.disable_by_system(
            format!("failed to {stage} container for template {}", template.name),
            ctx.disable_duration,
            Some(e),
        );
    };
    let creation_error = |stage, source| ProvisionError::NodeCreation {
        node_name: node_name.to_string(),
        stage,
        source,
    };

    let runtime = match lease(&ctx.pool, cloud) {
        Ok(runtime) => runtime,
        Err(e) => {
            cloud.disabled.disable_by_system(
                format!("no runtime client for template {}", template.name),
                ctx.disable_duration,
                Some(&e),
            );
            return Err(e);
        }
    };
    let identity = ContainerIdentity {
        owner: ctx.owner,
        cloud: &cloud.name,
        template: &template.name,
        image: &template.image,
        node_name,
        remove_volumes: template.remove_volumes,
    };
    let spec = template.create_spec(&identity);

    let container_id = match runtime.create(&spec).await {
        Ok(id) => id,
        Err(e) => {
            trip(CreationStage::Create, &e);
            return Err(creation_error(CreationStage::Create, e));
        }
    };
    debug!(node = %node_name, container_id = %container_id, "Container created");

    let started = match runtime.start(&container_id).await {
        Ok(()) => {
            template
                .connector
                .after_start(&*runtime, &container_id)
                .await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = started {
        trip(CreationStage::Start, &e);
        // Remove the half-made container while the reservation is still held.
        if let Err(cleanup) = force_remove(&*runtime, &container_id, true).await {
            error!(
                container_id = %container_id,
                error = %cleanup,
                "Failed to remove container after failed start"
            );
        }
        return Err(creation_error(CreationStage::Start, e));
    }

    let created_at = Utc::now();
    let node = Node {
        id: node_id,
        name: node_name.to_string(),
        cloud: cloud.name.clone(),
        template: template.name.clone(),
        container_id: container_id.clone(),
        executors: template.executors,
        state: NodeState::Registered,
        launcher: template.connector.launcher(&container_id, node_name),
        created_at,
        activity: NodeActivity::idle_since(created_at),
    };

    if let Err(source) = ctx.registry.register(node.clone()).await {
        if let Err(cleanup) =
            stop_and_remove(&*runtime, &container_id, template.stop_timeout, true).await
        {
            error!(container_id = %container_id, error = %cleanup, "Failed to remove unregistered container");
        }
        return Err(ProvisionError::Registration {
            node_name: node_name.to_string(),
            source,
        });
    }

    info!(
        cloud = %cloud.name,
        template = %template.name,
        node = %node_name,
        container_id = %container_id,
        "Node provisioned"
    );
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fixtures::{cloud, template};
    use crate::connection::StaticClientFactory;
    use crate::node::InMemoryNodeRegistry;
    use crate::runtime::MockRuntime;
    use std::sync::atomic::Ordering;

    struct Harness {
        engine: ProvisioningEngine,
        runtime: Arc<MockRuntime>,
        registry: Arc<InMemoryNodeRegistry>,
    }

    fn harness(clouds: Vec<Cloud>) -> Harness {
        let runtime = Arc::new(MockRuntime::new());
        let mut factory = StaticClientFactory::new();
        for c in &clouds {
            factory = factory.with(c.endpoint.uri.clone(), runtime.clone());
        }
        let pool = Arc::new(ClientPool::new(Arc::new(factory), Duration::from_secs(60)));
        let registry = Arc::new(InMemoryNodeRegistry::new());
        let engine = ProvisioningEngine::new(
            FleetInstanceId::new(),
            clouds.into_iter().map(Arc::new).collect(),
            Arc::new(CapacityTracker::new()),
            pool,
            registry.clone(),
            ProvisionerConfig::default(),
        );
        Harness {
            engine,
            runtime,
            registry,
        }
    }

    #[tokio::test]
    async fn test_provisions_and_registers_node() {
        let h = harness(vec![cloud("local", None, vec![template("jdk17", "docker", None)])]);
        let label: LabelExpr = "docker".parse().unwrap();

        let plans = h.engine.request_capacity(Some(&label), 1).await;
        assert_eq!(plans.len(), 1);
        let node = plans.into_iter().next().unwrap().resolve().await.unwrap();

        assert_eq!(node.state, NodeState::Registered);
        assert!(node.name.starts_with("docker-"));
        let container = h.runtime.get(&node.container_id).unwrap();
        assert!(container.running);
        assert_eq!(container.labels[labels::NODE_NAME], node.name);
        assert!(h.registry.get(&node.name).await.is_some());
        assert!(h.engine.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_unlabelled_request_skips_exclusive_templates() {
        let mut exclusive = template("special", "gpu", None);
        exclusive.mode = crate::cloud::UsageMode::Exclusive;
        let h = harness(vec![cloud("local", None, vec![exclusive])]);

        assert!(!h.engine.can_provision(None));
        assert!(h.engine.request_capacity(None, 1).await.is_empty());

        let gpu: LabelExpr = "gpu".parse().unwrap();
        assert_eq!(
            h.engine.template_for(Some(&gpu)).map(|(_, t)| t.to_string()),
            Some("special".to_string())
        );
    }

    #[tokio::test]
    async fn test_first_fit_uses_first_template_until_capped() {
        let h = harness(vec![cloud(
            "local",
            None,
            vec![template("a", "l", Some(2)), template("b", "l", None)],
        )]);
        let label: LabelExpr = "l".parse().unwrap();

        let plans = h.engine.request_capacity(Some(&label), 3).await;
        let templates: Vec<String> = plans
            .iter()
            .map(|p| p.template.as_ref().unwrap().to_string())
            .collect();
        assert_eq!(templates, vec!["a", "a", "b"]);

        for plan in plans {
            plan.resolve().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_multi_executor_templates_reduce_demand() {
        let mut big = template("big", "l", None);
        big.executors = 4;
        let h = harness(vec![cloud("local", None, vec![big])]);
        let label: LabelExpr = "l".parse().unwrap();

        let plans = h.engine.request_capacity(Some(&label), 5).await;
        assert_eq!(plans.len(), 2);
        assert!(plans.iter().all(|p| p.executors == 4));
    }

    #[tokio::test]
    async fn test_query_failure_trips_breaker() {
        let h = harness(vec![cloud("local", None, vec![template("a", "l", None)])]);
        h.runtime.set_fail_list(true);
        let label: LabelExpr = "l".parse().unwrap();

        let plans = h.engine.request_capacity(Some(&label), 1).await;
        assert_eq!(plans.len(), 1);
        assert!(plans[0].is_failed());
        let err = plans.into_iter().next().unwrap().resolve().await.unwrap_err();
        assert!(matches!(err, ProvisionError::RemoteQuery { .. }));

        let cloud = h.engine.cloud("local").unwrap();
        assert!(cloud.disabled.disabled_by_system());
        assert!(!cloud.disabled.disabled_by_choice());

        let calls = h.runtime.calls.total();
        assert!(h.engine.request_capacity(Some(&label), 1).await.is_empty());
        assert_eq!(h.runtime.calls.total(), calls);
    }

    #[tokio::test]
    async fn test_start_failure_removes_container_and_releases() {
        let h = harness(vec![cloud("local", None, vec![template("a", "l", None)])]);
        h.runtime.set_fail_start(true);
        let label: LabelExpr = "l".parse().unwrap();

        let plan = h
            .engine
            .request_capacity(Some(&label), 1)
            .await
            .into_iter()
            .next()
            .unwrap();
        let err = plan.resolve().await.unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::NodeCreation {
                stage: CreationStage::Start,
                ..
            }
        ));
        assert!(h.runtime.is_empty());
        assert_eq!(h.runtime.calls.remove.load(Ordering::SeqCst), 1);
        assert!(h.engine.tracker().is_empty());
        assert!(h.registry.is_empty().await);
        assert!(h.engine.cloud("local").unwrap().disabled.is_disabled());
    }

    /// Serves `runtime` for the first `healthy` connects, then fails.
    struct FlakyFactory {
        runtime: Arc<MockRuntime>,
        healthy: std::sync::atomic::AtomicU32,
    }

    impl crate::connection::ClientFactory for FlakyFactory {
        fn connect(
            &self,
            key: &crate::connection::ClientKey,
        ) -> Result<Arc<dyn crate::runtime::ContainerRuntime>, RuntimeError> {
            let left = self.healthy.load(Ordering::SeqCst);
            if left == 0 {
                return Err(RuntimeError::InvalidEndpoint {
                    uri: key.uri.clone(),
                    reason: "connection refused".to_string(),
                });
            }
            self.healthy.store(left - 1, Ordering::SeqCst);
            Ok(self.runtime.clone())
        }
    }

    #[tokio::test]
    async fn test_client_failure_after_capacity_check_trips_breaker() {
        let runtime = Arc::new(MockRuntime::new());
        let factory = FlakyFactory {
            runtime: runtime.clone(),
            healthy: std::sync::atomic::AtomicU32::new(1),
        };
        // Zero idle time: the creation task has to build a fresh client.
        let pool = Arc::new(ClientPool::new(Arc::new(factory), Duration::ZERO));
        let registry = Arc::new(InMemoryNodeRegistry::new());
        let engine = ProvisioningEngine::new(
            FleetInstanceId::new(),
            vec![Arc::new(cloud("local", None, vec![template("a", "l", None)]))],
            Arc::new(CapacityTracker::new()),
            pool,
            registry.clone(),
            ProvisionerConfig::default(),
        );
        let label: LabelExpr = "l".parse().unwrap();

        let plans = engine.request_capacity(Some(&label), 1).await;
        assert_eq!(plans.len(), 1);
        assert!(!plans[0].is_failed());

        let err = plans.into_iter().next().unwrap().resolve().await.unwrap_err();
        assert!(matches!(err, ProvisionError::RemoteQuery { .. }));
        assert!(engine.cloud("local").unwrap().disabled.disabled_by_system());
        assert!(engine.tracker().is_empty());
        assert!(registry.is_empty().await);
        assert_eq!(runtime.calls.create.load(Ordering::SeqCst), 0);

        // The breaker keeps further requests off the cloud.
        assert!(engine.request_capacity(Some(&label), 1).await.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_node() {
        let h = harness(vec![cloud("local", None, vec![template("a", "l", None)])]);
        let label: LabelExpr = "l".parse().unwrap();
        let node = h
            .engine
            .request_capacity(Some(&label), 1)
            .await
            .into_iter()
            .next()
            .unwrap()
            .resolve()
            .await
            .unwrap();

        h.engine.terminate_node(&node.name).await.unwrap();
        assert!(h.runtime.is_empty());
        assert!(h.registry.is_empty().await);
        assert!(matches!(
            h.engine.terminate_node(&node.name).await,
            Err(ProvisionError::UnknownNode(_))
        ));
    }
}
