//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts the container operations the fleet
//! manager needs:
//! - Listing containers filtered by label
//! - Inspecting a container's labels and state
//! - Creating, starting, stopping and removing containers
//!
//! [`crate::docker::DockerClient`] talks to a real Docker Engine. The mock
//! keeps containers in memory and is used by tests and `--dry-run`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

/// Errors returned by a container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("runtime API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("invalid endpoint '{uri}': {reason}")]
    InvalidEndpoint { uri: String, reason: String },

    #[error("runtime unavailable: {0}")]
    Unavailable(String),
}

impl RuntimeError {
    /// Returns true if the container does not exist (already removed).
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Filter for [`ContainerRuntime::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Include stopped containers.
    pub all: bool,

    /// Label equality constraints, all of which must hold.
    pub labels: BTreeMap<String, String>,
}

impl ListFilter {
    /// Filter matching containers in any state.
    pub fn all() -> Self {
        Self {
            all: true,
            labels: BTreeMap::new(),
        }
    }

    /// Add a `key=value` label constraint.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Returns true if the given label set satisfies every constraint.
    pub fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// A container as reported by a list call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    /// Human readable status. Some runtimes omit it for containers that are
    /// mid-removal.
    pub status: Option<String>,
    pub created: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
}

/// A container as reported by an inspect call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub created: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Keep stdin open for connectors that attach to the container.
    pub open_stdin: bool,
}

/// Options for [`ContainerRuntime::remove`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Kill the container first if it is still running.
    pub force: bool,
    /// Also remove anonymous volumes.
    pub volumes: bool,
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers matching the filter.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Inspect a single container.
    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

    /// Create a container and return its id. The container is not started.
    async fn create(&self, spec: &CreateSpec) -> Result<String, RuntimeError>;

    /// Start a created container.
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stop a container, killing it after `timeout`.
    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    /// Remove a container.
    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<(), RuntimeError>;
}

/// In-memory container state held by [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: Option<String>,
    pub running: bool,
    pub created: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
}

/// Per-operation call counters for [`MockRuntime`].
#[derive(Debug, Default)]
pub struct MockCalls {
    pub list: AtomicU64,
    pub inspect: AtomicU64,
    pub create: AtomicU64,
    pub start: AtomicU64,
    pub stop: AtomicU64,
    pub remove: AtomicU64,
}

impl MockCalls {
    /// Total number of remote calls of any kind.
    pub fn total(&self) -> u64 {
        [
            &self.list,
            &self.inspect,
            &self.create,
            &self.start,
            &self.stop,
            &self.remove,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

/// Mock runtime for testing and development.
#[derive(Debug, Default)]
pub struct MockRuntime {
    containers: Mutex<BTreeMap<String, MockContainer>>,
    id_counter: AtomicU64,

    /// Remote call counters.
    pub calls: MockCalls,

    fail_list: AtomicBool,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    fail_remove: AtomicBool,

    /// Simulated latency of list calls.
    list_delay: Option<Duration>,

    /// Simulated latency of create calls.
    create_delay: Option<Duration>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate slow list calls.
    #[must_use]
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    /// Simulate slow create calls.
    #[must_use]
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    /// Seed a container directly, bypassing create.
    pub fn insert(&self, container: MockContainer) {
        self.containers().insert(container.id.clone(), container);
    }

    /// Snapshot of all containers.
    pub fn snapshot(&self) -> Vec<MockContainer> {
        self.containers().values().cloned().collect()
    }

    /// Look up one container.
    pub fn get(&self, id: &str) -> Option<MockContainer> {
        self.containers().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.containers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers().is_empty()
    }

    fn containers(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, MockContainer>> {
        self.containers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("{:012x}", counter + 1)
    }

    fn injected(op: &str) -> RuntimeError {
        RuntimeError::Unavailable(format!("mock runtime configured to fail {op}"))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list(&self, filter: &ListFilter) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(Self::injected("list"));
        }

        let containers = self
            .containers()
            .values()
            .filter(|c| filter.all || c.running)
            .filter(|c| filter.matches_labels(&c.labels))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                image: c.image.clone(),
                status: c.status.clone(),
                created: c.created,
                labels: c.labels.clone(),
            })
            .collect();
        Ok(containers)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        self.calls.inspect.fetch_add(1, Ordering::SeqCst);
        let containers = self.containers();
        let c = containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(ContainerDetails {
            id: c.id.clone(),
            name: c.name.clone(),
            image: c.image.clone(),
            running: c.running,
            created: c.created,
            labels: c.labels.clone(),
        })
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String, RuntimeError> {
        self.calls.create.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Self::injected("create"));
        }

        let mut containers = self.containers();
        if containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Conflict(format!(
                "container name {} already in use",
                spec.name
            )));
        }

        let id = self.next_id();
        info!(container_id = %id, name = %spec.name, image = %spec.image, "[MOCK] Created container");
        containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                status: Some("created".to_string()),
                running: false,
                created: Utc::now(),
                labels: spec.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.calls.start.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Self::injected("start"));
        }
        let mut containers = self.containers();
        let c = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        c.running = true;
        c.status = Some("running".to_string());
        debug!(container_id = %id, "[MOCK] Started container");
        Ok(())
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        self.calls.stop.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(Self::injected("stop"));
        }
        let mut containers = self.containers();
        let c = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        c.running = false;
        c.status = Some("exited".to_string());
        debug!(container_id = %id, timeout_secs = timeout.as_secs(), "[MOCK] Stopped container");
        Ok(())
    }

    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<(), RuntimeError> {
        self.calls.remove.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(Self::injected("remove"));
        }
        let mut containers = self.containers();
        match containers.get(id) {
            None => return Err(RuntimeError::NotFound(id.to_string())),
            Some(c) if c.running && !options.force => {
                return Err(RuntimeError::Conflict(format!(
                    "container {id} is running, stop it or use force"
                )));
            }
            Some(_) => {}
        }
        containers.remove(id);
        debug!(container_id = %id, volumes = options.volumes, "[MOCK] Removed container");
        Ok(())
    }
}
