//! Shared runtime clients.
//!
//! Runtime clients are expensive to build (connection pools, TLS state), so
//! every caller that targets the same endpoint with the same settings shares
//! one. [`ClientPool`] owns the [`ConnectionCache`] behind a single mutex and
//! hands out [`ClientLease`] guards that release their checkout on drop, on
//! every exit path.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::cache::{CacheError, CacheStats, ConnectionCache};
use crate::docker::DockerClient;
use crate::runtime::{ContainerRuntime, RuntimeError};

/// Everything that distinguishes one runtime client from another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub uri: String,
    pub credentials_id: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// Errors from [`ClientPool::lease`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// A new client could not be built.
    #[error("failed to connect to {uri}: {source}")]
    Connect {
        uri: String,
        #[source]
        source: RuntimeError,
    },

    /// The cache protocol was violated.
    #[error(transparent)]
    Protocol(#[from] CacheError),
}

/// Builds runtime clients for the pool.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, key: &ClientKey) -> Result<Arc<dyn ContainerRuntime>, RuntimeError>;
}

/// Factory producing [`DockerClient`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerClientFactory;

impl ClientFactory for DockerClientFactory {
    fn connect(&self, key: &ClientKey) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        info!(uri = %key.uri, "Creating Docker client");
        Ok(Arc::new(DockerClient::connect(key)?))
    }
}

/// Factory that hands out pre-built runtimes by endpoint URI.
///
/// Used by tests and dry runs to plug a [`crate::runtime::MockRuntime`]
/// in place of a real engine.
#[derive(Default)]
pub struct StaticClientFactory {
    runtimes: std::collections::HashMap<String, Arc<dyn ContainerRuntime>>,
    connects: std::sync::atomic::AtomicU64,
}

impl StaticClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `runtime` for every key whose URI is `uri`.
    #[must_use]
    pub fn with(mut self, uri: impl Into<String>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtimes.insert(uri.into(), runtime);
        self
    }

    /// Number of clients built so far.
    pub fn connects(&self) -> u64 {
        self.connects.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl ClientFactory for StaticClientFactory {
    fn connect(&self, key: &ClientKey) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        self.connects
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.runtimes
            .get(&key.uri)
            .cloned()
            .ok_or_else(|| RuntimeError::InvalidEndpoint {
                uri: key.uri.clone(),
                reason: "no runtime registered for this endpoint".to_string(),
            })
    }
}

type ClientCache = ConnectionCache<ClientKey, Arc<dyn ContainerRuntime>>;

/// Pool of shared runtime clients.
pub struct ClientPool {
    cache: Mutex<ClientCache>,
    factory: Arc<dyn ClientFactory>,
}

impl ClientPool {
    /// Create a pool whose unused clients are closed after `idle_duration`.
    pub fn new(factory: Arc<dyn ClientFactory>, idle_duration: Duration) -> Self {
        let cache = ConnectionCache::new(idle_duration, |key: &ClientKey, _client| {
            info!(uri = %key.uri, "Closing idle runtime client");
        });
        Self {
            cache: Mutex::new(cache),
            factory,
        }
    }

    /// Lease the shared client for `key`, building it if necessary.
    pub fn lease(self: &Arc<Self>, key: &ClientKey) -> Result<ClientLease, PoolError> {
        let mut cache = self.cache();

        let client = match cache.checkout(key) {
            Some(client) => client,
            None => {
                let client = self
                    .factory
                    .connect(key)
                    .map_err(|source| PoolError::Connect {
                        uri: key.uri.clone(),
                        source,
                    })?;
                cache.store(key.clone(), Arc::clone(&client))?;
                client
            }
        };

        Ok(ClientLease {
            pool: Arc::clone(self),
            key: key.clone(),
            client,
        })
    }

    /// Close clients whose idle duration has elapsed.
    pub fn purge_expired(&self) -> usize {
        self.cache().purge_expired()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache().stats()
    }

    /// Number of clients currently leased / idle.
    pub fn counts(&self) -> (usize, usize) {
        let cache = self.cache();
        (cache.active_len(), cache.idle_len())
    }

    /// Periodically close expired clients until shutdown.
    pub async fn run_janitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.cache().idle_duration().max(Duration::from_secs(1)) / 2;
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let closed = self.purge_expired();
                    if closed > 0 {
                        debug!(closed, "Closed idle runtime clients");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Client pool janitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn release(&self, key: &ClientKey) -> Result<(), CacheError> {
        self.cache().release(key)
    }

    fn cache(&self) -> MutexGuard<'_, ClientCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A checked-out runtime client. Releases its checkout when dropped.
pub struct ClientLease {
    pool: Arc<ClientPool>,
    key: ClientKey,
    client: Arc<dyn ContainerRuntime>,
}

impl ClientLease {
    pub fn key(&self) -> &ClientKey {
        &self.key
    }
}

impl Deref for ClientLease {
    type Target = dyn ContainerRuntime;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

impl fmt::Debug for ClientLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientLease").field("key", &self.key).finish()
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        if let Err(e) = self.pool.release(&self.key) {
            error!(error = %e, uri = %self.key.uri, "Client pool protocol violation");
        }
    }
}
