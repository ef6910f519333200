//! dockfleet Fleet Manager Library
//!
//! The fleet manager elastically provisions container-backed compute nodes
//! for a job scheduler and keeps the scheduler's view of active nodes
//! consistent with what each container runtime reports.
//!
//! ## Architecture
//!
//! ```text
//! FleetManager
//! ├── ProvisioningEngine       (cap checks, reservations, creation tasks)
//! │   └── CapacityTracker      (in-flight creations per cloud/template)
//! ├── ReconciliationWatchdog   (orphan cleanup, stale node detection)
//! ├── RetentionReaper          (idle and single-use node reclamation)
//! └── ClientPool               (shared, usage-counted runtime clients)
//!     └── ConnectionCache
//! ```
//!
//! ## Modules
//!
//! - `provisioner`: Capacity decisions and node creation
//! - `watchdog`: Periodic drift detection against the node registry
//! - `retention`: Per-template node retention policies
//! - `connection`: Runtime client pool built on `cache`
//! - `docker`: Docker Engine API client
//! - `disabled`: Per-cloud and per-template circuit breaker

pub mod cache;
pub mod capacity;
pub mod cloud;
pub mod config;
pub mod connection;
pub mod connector;
pub mod disabled;
pub mod docker;
pub mod error;
pub mod fleet;
pub mod labels;
pub mod node;
pub mod provisioner;
pub mod retention;
pub mod runtime;
pub mod selector;
pub mod termination;
pub mod watchdog;

// Re-export commonly used types
pub use capacity::{CapacityTracker, Reservation};
pub use cloud::{Cloud, Template, UsageMode};
pub use connection::{ClientKey, ClientPool, StaticClientFactory};
pub use disabled::DisabledState;
pub use error::ProvisionError;
pub use fleet::{FleetManager, FleetSettings};
pub use node::{InMemoryNodeRegistry, Node, NodeRegistry, NodeState};
pub use provisioner::{PlannedNode, ProvisionerConfig, ProvisioningEngine};
pub use retention::{RetentionConfig, RetentionPolicy, RetentionReaper};
pub use runtime::{ContainerRuntime, MockRuntime};
pub use selector::LabelExpr;
pub use watchdog::{ReconciliationWatchdog, SweepReport, WatchdogConfig};
