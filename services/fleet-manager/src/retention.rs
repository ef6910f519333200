//! Node retention.
//!
//! Provisioned nodes are reclaimed according to their template's policy:
//! - `idle`: terminated once no executor has run anything for the idle
//!   timeout
//! - `once`: terminated as soon as its first task finishes, with the idle
//!   timeout as a fallback for nodes that never pick anything up
//!
//! The reaper checks every node on an interval and terminates through the
//! provisioning engine, which frees the node's capacity for new requests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::node::{Node, NodeActivity, NodeRegistry, NodeState};
use crate::provisioner::ProvisioningEngine;
use crate::watchdog::{Clock, SystemClock};

fn default_idle_minutes() -> u64 {
    10
}

/// When a template's nodes are reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum RetentionPolicy {
    /// Keep the node until it has been idle for `idle_minutes`.
    Idle {
        #[serde(default = "default_idle_minutes")]
        idle_minutes: u64,
    },

    /// Use the node for a single task.
    Once {
        #[serde(default = "default_idle_minutes")]
        idle_minutes: u64,
    },
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::Idle {
            idle_minutes: default_idle_minutes(),
        }
    }
}

/// Why a node is being reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionReason {
    Idle,
    UsedOnce,
}

impl fmt::Display for RetentionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::UsedOnce => f.write_str("used_once"),
        }
    }
}

impl RetentionPolicy {
    pub fn idle_timeout(&self) -> Duration {
        let minutes = match self {
            Self::Idle { idle_minutes } | Self::Once { idle_minutes } => *idle_minutes,
        };
        Duration::from_secs(minutes.saturating_mul(60))
    }

    /// Decide whether a node with this activity should go now.
    ///
    /// Busy nodes are never reclaimed.
    pub fn verdict(&self, activity: &NodeActivity, now: DateTime<Utc>) -> Option<RetentionReason> {
        if activity.busy_executors > 0 {
            return None;
        }
        if matches!(self, Self::Once { .. }) && activity.completed_tasks > 0 {
            return Some(RetentionReason::UsedOnce);
        }

        let idle_since = activity.idle_since?;
        let idle_for = now.signed_duration_since(idle_since).to_std().ok()?;
        (idle_for > self.idle_timeout()).then_some(RetentionReason::Idle)
    }
}

/// Retention reaper configuration.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Time between checks.
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Result of one retention pass.
#[derive(Debug, Default)]
pub struct ReapReport {
    pub terminated: Vec<(String, RetentionReason)>,
    pub failures: BTreeMap<String, String>,
}

/// Periodically terminates nodes their retention policy no longer keeps.
pub struct RetentionReaper {
    engine: Arc<ProvisioningEngine>,
    registry: Arc<dyn NodeRegistry>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
}

impl RetentionReaper {
    pub fn new(
        engine: Arc<ProvisioningEngine>,
        registry: Arc<dyn NodeRegistry>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            engine,
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

    /// Run retention passes until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting retention reaper"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.reap().await;
                    if !report.terminated.is_empty() || !report.failures.is_empty() {
                        debug!(
                            terminated = report.terminated.len(),
                            failed = report.failures.len(),
                            "Retention pass complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Retention reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Check every node once and terminate the ones due.
    ///
    /// Nodes left in `Terminating` by a failed earlier attempt are retried.
    pub async fn reap(&self) -> ReapReport {
        let now = self.clock.now();
        let mut report = ReapReport::default();

        for node in self.registry.snapshot().await.into_values() {
            let Some(reason) = self.due(&node, now) else {
                continue;
            };

            info!(node = %node.name, cloud = %node.cloud, reason = %reason, "Reclaiming node");
            match self.engine.terminate_node(&node.name).await {
                Ok(()) => report.terminated.push((node.name, reason)),
                Err(e) => {
                    error!(node = %node.name, error = %e, "Failed to reclaim node");
                    report.failures.insert(node.name, e.to_string());
                }
            }
        }
        report
    }

    fn due(&self, node: &Node, now: DateTime<Utc>) -> Option<RetentionReason> {
        if node.state == NodeState::Terminating {
            return Some(RetentionReason::Idle);
        }
        if !node.state.expects_container() {
            return None;
        }

        let policy = self
            .engine
            .cloud(node.cloud.as_str())
            .and_then(|cloud| cloud.template(node.template.as_str()))
            .map_or_else(RetentionPolicy::default, |t| t.retention);
        policy.verdict(&node.activity, now)
    }
}
