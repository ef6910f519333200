//! Clouds and the templates they provision from.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use dockfleet_id::{CloudName, TemplateName};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::connection::ClientKey;
use crate::connector::Connector;
use crate::disabled::DisabledState;
use crate::labels::ContainerIdentity;
use crate::retention::RetentionPolicy;
use crate::runtime::CreateSpec;
use crate::selector::LabelExpr;

/// Which requests a template serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageMode {
    /// Serves unlabelled requests as well as matching labelled ones.
    #[default]
    Normal,
    /// Serves only labelled requests whose expression matches.
    Exclusive,
}

/// A named container specification bound to one cloud.
#[derive(Debug)]
pub struct Template {
    pub name: TemplateName,
    pub image: String,
    pub labels: BTreeSet<String>,
    /// `None` means unbounded.
    pub instance_cap: Option<u32>,
    pub executors: u32,
    pub mode: UsageMode,
    pub connector: Connector,
    pub remove_volumes: bool,
    pub stop_timeout: Duration,
    pub name_prefix: String,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub retention: RetentionPolicy,
    pub disabled: DisabledState,
}

impl Template {
    /// Returns true if this template can serve a request for `label`.
    pub fn matches(&self, label: Option<&LabelExpr>) -> bool {
        match label {
            None => self.mode == UsageMode::Normal,
            Some(expr) => expr.matches(&self.labels),
        }
    }

    /// Build the create spec for a new node.
    pub fn create_spec(&self, identity: &ContainerIdentity<'_>) -> CreateSpec {
        let mut spec = CreateSpec {
            name: identity.node_name.to_string(),
            image: self.image.clone(),
            hostname: Some(identity.node_name.to_string()),
            cmd: self.cmd.clone(),
            env: self.env.clone(),
            labels: identity.to_labels(),
            open_stdin: false,
        };
        self.connector.before_create(&mut spec, identity.node_name);
        spec
    }
}

/// A container runtime endpoint plus the templates provisioned on it.
#[derive(Debug)]
pub struct Cloud {
    pub name: CloudName,
    pub endpoint: ClientKey,
    /// `None` means unbounded.
    pub container_cap: Option<u32>,
    pub templates: Vec<Template>,
    pub disabled: DisabledState,
    capacity_lock: Mutex<()>,
}

impl Cloud {
    pub fn new(
        name: CloudName,
        endpoint: ClientKey,
        container_cap: Option<u32>,
        templates: Vec<Template>,
    ) -> Self {
        Self {
            name,
            endpoint,
            container_cap,
            templates,
            disabled: DisabledState::default(),
            capacity_lock: Mutex::new(()),
        }
    }

    /// Serialize capacity decisions for this cloud.
    ///
    /// Held across the remote count query, so an async mutex.
    pub async fn lock_capacity(&self) -> MutexGuard<'_, ()> {
        self.capacity_lock.lock().await
    }

    pub fn template(&self, name: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.name.as_str() == name)
    }
}
