//! Configuration for the fleet manager.
//!
//! Process settings come from `DOCKFLEET_*` environment variables. The fleet
//! itself (clouds and templates) is a static TOML file whose path is one of
//! those settings.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dockfleet_id::{validate_name, CloudName, FleetInstanceId, TemplateName};
use serde::Deserialize;
use tracing::warn;

use crate::cloud::{Cloud, Template, UsageMode};
use crate::connection::ClientKey;
use crate::connector::Connector;
use crate::disabled::DisabledState;
use crate::docker::DockerEndpoint;
use crate::retention::RetentionPolicy;
use crate::selector::label_set;

/// Fleet manager process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the fleet definition.
    pub fleet_path: PathBuf,

    /// Identity stamped on every container this process owns.
    pub instance_id: FleetInstanceId,

    /// Time between watchdog sweeps.
    pub watchdog_interval: Duration,

    /// Minimum orphan age before the watchdog removes it.
    pub watchdog_grace: Duration,

    /// How long an unused runtime client is kept open.
    pub client_idle: Duration,

    /// Concurrent create/start sequences.
    pub provision_workers: usize,

    /// Circuit breaker window after a runtime failure.
    pub disable_duration: Duration,

    /// Time between retention checks.
    pub retention_interval: Duration,

    /// Serve every cloud from an in-memory runtime instead of Docker.
    pub dry_run: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(default)
        };

        // The instance id must survive restarts or the watchdog will treat
        // this process's containers as foreign.
        let instance_id = match lookup("DOCKFLEET_INSTANCE_ID") {
            Some(s) => s
                .parse::<FleetInstanceId>()
                .with_context(|| format!("invalid DOCKFLEET_INSTANCE_ID {s:?}"))?,
            None => {
                let id = FleetInstanceId::new();
                warn!(instance_id = %id, "DOCKFLEET_INSTANCE_ID not set, generated a new one");
                id
            }
        };

        let fleet_path = lookup("DOCKFLEET_CONFIG")
            .map_or_else(|| PathBuf::from("/etc/dockfleet/fleet.toml"), PathBuf::from);

        let dry_run = lookup("DOCKFLEET_DRY_RUN")
            .is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes"));

        Ok(Self {
            fleet_path,
            instance_id,
            watchdog_interval: Duration::from_secs(number("DOCKFLEET_WATCHDOG_INTERVAL_SECS", 300).max(1)),
            watchdog_grace: Duration::from_secs(number("DOCKFLEET_WATCHDOG_GRACE_SECS", 60)),
            client_idle: Duration::from_secs(number("DOCKFLEET_CLIENT_IDLE_SECS", 300).max(1)),
            provision_workers: number("DOCKFLEET_PROVISION_WORKERS", 8).max(1) as usize,
            disable_duration: Duration::from_millis(number("DOCKFLEET_DISABLE_DURATION_MS", 300_000)),
            retention_interval: Duration::from_secs(number("DOCKFLEET_RETENTION_INTERVAL_SECS", 60).max(1)),
            dry_run,
        })
    }
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_executors() -> u32 {
    1
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_name_prefix() -> String {
    "docker".to_string()
}

/// Static fleet definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetSpec {
    #[serde(default, rename = "cloud")]
    pub clouds: Vec<CloudSpec>,
}

/// One cloud in the fleet definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudSpec {
    pub name: CloudName,
    pub uri: String,
    #[serde(default)]
    pub credentials_id: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Zero or absent means unbounded.
    #[serde(default)]
    pub container_cap: Option<u32>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, rename = "template")]
    pub templates: Vec<TemplateSpec>,
}

/// One template in the fleet definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateSpec {
    pub name: TemplateName,
    pub image: String,
    /// Whitespace-separated label set.
    #[serde(default)]
    pub labels: String,
    /// Zero or absent means unbounded.
    #[serde(default)]
    pub instance_cap: Option<u32>,
    #[serde(default = "default_executors")]
    pub executors: u32,
    #[serde(default)]
    pub mode: UsageMode,
    #[serde(default)]
    pub connector: Connector,
    #[serde(default)]
    pub remove_volumes: bool,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub disabled: bool,
}

impl FleetSpec {
    /// Parse and validate a fleet definition.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let spec: Self = toml::from_str(s).context("failed to parse fleet definition")?;
        spec.validate()?;
        Ok(spec)
    }

    /// Read, parse and validate a fleet definition file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fleet definition {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut cloud_names = BTreeSet::new();
        for cloud in &self.clouds {
            if !cloud_names.insert(cloud.name.as_str()) {
                bail!("duplicate cloud {}", cloud.name);
            }
            DockerEndpoint::parse(&cloud.uri)
                .with_context(|| format!("cloud {} has an invalid uri", cloud.name))?;

            let mut template_names = BTreeSet::new();
            for template in &cloud.templates {
                if !template_names.insert(template.name.as_str()) {
                    bail!("duplicate template {} in cloud {}", template.name, cloud.name);
                }
                if template.image.trim().is_empty() {
                    bail!("template {} has no image", template.name);
                }
                if template.executors == 0 {
                    bail!("template {} must have at least one executor", template.name);
                }
                validate_name("name prefix", &template.name_prefix)
                    .with_context(|| format!("template {}", template.name))?;
            }
        }
        Ok(())
    }

    /// Build the runtime model of the fleet.
    pub fn build(&self) -> Vec<Cloud> {
        self.clouds.iter().map(CloudSpec::build).collect()
    }
}

fn cap(value: Option<u32>) -> Option<u32> {
    value.filter(|&c| c > 0)
}

impl CloudSpec {
    fn endpoint(&self) -> ClientKey {
        ClientKey {
            uri: self.uri.clone(),
            credentials_id: self.credentials_id.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
        }
    }

    fn build(&self) -> Cloud {
        let templates = self.templates.iter().map(TemplateSpec::build).collect();
        let cloud = Cloud::new(
            self.name.clone(),
            self.endpoint(),
            cap(self.container_cap),
            templates,
        );
        cloud.disabled.set_disabled_by_choice(self.disabled);
        cloud
    }
}

impl TemplateSpec {
    fn build(&self) -> Template {
        Template {
            name: self.name.clone(),
            image: self.image.clone(),
            labels: label_set(&self.labels),
            instance_cap: cap(self.instance_cap),
            executors: self.executors,
            mode: self.mode,
            connector: self.connector.clone(),
            remove_volumes: self.remove_volumes,
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            name_prefix: self.name_prefix.clone(),
            cmd: self.cmd.clone(),
            env: self.env.clone(),
            retention: self.retention,
            disabled: DisabledState::new(self.disabled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FLEET: &str = r#"
[[cloud]]
name = "local"
uri = "unix:///var/run/docker.sock"
container_cap = 4

[[cloud.template]]
name = "jdk17"
image = "eclipse-temurin:17"
labels = "docker jdk17"
instance_cap = 2

[[cloud.template]]
name = "gpu"
image = "cuda:12"
labels = "gpu"
mode = "exclusive"
executors = 2
instance_cap = 0
remove_volumes = true
connector = { type = "ssh", port = 2222 }
retention = { type = "once" }

[[cloud]]
name = "remote"
uri = "tcp://10.0.0.5:2376"
disabled = true
"#;

    #[test]
    fn test_parse_fleet() {
        let spec = FleetSpec::from_toml_str(FLEET).unwrap();
        let clouds = spec.build();
        assert_eq!(clouds.len(), 2);

        let local = &clouds[0];
        assert_eq!(local.container_cap, Some(4));
        assert_eq!(local.endpoint.read_timeout, Duration::from_secs(60));

        let jdk = local.template("jdk17").unwrap();
        assert_eq!(jdk.instance_cap, Some(2));
        assert_eq!(jdk.executors, 1);
        assert_eq!(jdk.name_prefix, "docker");
        assert!(jdk.labels.contains("jdk17"));

        assert_eq!(jdk.retention, RetentionPolicy::Idle { idle_minutes: 10 });

        let gpu = local.template("gpu").unwrap();
        assert_eq!(gpu.retention, RetentionPolicy::Once { idle_minutes: 10 });
        assert_eq!(gpu.instance_cap, None);
        assert_eq!(gpu.mode, UsageMode::Exclusive);
        assert_eq!(
            gpu.connector,
            Connector::Ssh {
                port: 2222,
                credentials_id: None
            }
        );

        assert!(clouds[1].disabled.disabled_by_choice());
        assert!(clouds[1].templates.is_empty());
    }

    #[test]
    fn test_rejects_zero_executors() {
        let raw = r#"
[[cloud]]
name = "local"
uri = "unix:///var/run/docker.sock"

[[cloud.template]]
name = "t"
image = "alpine"
executors = 0
"#;
        let err = FleetSpec::from_toml_str(raw).unwrap_err();
        assert!(format!("{err:#}").contains("at least one executor"));
    }

    #[test]
    fn test_rejects_duplicate_cloud() {
        let raw = r#"
[[cloud]]
name = "local"
uri = "unix:///var/run/docker.sock"

[[cloud]]
name = "local"
uri = "unix:///var/run/docker.sock"
"#;
        assert!(FleetSpec::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_rejects_bad_names_and_uris() {
        let bad_name = "[[cloud]]\nname = \"Local\"\nuri = \"unix:///x\"\n";
        assert!(FleetSpec::from_toml_str(bad_name).is_err());

        let bad_uri = "[[cloud]]\nname = \"local\"\nuri = \"ftp://x\"\n";
        assert!(FleetSpec::from_toml_str(bad_uri).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FLEET.as_bytes()).unwrap();

        let spec = FleetSpec::load(file.path()).unwrap();
        assert_eq!(spec.clouds.len(), 2);

        let missing = FleetSpec::load(Path::new("/nonexistent/fleet.toml")).unwrap_err();
        assert!(missing.to_string().contains("failed to read"));
    }

    #[test]
    fn test_env_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.fleet_path, PathBuf::from("/etc/dockfleet/fleet.toml"));
        assert_eq!(config.watchdog_interval, Duration::from_secs(300));
        assert_eq!(config.watchdog_grace, Duration::from_secs(60));
        assert_eq!(config.client_idle, Duration::from_secs(300));
        assert_eq!(config.provision_workers, 8);
        assert_eq!(config.disable_duration, Duration::from_millis(300_000));
        assert_eq!(config.retention_interval, Duration::from_secs(60));
        assert!(!config.dry_run);
    }

    #[test]
    fn test_env_overrides() {
        let id = FleetInstanceId::new();
        let vars = BTreeMap::from([
            ("DOCKFLEET_INSTANCE_ID", id.to_string()),
            ("DOCKFLEET_WATCHDOG_GRACE_SECS", "5".to_string()),
            ("DOCKFLEET_PROVISION_WORKERS", "not-a-number".to_string()),
            ("DOCKFLEET_DRY_RUN", "true".to_string()),
        ]);
        let config = Config::from_lookup(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.instance_id, id);
        assert_eq!(config.watchdog_grace, Duration::from_secs(5));
        assert_eq!(config.provision_workers, 8);
        assert!(config.dry_run);

        let bad = Config::from_lookup(|k| (k == "DOCKFLEET_INSTANCE_ID").then(|| "nope".to_string()));
        assert!(bad.is_err());
    }
}
