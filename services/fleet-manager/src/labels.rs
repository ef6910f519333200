//! Container label keys.
//!
//! Every container the fleet manager creates is stamped with these labels.
//! The watchdog relies on them to find its own containers and to map each
//! one back to the node it was created for.

use std::collections::BTreeMap;

use dockfleet_id::{CloudName, FleetInstanceId, TemplateName};

/// Namespace shared by every key below.
pub const NAMESPACE: &str = "io.dockfleet.";

/// Id of the fleet manager process that owns the container.
pub const OWNER_INSTANCE_ID: &str = "io.dockfleet.owner-instance-id";

pub const CLOUD: &str = "io.dockfleet.cloud";

pub const TEMPLATE: &str = "io.dockfleet.template";

/// Image the container was created from.
pub const IMAGE: &str = "io.dockfleet.image";

/// Name of the node the container backs.
pub const NODE_NAME: &str = "io.dockfleet.node-name";

/// Whether volumes are removed along with the container.
pub const REMOVE_VOLUMES: &str = "io.dockfleet.remove-volumes";

/// Identity of a container being created.
#[derive(Debug, Clone)]
pub struct ContainerIdentity<'a> {
    pub owner: FleetInstanceId,
    pub cloud: &'a CloudName,
    pub template: &'a TemplateName,
    pub image: &'a str,
    pub node_name: &'a str,
    pub remove_volumes: bool,
}

impl ContainerIdentity<'_> {
    /// Render the identity as container labels.
    pub fn to_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (OWNER_INSTANCE_ID.to_string(), self.owner.to_string()),
            (CLOUD.to_string(), self.cloud.to_string()),
            (TEMPLATE.to_string(), self.template.to_string()),
            (IMAGE.to_string(), self.image.to_string()),
            (NODE_NAME.to_string(), self.node_name.to_string()),
            (REMOVE_VOLUMES.to_string(), self.remove_volumes.to_string()),
        ])
    }
}

/// Read the remove-volumes flag back from a label set.
pub fn remove_volumes(labels: &BTreeMap<String, String>) -> bool {
    labels
        .get(REMOVE_VOLUMES)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_keys_namespaced() {
        for key in [OWNER_INSTANCE_ID, CLOUD, TEMPLATE, IMAGE, NODE_NAME, REMOVE_VOLUMES] {
            assert!(key.starts_with(NAMESPACE), "{key}");
        }
    }

    #[test]
    fn test_identity_labels() {
        let owner = FleetInstanceId::new();
        let cloud = CloudName::parse("local").unwrap();
        let template = TemplateName::parse("jdk17").unwrap();
        let labels = ContainerIdentity {
            owner,
            cloud: &cloud,
            template: &template,
            image: "builder:17",
            node_name: "docker-abc",
            remove_volumes: true,
        }
        .to_labels();

        assert_eq!(labels[OWNER_INSTANCE_ID], owner.to_string());
        assert_eq!(labels[NODE_NAME], "docker-abc");
        assert!(remove_volumes(&labels));
        assert!(!remove_volumes(&BTreeMap::new()));
    }
}
