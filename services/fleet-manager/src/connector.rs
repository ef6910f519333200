//! How a scheduler agent connects to a freshly started container.
//!
//! Hooks per connector:
//! - `before_create`: adjust the container spec
//! - `after_start`: verify the running container
//! - `launcher`: describe how the scheduler should launch its agent
//!
//! The launch itself is the scheduler's business.

use serde::{Deserialize, Serialize};

use crate::runtime::{ContainerRuntime, CreateSpec, RuntimeError};

fn default_ssh_port() -> u16 {
    22
}

/// Connector selected by a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Connector {
    /// The scheduler attaches to the container's stdin/stdout.
    Attach {
        #[serde(default)]
        user: Option<String>,
    },

    /// The scheduler connects to an SSH daemon inside the container.
    Ssh {
        #[serde(default = "default_ssh_port")]
        port: u16,
        #[serde(default)]
        credentials_id: Option<String>,
    },

    /// The agent inside the container dials back to the controller.
    Jnlp {
        controller_url: String,
        #[serde(default)]
        work_dir: Option<String>,
    },
}

impl Default for Connector {
    fn default() -> Self {
        Self::Attach { user: None }
    }
}

/// Launch descriptor handed to the scheduler with a new node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Launcher {
    Attach {
        container_id: String,
        user: Option<String>,
    },
    Ssh {
        container_id: String,
        port: u16,
        credentials_id: Option<String>,
    },
    Jnlp {
        node_name: String,
    },
}

impl Connector {
    /// Adjust the container spec before it is created.
    pub fn before_create(&self, spec: &mut CreateSpec, node_name: &str) {
        match self {
            Self::Attach { .. } => {
                spec.open_stdin = true;
            }
            Self::Ssh { port, .. } => {
                spec.env
                    .insert("DOCKFLEET_SSH_PORT".to_string(), port.to_string());
            }
            Self::Jnlp {
                controller_url,
                work_dir,
            } => {
                spec.env
                    .insert("DOCKFLEET_AGENT_NAME".to_string(), node_name.to_string());
                spec.env
                    .insert("DOCKFLEET_CONTROLLER_URL".to_string(), controller_url.clone());
                if let Some(dir) = work_dir {
                    spec.env
                        .insert("DOCKFLEET_AGENT_WORKDIR".to_string(), dir.clone());
                }
            }
        }
    }

    /// Verify the container once started.
    ///
    /// An SSH agent needs the container to stay up long enough for the
    /// scheduler to dial in, so a container that exited straight away is
    /// reported as a start failure.
    pub async fn after_start(
        &self,
        runtime: &dyn ContainerRuntime,
        container_id: &str,
    ) -> Result<(), RuntimeError> {
        match self {
            Self::Ssh { .. } => {
                let details = runtime.inspect(container_id).await?;
                if details.running {
                    Ok(())
                } else {
                    Err(RuntimeError::Unavailable(format!(
                        "container {container_id} exited before sshd came up"
                    )))
                }
            }
            Self::Attach { .. } | Self::Jnlp { .. } => Ok(()),
        }
    }

    /// Describe how the scheduler should launch its agent.
    pub fn launcher(&self, container_id: &str, node_name: &str) -> Launcher {
        match self {
            Self::Attach { user } => Launcher::Attach {
                container_id: container_id.to_string(),
                user: user.clone(),
            },
            Self::Ssh {
                port,
                credentials_id,
            } => Launcher::Ssh {
                container_id: container_id.to_string(),
                port: *port,
                credentials_id: credentials_id.clone(),
            },
            Self::Jnlp { .. } => Launcher::Jnlp {
                node_name: node_name.to_string(),
            },
        }
    }
}
