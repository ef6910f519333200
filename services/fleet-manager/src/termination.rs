//! Stopping and removing containers.
//!
//! Shared by node termination, the watchdog's orphan cleanup, and the
//! provisioning engine's partial-failure cleanup. A container that has
//! already disappeared counts as success.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::runtime::{ContainerRuntime, RemoveOptions, RuntimeError};

/// Outcome of a termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The container was removed by this call.
    Removed,
    /// The container no longer existed.
    AlreadyGone,
}

/// Stop a container gracefully, then remove it.
///
/// If the graceful stop fails for any reason other than the container being
/// gone, removal is forced.
pub async fn stop_and_remove(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    stop_timeout: Duration,
    remove_volumes: bool,
) -> Result<Termination, RuntimeError> {
    let force = match runtime.stop(container_id, stop_timeout).await {
        Ok(()) => false,
        Err(e) if e.is_not_found() => {
            debug!(container_id = %container_id, "Container already gone before stop");
            return Ok(Termination::AlreadyGone);
        }
        Err(e) => {
            warn!(container_id = %container_id, error = %e, "Graceful stop failed, forcing removal");
            true
        }
    };

    let options = RemoveOptions {
        force,
        volumes: remove_volumes,
    };
    match runtime.remove(container_id, options).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Ok(Termination::AlreadyGone),
        Err(e) if !force => {
            warn!(container_id = %container_id, error = %e, "Removal failed, retrying with force");
            force_remove(runtime, container_id, remove_volumes).await?;
        }
        Err(e) => return Err(e),
    }

    info!(container_id = %container_id, "Container stopped and removed");
    Ok(Termination::Removed)
}

/// Kill and remove a container in one call.
pub async fn force_remove(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    remove_volumes: bool,
) -> Result<Termination, RuntimeError> {
    let options = RemoveOptions {
        force: true,
        volumes: remove_volumes,
    };
    match runtime.remove(container_id, options).await {
        Ok(()) => Ok(Termination::Removed),
        Err(e) if e.is_not_found() => Ok(Termination::AlreadyGone),
        Err(e) => Err(e),
    }
}
