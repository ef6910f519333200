//! Typed identifiers used across the fleet manager.
//!
//! Generated IDs are ULID-based for sortability and uniqueness. Names come
//! from the fleet definition and are validated on load.

use crate::{define_id, define_name};

// =============================================================================
// Generated IDs
// =============================================================================

// Stamped on every container this process creates so that independent fleet
// managers sharing one runtime never claim each other's containers.
define_id!(FleetInstanceId, "fleet");
define_id!(NodeId, "node");

// =============================================================================
// Operator-chosen names
// =============================================================================

define_name!(CloudName, "cloud name");
define_name!(TemplateName, "template name");

impl NodeId {
    /// Builds the unique node name `{prefix}-{short ulid}`.
    #[must_use]
    pub fn node_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.short())
    }
}

// =============================================================================
// Tests
// =============================================================================
