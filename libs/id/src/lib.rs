//! # dockfleet-id
//!
//! Stable ID and name types for the dockfleet provisioning engine.
//!
//! ## Two kinds of identifier
//!
//! - **Generated IDs** (`{prefix}_{ulid}`) are minted by the fleet manager
//!   itself: the fleet instance id stamped on every container it owns, and
//!   the id embedded in each node name.
//! - **Names** are operator-chosen identifiers from the fleet definition
//!   (clouds and templates). They are validated but never generated.
//!
//! Examples:
//! - `fleet_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `node_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `docker-local` (a cloud name)

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::{validate_name, MAX_NAME_LEN};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
