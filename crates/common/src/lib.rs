//! MeshSync Common Library
//!
//! Declared and observed mesh types, the mesh config file format, peer
//! diffing and the shared error type.

pub mod config;
pub mod diff;
pub mod error;
pub mod key;
pub mod types;

// Re-export commonly used types
pub use config::{backup_path, load_mesh_spec, save_mesh_spec, write_backup};
pub use diff::{diff_peers, PeerDiff, PeerUpdate};
pub use error::{Error, Result};
pub use key::{Key, KeyError};
pub use types::*;

/// MeshSync version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
