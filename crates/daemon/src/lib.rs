//! MeshSync Daemon
//!
//! Keeps a WireGuard device's peer table in line with a declarative mesh
//! config, reloading it whenever the file changes.

pub mod adapter;
pub mod config;
pub mod controller;
pub mod monitor;
pub mod reconciler;
pub mod reload;
pub mod service;
pub mod state;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use config::{DaemonConfig, RemovalMode};
pub use controller::{NetworkController, WgController};
pub use service::MeshService;
