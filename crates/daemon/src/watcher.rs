//! Config file change notifications
//!
//! Watches the directory holding the mesh config rather than the file
//! itself, so editors that save by rename-and-replace are still seen.

use meshsync_common::{Error, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Queue depth between the watcher thread and the reload driver. Events
/// beyond this are dropped; the driver coalesces bursts anyway.
const EVENT_QUEUE: usize = 16;

/// Something happened to the watched file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Modified,
    /// The watch itself reported a problem
    Error(String),
}

/// Watches one file and reports changes over a channel
pub struct FileWatcher {
    path: PathBuf,
    // Dropping the watcher stops the notifications
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Start watching `path`
    pub fn watch(path: &Path) -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| Error::Internal(format!("not a file path: {}", path.display())))?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) if is_change_of(&event, &file_name) => ChangeEvent::Modified,
                Ok(_) => return,
                Err(e) => ChangeEvent::Error(e.to_string()),
            };
            // Full queue means a reload is already pending
            let _ = tx.try_send(event);
        })
        .map_err(|e| Error::Internal(format!("failed to initialize file watcher: {}", e)))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Internal(format!("failed to watch {}: {}", dir.display(), e)))?;

        info!(path = %path.display(), "File watcher started");
        Ok((
            Self {
                path: path.to_path_buf(),
                _watcher: watcher,
            },
            rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_change_of(event: &Event, file_name: &OsString) -> bool {
    let relevant_kind = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_));
    let ours = event
        .paths
        .iter()
        .any(|p| p.file_name().map_or(false, |n| n == file_name.as_os_str()));

    if relevant_kind && ours {
        debug!(kind = ?event.kind, "Config file changed");
    }
    relevant_kind && ours
}
