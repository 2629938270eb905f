//! Mesh config file loading, saving and backups
//!
//! The mesh config is YAML:
//!
//! ```yaml
//! network_name: wg0
//! listen_port: 51820
//! private_key: <base64>
//! peers:
//!   - name: laptop
//!     ip: 10.0.0.2/24
//!     public_key: <base64>
//!     allowed_ips: ["10.0.0.2/32"]
//!     endpoint: laptop.example.net:51820
//!     port: 25
//!     nat: true
//! ```

use crate::types::MeshSpec;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Timestamp format appended to backup file names
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

impl MeshSpec {
    /// Parse and validate a mesh config document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let spec: MeshSpec = serde_yaml::from_str(content)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Serialize to the config file format
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Schema-level checks: names present and unique
    pub fn validate(&self) -> Result<()> {
        if self.network_name.trim().is_empty() {
            return Err(Error::ConfigParse("network_name is required".to_string()));
        }

        let mut seen = HashSet::new();
        for (idx, peer) in self.peers.iter().enumerate() {
            if peer.name.trim().is_empty() {
                return Err(Error::ConfigParse(format!("peer #{} has no name", idx + 1)));
            }
            if !seen.insert(peer.name.as_str()) {
                return Err(Error::ConfigParse(format!(
                    "duplicate peer name: {}",
                    peer.name
                )));
            }
        }

        Ok(())
    }
}

/// Load a mesh config file
pub fn load_mesh_spec(path: impl AsRef<Path>) -> Result<MeshSpec> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigLoad {
        path: path.to_path_buf(),
        source,
    })?;
    let spec = MeshSpec::from_yaml(&content)?;
    debug!(path = %path.display(), peers = spec.peers.len(), "Loaded mesh config");
    Ok(spec)
}

/// Write a mesh config file readable by the owner only; it holds private keys.
pub fn save_mesh_spec(path: impl AsRef<Path>, spec: &MeshSpec) -> Result<()> {
    let content = spec.to_yaml()?;
    write_private(path.as_ref(), content.as_bytes())?;
    Ok(())
}

/// `<config>.backup_<YYYYMMDDHHMMSS>`, placed in `backup_dir` when given,
/// otherwise next to the config file.
pub fn backup_path(config_path: &Path, backup_dir: Option<&Path>, at: DateTime<Utc>) -> PathBuf {
    let file_name = config_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mesh.yaml".to_string());
    let backup_name = format!("{}.backup_{}", file_name, at.format(BACKUP_TIMESTAMP_FORMAT));

    match backup_dir {
        Some(dir) => dir.join(backup_name),
        None => config_path.with_file_name(backup_name),
    }
}

/// Persist `spec` as a timestamped backup of `config_path`
pub fn write_backup(
    spec: &MeshSpec,
    config_path: &Path,
    backup_dir: Option<&Path>,
    at: DateTime<Utc>,
) -> Result<PathBuf> {
    let path = backup_path(config_path, backup_dir, at);
    let content = spec.to_yaml()?;

    write_private(&path, content.as_bytes()).map_err(|source| Error::BackupWrite {
        path: path.clone(),
        source,
    })?;

    debug!(path = %path.display(), "Wrote config backup");
    Ok(path)
}

fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}
