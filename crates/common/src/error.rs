//! Error types for MeshSync

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using MeshSync Error
pub type Result<T> = std::result::Result<T, Error>;

/// MeshSync error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read config {}: {source}", path.display())]
    ConfigLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid mesh config: {0}")]
    ConfigParse(String),

    #[error("Invalid key for peer {peer}: {reason}")]
    InvalidKey { peer: String, reason: String },

    #[error("Invalid allowed IP {entry:?} for peer {peer}: {reason}")]
    InvalidCidr {
        peer: String,
        entry: String,
        reason: String,
    },

    #[error("Invalid endpoint {endpoint:?} for peer {peer}: {reason}")]
    InvalidEndpoint {
        peer: String,
        endpoint: String,
        reason: String,
    },

    #[error("Failed to configure device: {0}")]
    ControllerApply(String),

    #[error("Failed to write config backup {}: {source}", path.display())]
    BackupWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Per-peer validation failures; these never abort a reconciliation batch.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidKey { .. } | Error::InvalidCidr { .. } | Error::InvalidEndpoint { .. }
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::ConfigParse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_kinds() {
        let key = Error::InvalidKey {
            peer: "a".to_string(),
            reason: "bad".to_string(),
        };
        assert!(key.is_validation());

        let apply = Error::ControllerApply("device busy".to_string());
        assert!(!apply.is_validation());
        assert!(!Error::ConfigParse("x".to_string()).is_validation());
    }

    #[test]
    fn test_messages_name_the_peer() {
        let err = Error::InvalidCidr {
            peer: "laptop".to_string(),
            entry: "10.0.0.0/33".to_string(),
            reason: "prefix too long".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("laptop"));
        assert!(msg.contains("10.0.0.0/33"));
    }
}
