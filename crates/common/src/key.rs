//! WireGuard key handling
//!
//! Keys are 32-byte Curve25519 values exchanged as standard base64.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of a WireGuard key in bytes
pub const KEY_LEN: usize = 32;

/// A WireGuard public, private or preshared key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; KEY_LEN]);

/// Why a key string was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    Empty,
    Base64(String),
    Length(usize),
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::Empty => write!(f, "key is empty"),
            KeyError::Base64(e) => write!(f, "not valid base64: {}", e),
            KeyError::Length(n) => {
                write!(f, "expected {} bytes, got {}", KEY_LEN, n)
            }
        }
    }
}

impl std::error::Error for KeyError {}

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encode as standard base64 (44 characters)
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Derive the public key, treating `self` as a private key
    pub fn public_key(&self) -> Key {
        let secret = StaticSecret::from(self.0);
        Key(PublicKey::from(&secret).to_bytes())
    }
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(KeyError::Empty);
        }
        let bytes = STANDARD
            .decode(s)
            .map_err(|e| KeyError::Base64(e.to_string()))?;
        let len = bytes.len();
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KeyError::Length(len))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_base64())
    }
}
