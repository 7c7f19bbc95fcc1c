//! Persisted device identity and session token cache
//!
//! Both files are produced by the activation collaborator; the core only
//! consumes them. A missing identity file is created with a fresh UUID so
//! first-run development works without activation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::ConfigError;

/// Device identity: a stable UUID plus a MAC-derived serial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable client UUID
    pub client_id: Uuid,
    /// MAC-derived serial, written by the activation flow
    pub serial: String,
}

impl DeviceIdentity {
    /// Load the identity file, creating one with a fresh UUID if absent.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if path.exists() {
            let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            return serde_json::from_str(&data).map_err(|e| ConfigError::Load(e.to_string()));
        }

        let identity = Self {
            client_id: Uuid::new_v4(),
            serial: String::new(),
        };
        identity.store(path)?;
        tracing::info!(client_id = %identity.client_id, "created new device identity");
        Ok(identity)
    }

    /// Persist the identity file.
    pub fn store(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Load(e.to_string()))?;
        std::fs::write(path, data).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Device id reported in transport headers
    pub fn device_id(&self) -> String {
        if self.serial.is_empty() {
            self.client_id.to_string()
        } else {
            self.serial.clone()
        }
    }
}

/// Cached session token written by the activation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenCache {
    pub access_token: String,
}

impl TokenCache {
    /// Load the token cache; empty token when the file is absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&data).map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("efuse.json");

        let created = DeviceIdentity::load_or_create(&path).unwrap();
        let loaded = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(created.client_id, loaded.client_id);
    }

    #[test]
    fn test_device_id_prefers_serial() {
        let identity = DeviceIdentity {
            client_id: Uuid::new_v4(),
            serial: "a0:b1:c2:d3:e4:f5".into(),
        };
        assert_eq!(identity.device_id(), "a0:b1:c2:d3:e4:f5");
    }

    #[test]
    fn test_missing_token_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::load(dir.path().join("token.json")).unwrap();
        assert!(cache.is_empty());
    }
}
