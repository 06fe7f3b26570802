//! Persistent device identity.
//!
//! A Mirage endpoint is identified by a 16-byte device id (a UUID minted on
//! first launch) and its long-term signing key. Both are written once to
//! the platform data directory and reused across sessions, so a host can
//! recognise a returning client without re-pairing.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, StoredIdentityKeyPair};

const IDENTITY_FILE: &str = "identity.bin";

/// On-disk form of the device identity.
#[derive(Serialize, Deserialize)]
struct StoredDeviceIdentity {
    device_id: [u8; 16],
    key_pair: StoredIdentityKeyPair,
}

/// A device's stable identity: id plus signing key pair.
pub struct DeviceIdentity {
    pub device_id: Uuid,
    pub key_pair: IdentityKeyPair,
}

impl DeviceIdentity {
    /// Load the identity from `dir`, or mint and persist a fresh one.
    pub fn load_or_create(dir: &Path) -> Result<Self, CryptoError> {
        let path = dir.join(IDENTITY_FILE);
        match fs::read(&path) {
            Ok(bytes) => {
                let stored: StoredDeviceIdentity = postcard::from_bytes(&bytes)?;
                let key_pair = stored.key_pair.to_key_pair()?;
                debug!(path = %path.display(), "loaded device identity");
                Ok(Self {
                    device_id: Uuid::from_bytes(stored.device_id),
                    key_pair,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate()?;
                identity.persist(&path)?;
                info!(device_id = %identity.device_id, "created new device identity");
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Default state directory: `<platform data dir>/mirage`.
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mirage")
    }

    fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            device_id: Uuid::new_v4(),
            key_pair: IdentityKeyPair::generate()?,
        })
    }

    fn persist(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let stored = StoredDeviceIdentity {
            device_id: *self.device_id.as_bytes(),
            key_pair: self.key_pair.to_stored(),
        };
        let bytes =
            postcard::to_allocvec(&stored).map_err(CryptoError::Persistence)?;
        fs::write(path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_then_reloads_same_identity() {
        let dir = tempfile::tempdir().unwrap();

        let first = DeviceIdentity::load_or_create(dir.path()).unwrap();
        let second = DeviceIdentity::load_or_create(dir.path()).unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.key_pair.public_key(), second.key_pair.public_key());
    }

    #[test]
    fn distinct_dirs_get_distinct_identities() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();

        let ia = DeviceIdentity::load_or_create(a.path()).unwrap();
        let ib = DeviceIdentity::load_or_create(b.path()).unwrap();
        assert_ne!(ia.device_id, ib.device_id);
    }

    #[test]
    fn corrupt_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(IDENTITY_FILE), b"not postcard").unwrap();
        assert!(DeviceIdentity::load_or_create(dir.path()).is_err());
    }
}
