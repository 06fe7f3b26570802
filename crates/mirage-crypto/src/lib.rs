//! Cryptographic primitives for the Mirage streaming protocol.
//!
//! Covers the three security layers of a session:
//! identity (long-term Ed25519 signing keys with SHA-256 fingerprints),
//! handshake key agreement (ephemeral X25519 + HKDF media key derivation),
//! and media packet protection (AES-256-GCM with deterministic nonces).

pub mod agreement;
pub mod device;
pub mod error;
pub mod identity;
pub mod media;
pub mod replay;

pub use error::CryptoError;
pub use media::{Direction, MediaCipher, GCM_TAG_SIZE};
