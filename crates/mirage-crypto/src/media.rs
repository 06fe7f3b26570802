//! AES-256-GCM protection for media datagrams.
//!
//! Every fragment is sealed under the per-session packet subkey with a
//! nonce built deterministically from packet coordinates. The nonce is
//! injective over `(stream_id, frame_number, fragment_index, direction)`,
//! which the sender guarantees by never reusing a frame/fragment pair
//! within a stream and by separating the two transfer directions.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use zeroize::Zeroizing;

use crate::agreement::derive_packet_key;
use crate::error::CryptoError;

/// AES-256-GCM authentication tag size appended to every sealed payload.
pub const GCM_TAG_SIZE: usize = 16;

/// Which way a packet travels. Part of the nonce, so a host→client packet
/// can never be replayed back as a client→host packet under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    HostToClient = 0,
    ClientToHost = 1,
}

/// Build the 12-byte nonce from packet coordinates.
fn build_nonce(
    stream_id: u32,
    frame_number: u32,
    fragment_index: u16,
    direction: Direction,
) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[0..4].copy_from_slice(&stream_id.to_be_bytes());
    nonce[4..8].copy_from_slice(&frame_number.to_be_bytes());
    nonce[8..10].copy_from_slice(&fragment_index.to_be_bytes());
    nonce[10] = direction as u8;
    Nonce::assume_unique_for_key(nonce)
}

/// A per-session AEAD cipher over the derived packet subkey.
pub struct MediaCipher {
    key: LessSafeKey,
}

impl MediaCipher {
    /// Install a cipher for a session, deriving the packet subkey from the
    /// session media key. Done once per session.
    pub fn from_media_key(media_key: &[u8; 32]) -> Result<Self, CryptoError> {
        let packet_key: Zeroizing<[u8; 32]> = derive_packet_key(media_key);
        let unbound = UnboundKey::new(&AES_256_GCM, packet_key.as_ref())
            .map_err(|_| CryptoError::KeyMaterial("invalid packet subkey"))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }

    /// Seal a fragment payload. Returns ciphertext with the 16-byte tag
    /// appended. `aad` binds the packet header (checksum field zeroed).
    pub fn seal(
        &self,
        stream_id: u32,
        frame_number: u32,
        fragment_index: u16,
        direction: Direction,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = build_nonce(stream_id, frame_number, fragment_index, direction);
        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::AeadMismatch)?;
        Ok(in_out)
    }

    /// Open a sealed fragment payload. Input is ciphertext + tag; returns
    /// the plaintext, or an error if authentication fails.
    pub fn open(
        &self,
        stream_id: u32,
        frame_number: u32,
        fragment_index: u16,
        direction: Direction,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < GCM_TAG_SIZE {
            return Err(CryptoError::AeadMismatch);
        }
        let nonce = build_nonce(stream_id, frame_number, fragment_index, direction);
        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::AeadMismatch)?;
        Ok(plaintext.to_vec())
    }
}
