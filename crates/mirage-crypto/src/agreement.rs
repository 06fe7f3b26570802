//! Handshake key agreement and media key derivation.
//!
//! Each side contributes an ephemeral X25519 key (carried in its signed
//! identity envelope) and a random nonce. The session media key is
//! HKDF-SHA256 over the ECDH shared secret, salted with both nonces and
//! bound to the UDP registration token, so a session's media key can never
//! collide with another session's even under nonce reuse by a buggy peer.

use hkdf::Hkdf;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Domain separation label for the session media key.
const MEDIA_KEY_LABEL: &[u8] = b"mirage media key v1";

/// Domain separation label for the per-session packet subkey.
const PACKET_KEY_LABEL: &[u8] = b"mirage packet key v1";

/// An ephemeral X25519 key pair held for the duration of one handshake.
pub struct EphemeralDh {
    private: EphemeralPrivateKey,
    public: Vec<u8>,
}

impl EphemeralDh {
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let private =
            EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| CryptoError::Rng)?;
        let public = private
            .compute_public_key()
            .map_err(|_| CryptoError::Rng)?
            .as_ref()
            .to_vec();
        Ok(Self { private, public })
    }

    /// 32-byte X25519 public key to embed in the signed envelope.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Complete the agreement against the peer's public key.
    ///
    /// Consumes the private key; a handshake key is used exactly once.
    pub fn agree(self, peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let peer = UnparsedPublicKey::new(&X25519, peer_public);
        agree_ephemeral(self.private, &peer, |secret| {
            let mut out = Zeroizing::new([0u8; 32]);
            out.copy_from_slice(secret);
            out
        })
        .map_err(|_| CryptoError::KeyMaterial("X25519 agreement failed"))
    }
}

/// Derive the 256-bit session media key.
///
/// `host_nonce` and `client_nonce` are the handshake nonces from the two
/// identity envelopes; `registration_token` is the 32-byte UDP registration
/// token issued in the hello response. Both sides derive the same key.
pub fn derive_media_key(
    shared_secret: &[u8; 32],
    host_nonce: &[u8; 16],
    client_nonce: &[u8; 16],
    registration_token: &[u8; 32],
) -> Zeroizing<[u8; 32]> {
    let mut salt = [0u8; 32];
    salt[..16].copy_from_slice(host_nonce);
    salt[16..].copy_from_slice(client_nonce);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);

    let mut info = Vec::with_capacity(MEDIA_KEY_LABEL.len() + 32);
    info.extend_from_slice(MEDIA_KEY_LABEL);
    info.extend_from_slice(registration_token);

    let mut key = Zeroizing::new([0u8; 32]);
    let Ok(()) = hkdf.expand(&info, key.as_mut()) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    key
}

/// Derive the packet subkey actually installed into the AEAD cipher.
///
/// Keeping the media key itself out of the datagram path means a future
/// protocol version can derive further subkeys (audio, retransmit) from the
/// same session secret.
pub fn derive_packet_key(media_key: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, media_key);
    let mut key = Zeroizing::new([0u8; 32]);
    let Ok(()) = hkdf.expand(PACKET_KEY_LABEL, key.as_mut()) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        let host = EphemeralDh::generate().unwrap();
        let client = EphemeralDh::generate().unwrap();

        let host_pub = host.public_key().to_vec();
        let client_pub = client.public_key().to_vec();

        let s1 = host.agree(&client_pub).unwrap();
        let s2 = client.agree(&host_pub).unwrap();
        assert_eq!(*s1, *s2);
    }

    #[test]
    fn media_key_derivation_is_symmetric() {
        let host = EphemeralDh::generate().unwrap();
        let client = EphemeralDh::generate().unwrap();
        let host_pub = host.public_key().to_vec();
        let client_pub = client.public_key().to_vec();

        let hn = [1u8; 16];
        let cn = [2u8; 16];
        let token = [3u8; 32];

        let k1 = derive_media_key(&host.agree(&client_pub).unwrap(), &hn, &cn, &token);
        let k2 = derive_media_key(&client.agree(&host_pub).unwrap(), &hn, &cn, &token);
        assert_eq!(*k1, *k2);
    }

    #[test]
    fn different_nonces_produce_different_keys() {
        let secret = [7u8; 32];
        let token = [3u8; 32];
        let k1 = derive_media_key(&secret, &[1u8; 16], &[2u8; 16], &token);
        let k2 = derive_media_key(&secret, &[1u8; 16], &[9u8; 16], &token);
        assert_ne!(*k1, *k2);
    }

    #[test]
    fn different_tokens_produce_different_keys() {
        let secret = [7u8; 32];
        let k1 = derive_media_key(&secret, &[1u8; 16], &[2u8; 16], &[3u8; 32]);
        let k2 = derive_media_key(&secret, &[1u8; 16], &[2u8; 16], &[4u8; 32]);
        assert_ne!(*k1, *k2);
    }

    #[test]
    fn packet_key_differs_from_media_key() {
        let media = [5u8; 32];
        let packet = derive_packet_key(&media);
        assert_ne!(*packet, media);
    }

    #[test]
    fn rejects_short_peer_key() {
        let dh = EphemeralDh::generate().unwrap();
        assert!(dh.agree(&[0u8; 16]).is_err());
    }
}
