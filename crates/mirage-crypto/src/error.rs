use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD verification failed: wrong key, nonce reuse, or tampered payload")]
    AeadMismatch,

    #[error("signature verification failed")]
    BadSignature,

    #[error("key id does not match the public key fingerprint")]
    KeyIdMismatch,

    #[error("hello replayed: nonce already seen within the replay window")]
    Replayed,

    #[error("hello timestamp outside the accepted window: skew {skew_ms} ms")]
    StaleTimestamp { skew_ms: i64 },

    #[error("malformed key material: {0}")]
    KeyMaterial(&'static str),

    #[error("system RNG unavailable")]
    Rng,

    #[error("identity store error: {0}")]
    Io(#[from] std::io::Error),

    #[error("identity store corrupt: {0}")]
    Persistence(#[from] postcard::Error),
}
