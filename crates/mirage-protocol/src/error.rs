use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic in datagram header")]
    BadMagic,

    #[error("datagram shorter than the fixed header: {got} bytes")]
    ShortHeader { got: usize },

    #[error("payload length mismatch: header says {expected}, datagram carries {got}")]
    PayloadLengthMismatch { expected: usize, got: usize },

    #[error("payload CRC mismatch")]
    CrcMismatch,

    #[error("AEAD verification failed")]
    AeadMismatch,

    #[error("encrypted payload but no media key installed")]
    MissingKey,

    #[error("frame of {byte_count} bytes exceeds the fragment count limit")]
    FrameTooLarge { byte_count: usize },

    #[error("control message too large: {0} bytes (max 65536)")]
    MessageTooLarge(usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<mirage_crypto::CryptoError> for ProtocolError {
    fn from(_: mirage_crypto::CryptoError) -> Self {
        // The only crypto failure reachable from the packet path is an AEAD
        // seal/open failure; key installation errors are caught at session
        // setup.
        ProtocolError::AeadMismatch
    }
}
