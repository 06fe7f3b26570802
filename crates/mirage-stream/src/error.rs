use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream stopped, pending waiters cancelled")]
    Cancelled,

    #[error("decoder rejected frame {frame_number}: {detail}")]
    Decode { frame_number: u32, detail: String },

    #[error("decoder worker is gone")]
    DecoderStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_display() {
        let e = StreamError::Decode {
            frame_number: 17,
            detail: "bitstream corrupt".into(),
        };
        assert!(e.to_string().contains("17"));
        assert!(e.to_string().contains("bitstream corrupt"));
    }
}
