//! Datagram codec: typed headers + payload in, wire bytes out, and back.
//!
//! Plaintext payloads are covered by CRC-32. When a session media cipher is
//! installed, payloads are sealed with AES-256-GCM instead and the checksum
//! field is zero; the header (checksum excluded) rides as associated data.
//! A non-zero checksum on an encrypted packet is honoured for compatibility
//! with senders that fill both.

use mirage_crypto::{Direction, MediaCipher, GCM_TAG_SIZE};

use crate::error::ProtocolError;
use crate::fragment::{
    AudioFragmentHeader, FragmentFlags, FragmentHeader, AUDIO_HEADER_SIZE, CHECKSUM_RANGE, MAGIC,
    VIDEO_HEADER_SIZE,
};
use crate::types::StreamId;

/// Serialize one fragment into a full datagram.
///
/// `header.payload_length`, `header.checksum` and the encryption flag are
/// derived here; callers fill the rest.
pub fn serialize_fragment(
    header: &FragmentHeader,
    payload: &[u8],
    cipher: Option<(&MediaCipher, Direction)>,
) -> Result<Vec<u8>, ProtocolError> {
    let mut header = *header;

    match cipher {
        Some((cipher, direction)) => {
            header.flags = header.flags.with(FragmentFlags::ENCRYPTED_PAYLOAD);
            header.checksum = 0;
            header.payload_length = (payload.len() + GCM_TAG_SIZE) as u32;

            let aad = header.aad_bytes();
            let sealed = cipher.seal(
                header.stream_id,
                header.frame_number,
                header.fragment_index,
                direction,
                &aad,
                payload,
            )?;

            let mut datagram = Vec::with_capacity(VIDEO_HEADER_SIZE + sealed.len());
            datagram.extend_from_slice(&header.encode());
            datagram.extend_from_slice(&sealed);
            Ok(datagram)
        }
        None => {
            header.flags = header.flags.without(FragmentFlags::ENCRYPTED_PAYLOAD);
            header.checksum = crc32fast::hash(payload);
            header.payload_length = payload.len() as u32;

            let mut datagram = Vec::with_capacity(VIDEO_HEADER_SIZE + payload.len());
            datagram.extend_from_slice(&header.encode());
            datagram.extend_from_slice(payload);
            Ok(datagram)
        }
    }
}

/// Parse and verify one datagram, returning the header and plaintext payload.
///
/// All failures are non-fatal at the session level: the caller drops the
/// packet, counts it, and keeps receiving.
pub fn deserialize_fragment(
    datagram: &[u8],
    cipher: Option<(&MediaCipher, Direction)>,
) -> Result<(FragmentHeader, Vec<u8>), ProtocolError> {
    let header = FragmentHeader::decode(datagram)?;

    let payload = &datagram[VIDEO_HEADER_SIZE..];
    if payload.len() != header.payload_length as usize {
        return Err(ProtocolError::PayloadLengthMismatch {
            expected: header.payload_length as usize,
            got: payload.len(),
        });
    }

    if header.flags.encrypted() {
        let Some((cipher, direction)) = cipher else {
            return Err(ProtocolError::MissingKey);
        };
        let aad = header.aad_bytes();
        let plaintext = cipher.open(
            header.stream_id,
            header.frame_number,
            header.fragment_index,
            direction,
            &aad,
            payload,
        )?;

        // Zero checksum means "AEAD only"; a non-zero checksum must also
        // match the plaintext.
        if header.checksum != 0 && crc32fast::hash(&plaintext) != header.checksum {
            return Err(ProtocolError::CrcMismatch);
        }
        Ok((header, plaintext))
    } else {
        if crc32fast::hash(payload) != header.checksum {
            return Err(ProtocolError::CrcMismatch);
        }
        Ok((header, payload.to_vec()))
    }
}

/// Serialize one audio fragment. Mirrors [`serialize_fragment`] over the
/// audio header layout.
pub fn serialize_audio_fragment(
    header: &AudioFragmentHeader,
    payload: &[u8],
    cipher: Option<(&MediaCipher, Direction)>,
) -> Result<Vec<u8>, ProtocolError> {
    let mut header = *header;

    match cipher {
        Some((cipher, direction)) => {
            header.flags = header.flags.with(FragmentFlags::ENCRYPTED_PAYLOAD);
            header.checksum = 0;
            header.payload_length = (payload.len() + GCM_TAG_SIZE) as u32;

            let aad = header.aad_bytes();
            let sealed = cipher.seal(
                header.stream_id,
                header.frame_number,
                header.fragment_index,
                direction,
                &aad,
                payload,
            )?;

            let mut datagram = Vec::with_capacity(AUDIO_HEADER_SIZE + sealed.len());
            datagram.extend_from_slice(&header.encode());
            datagram.extend_from_slice(&sealed);
            Ok(datagram)
        }
        None => {
            header.flags = header.flags.without(FragmentFlags::ENCRYPTED_PAYLOAD);
            header.checksum = crc32fast::hash(payload);
            header.payload_length = payload.len() as u32;

            let mut datagram = Vec::with_capacity(AUDIO_HEADER_SIZE + payload.len());
            datagram.extend_from_slice(&header.encode());
            datagram.extend_from_slice(payload);
            Ok(datagram)
        }
    }
}

/// Parse and verify one audio datagram.
pub fn deserialize_audio_fragment(
    datagram: &[u8],
    cipher: Option<(&MediaCipher, Direction)>,
) -> Result<(AudioFragmentHeader, Vec<u8>), ProtocolError> {
    let header = AudioFragmentHeader::decode(datagram)?;

    let payload = &datagram[AUDIO_HEADER_SIZE..];
    if payload.len() != header.payload_length as usize {
        return Err(ProtocolError::PayloadLengthMismatch {
            expected: header.payload_length as usize,
            got: payload.len(),
        });
    }

    if header.flags.encrypted() {
        let Some((cipher, direction)) = cipher else {
            return Err(ProtocolError::MissingKey);
        };
        let aad = header.aad_bytes();
        let plaintext = cipher.open(
            header.stream_id,
            header.frame_number,
            header.fragment_index,
            direction,
            &aad,
            payload,
        )?;
        if header.checksum != 0 && crc32fast::hash(&plaintext) != header.checksum {
            return Err(ProtocolError::CrcMismatch);
        }
        Ok((header, plaintext))
    } else {
        if crc32fast::hash(payload) != header.checksum {
            return Err(ProtocolError::CrcMismatch);
        }
        Ok((header, payload.to_vec()))
    }
}

/// Size of the UDP registration datagram.
pub const REGISTRATION_SIZE: usize = 24;

/// First datagram a client sends on the data socket; the host uses it to
/// learn the client's return address for this stream.
///
/// Wire format: `"MIRG" || stream_id (LE, 4) || device_id (16)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpRegistration {
    pub stream_id: StreamId,
    pub device_id: [u8; 16],
}

impl UdpRegistration {
    pub fn encode(&self) -> [u8; REGISTRATION_SIZE] {
        let mut buf = [0u8; REGISTRATION_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[8..24].copy_from_slice(&self.device_id);
        buf
    }

    /// A registration is exactly [`REGISTRATION_SIZE`] bytes; anything
    /// longer is a media fragment and should go through
    /// [`deserialize_fragment`] instead.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != REGISTRATION_SIZE {
            return Err(ProtocolError::ShortHeader { got: data.len() });
        }
        if data[0..4] != MAGIC {
            return Err(ProtocolError::BadMagic);
        }
        let stream_id = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let mut device_id = [0u8; 16];
        device_id.copy_from_slice(&data[8..24]);
        Ok(Self {
            stream_id,
            device_id,
        })
    }
}
