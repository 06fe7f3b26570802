//! Frame-to-fragment serialization on the host side.
//!
//! One packetizer per outgoing stream. It owns the stream's frame and wire
//! sequence counters; fragment payloads never exceed `max_payload`, and the
//! fragment count of a single frame must fit a `u16`.

use mirage_crypto::{Direction, MediaCipher};
use tracing::trace;

use crate::error::ProtocolError;
use crate::fragment::{ContentRect, FragmentFlags, FragmentHeader, MAX_VIDEO_PAYLOAD_SIZE};
use crate::packet::serialize_fragment;
use crate::types::{DimensionToken, StreamId};

/// Everything the encoder knows about one encoded frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameMeta {
    pub keyframe: bool,
    /// Capture timestamp in nanoseconds.
    pub timestamp: u64,
    pub content_rect: ContentRect,
    pub dimension_token: DimensionToken,
    pub epoch: u16,
}

pub struct Packetizer {
    stream_id: StreamId,
    max_payload: usize,
    frame_number: u32,
    sequence_number: u32,
    /// Set after a reset; cleared once the first fragment goes out.
    pending_discontinuity: bool,
}

impl Packetizer {
    pub fn new(stream_id: StreamId, max_payload: usize) -> Self {
        debug_assert!(max_payload > 0 && max_payload <= MAX_VIDEO_PAYLOAD_SIZE);
        Self {
            stream_id,
            max_payload,
            frame_number: 0,
            sequence_number: 0,
            pending_discontinuity: true,
        }
    }

    /// Slice one encoded frame into ready-to-send datagrams.
    pub fn packetize(
        &mut self,
        encoded: &[u8],
        meta: FrameMeta,
        cipher: Option<(&MediaCipher, Direction)>,
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let fragment_count = encoded.len().div_ceil(self.max_payload).max(1);
        if fragment_count > u16::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                byte_count: encoded.len(),
            });
        }

        let frame_number = self.frame_number;
        self.frame_number += 1;

        trace!(
            stream_id = self.stream_id,
            frame = frame_number,
            bytes = encoded.len(),
            fragments = fragment_count,
            keyframe = meta.keyframe,
            "packetizing frame"
        );

        let mut datagrams = Vec::with_capacity(fragment_count);
        for index in 0..fragment_count {
            let start = index * self.max_payload;
            let end = ((index + 1) * self.max_payload).min(encoded.len());

            let mut flags = FragmentFlags::default();
            if meta.keyframe {
                flags = flags.with(FragmentFlags::KEYFRAME);
            }
            if index + 1 == fragment_count {
                flags = flags.with(FragmentFlags::END_OF_FRAME);
            }
            if index == 0 && self.pending_discontinuity {
                flags = flags.with(FragmentFlags::DISCONTINUITY);
            }

            let header = FragmentHeader {
                flags,
                stream_id: self.stream_id,
                sequence_number: self.sequence_number,
                timestamp: meta.timestamp,
                frame_number,
                fragment_index: index as u16,
                fragment_count: fragment_count as u16,
                payload_length: 0, // filled by the codec
                frame_byte_count: encoded.len() as u32,
                checksum: 0,
                content_rect: meta.content_rect,
                dimension_token: meta.dimension_token,
                epoch: meta.epoch,
            };
            self.sequence_number = self.sequence_number.wrapping_add(1);

            datagrams.push(serialize_fragment(&header, &encoded[start..end], cipher)?);
        }

        self.pending_discontinuity = false;
        Ok(datagrams)
    }

    /// Reset counters; the next frame goes out flagged as a discontinuity.
    pub fn reset(&mut self) {
        self.frame_number = 0;
        self.sequence_number = 0;
        self.pending_discontinuity = true;
    }

    pub fn next_frame_number(&self) -> u32 {
        self.frame_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::deserialize_fragment;

    fn meta(keyframe: bool) -> FrameMeta {
        FrameMeta {
            keyframe,
            timestamp: 1_000,
            content_rect: ContentRect {
                x: 0,
                y: 0,
                width: 640,
                height: 480,
            },
            dimension_token: 1,
            epoch: 0,
        }
    }

    #[test]
    fn single_fragment_frame() {
        let mut p = Packetizer::new(1, 1000);
        let out = p.packetize(&[7u8; 100], meta(true), None).unwrap();
        assert_eq!(out.len(), 1);

        let (h, payload) = deserialize_fragment(&out[0], None).unwrap();
        assert_eq!(h.fragment_index, 0);
        assert_eq!(h.fragment_count, 1);
        assert_eq!(h.frame_byte_count, 100);
        assert!(h.flags.keyframe());
        assert!(h.flags.end_of_frame());
        assert!(h.flags.discontinuity());
        assert_eq!(payload, vec![7u8; 100]);
    }

    #[test]
    fn multi_fragment_slicing() {
        let mut p = Packetizer::new(1, 100);
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let out = p.packetize(&data, meta(false), None).unwrap();
        assert_eq!(out.len(), 3);

        let mut rebuilt = Vec::new();
        for (i, dg) in out.iter().enumerate() {
            let (h, payload) = deserialize_fragment(dg, None).unwrap();
            assert_eq!(h.fragment_index as usize, i);
            assert_eq!(h.fragment_count, 3);
            assert_eq!(h.flags.end_of_frame(), i == 2);
            rebuilt.extend_from_slice(&payload);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn counters_advance_per_frame_and_fragment() {
        let mut p = Packetizer::new(1, 100);
        let a = p.packetize(&[0u8; 150], meta(false), None).unwrap();
        let b = p.packetize(&[0u8; 50], meta(false), None).unwrap();

        let (ha0, _) = deserialize_fragment(&a[0], None).unwrap();
        let (ha1, _) = deserialize_fragment(&a[1], None).unwrap();
        let (hb0, _) = deserialize_fragment(&b[0], None).unwrap();

        assert_eq!(ha0.frame_number, 0);
        assert_eq!(hb0.frame_number, 1);
        assert_eq!(ha0.sequence_number, 0);
        assert_eq!(ha1.sequence_number, 1);
        assert_eq!(hb0.sequence_number, 2);
    }

    #[test]
    fn discontinuity_only_after_reset() {
        let mut p = Packetizer::new(1, 100);
        let a = p.packetize(&[0u8; 10], meta(false), None).unwrap();
        let b = p.packetize(&[0u8; 10], meta(false), None).unwrap();
        let (ha, _) = deserialize_fragment(&a[0], None).unwrap();
        let (hb, _) = deserialize_fragment(&b[0], None).unwrap();
        assert!(ha.flags.discontinuity());
        assert!(!hb.flags.discontinuity());

        p.reset();
        let c = p.packetize(&[0u8; 10], meta(false), None).unwrap();
        let (hc, _) = deserialize_fragment(&c[0], None).unwrap();
        assert!(hc.flags.discontinuity());
        assert_eq!(hc.frame_number, 0);
        assert_eq!(hc.sequence_number, 0);
    }

    #[test]
    fn empty_frame_still_produces_one_fragment() {
        let mut p = Packetizer::new(1, 100);
        let out = p.packetize(&[], meta(true), None).unwrap();
        assert_eq!(out.len(), 1);
        let (h, payload) = deserialize_fragment(&out[0], None).unwrap();
        assert_eq!(h.fragment_count, 1);
        assert!(payload.is_empty());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut p = Packetizer::new(1, 1);
        let data = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            p.packetize(&data, meta(false), None),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
