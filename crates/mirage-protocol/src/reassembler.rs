//! Fragment-to-frame reassembly, one instance per incoming stream.
//!
//! Frames are delivered strictly in frame-number order. A missing frame
//! holds delivery back for a bounded window (three frame intervals or
//! 60 ms, whichever is larger); after that it is abandoned with a loss
//! report and delivery resumes at the next completed frame. A completed
//! keyframe short-circuits any gap in front of it: everything older is
//! dropped silently, because the keyframe restarts the decode chain anyway.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::fragment::{ContentRect, FragmentHeader};
use crate::types::{DimensionToken, FrameNumber, StreamId};

/// Floor for the gap-tolerance window.
const MIN_GAP_WINDOW: Duration = Duration::from_millis(60);

/// Upper bound on simultaneously-open frames. Beyond this the oldest
/// partial is discarded; reaching it at all means the link is in serious
/// trouble and the gap logic will be reporting losses shortly.
const MAX_IN_PROGRESS: usize = 32;

/// A fully reassembled frame ready for decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    pub frame_number: FrameNumber,
    pub timestamp: u64,
    pub keyframe: bool,
    pub discontinuity: bool,
    pub content_rect: ContentRect,
    pub dimension_token: DimensionToken,
    pub epoch: u16,
    pub data: Vec<u8>,
}

/// What an `ingest` call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyEvent {
    /// A frame completed and is next in order.
    Frame(AssembledFrame),
    /// A frame was abandoned after the gap window expired.
    Loss { frame_number: FrameNumber },
    /// A fragment carried an unexpected dimension token; the stream needs
    /// a controller reset and a fresh keyframe.
    TokenMismatch { token: DimensionToken },
}

/// Counters exposed for decode-health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyMetrics {
    pub frames_delivered: u64,
    pub frames_lost: u64,
    pub duplicates: u64,
    pub packets_discarded: u64,
    pub crc_discards: u64,
    pub in_progress: usize,
}

struct PendingFrame {
    fragments: Vec<Option<Vec<u8>>>,
    received: u16,
    fragment_count: u16,
    frame_byte_count: u32,
    keyframe: bool,
    discontinuity: bool,
    timestamp: u64,
    content_rect: ContentRect,
    dimension_token: DimensionToken,
    epoch: u16,
    /// Completed payload, held until the frame is next in order.
    assembled: Option<Vec<u8>>,
}

impl PendingFrame {
    fn is_complete(&self) -> bool {
        self.assembled.is_some()
    }

    fn into_frame(self, frame_number: FrameNumber) -> AssembledFrame {
        AssembledFrame {
            frame_number,
            timestamp: self.timestamp,
            keyframe: self.keyframe,
            discontinuity: self.discontinuity,
            content_rect: self.content_rect,
            dimension_token: self.dimension_token,
            epoch: self.epoch,
            data: self.assembled.expect("only complete frames are delivered"),
        }
    }
}

pub struct Reassembler {
    stream_id: StreamId,
    gap_window: Duration,
    pending: BTreeMap<FrameNumber, PendingFrame>,
    last_delivered: Option<FrameNumber>,
    /// Lowest frame number ever seen; bootstrap target before anything has
    /// been delivered.
    first_seen: Option<FrameNumber>,
    expected_token: Option<DimensionToken>,
    /// Set when in-order delivery is blocked on a missing frame.
    gap_since: Option<Instant>,
    metrics: ReassemblyMetrics,
}

impl Reassembler {
    pub fn new(stream_id: StreamId, frame_interval: Duration) -> Self {
        Self {
            stream_id,
            gap_window: (frame_interval * 3).max(MIN_GAP_WINDOW),
            pending: BTreeMap::new(),
            last_delivered: None,
            first_seen: None,
            expected_token: None,
            gap_since: None,
            metrics: ReassemblyMetrics::default(),
        }
    }

    /// Expect this dimension token from now on. Any partial reassembly is
    /// for the old resolution and gets discarded.
    pub fn set_expected_dimension_token(&mut self, token: DimensionToken) {
        if self.expected_token == Some(token) {
            return;
        }
        debug!(
            stream_id = self.stream_id,
            token, "dimension token change, discarding partial reassembly"
        );
        self.expected_token = Some(token);
        self.pending.clear();
        self.gap_since = None;
    }

    /// Forget delivery history, e.g. after the host resets its counters.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_delivered = None;
        self.first_seen = None;
        self.gap_since = None;
    }

    pub fn snapshot_metrics(&self) -> ReassemblyMetrics {
        ReassemblyMetrics {
            in_progress: self.pending.len(),
            ..self.metrics
        }
    }

    /// Record a datagram the codec already rejected (CRC/AEAD failure).
    pub fn note_packet_discarded(&mut self) {
        self.metrics.crc_discards += 1;
    }

    /// Feed one verified fragment. Returns delivery and loss events in the
    /// order they occur.
    pub fn ingest(
        &mut self,
        header: &FragmentHeader,
        payload: Vec<u8>,
        now: Instant,
    ) -> Vec<ReassemblyEvent> {
        let mut events = Vec::new();

        if header.fragment_count == 0 || header.fragment_index >= header.fragment_count {
            warn!(
                stream_id = self.stream_id,
                frame = header.frame_number,
                index = header.fragment_index,
                count = header.fragment_count,
                "fragment index out of range, dropping"
            );
            self.metrics.packets_discarded += 1;
            return events;
        }

        if let Some(expected) = self.expected_token {
            if header.dimension_token != expected {
                self.metrics.packets_discarded += 1;
                events.push(ReassemblyEvent::TokenMismatch {
                    token: header.dimension_token,
                });
                return events;
            }
        }

        // Retransmits of frames already delivered are not loss.
        if let Some(last) = self.last_delivered {
            if header.frame_number <= last {
                trace!(
                    stream_id = self.stream_id,
                    frame = header.frame_number,
                    "duplicate fragment for delivered frame"
                );
                self.metrics.duplicates += 1;
                return events;
            }
        }

        self.first_seen = Some(match self.first_seen {
            Some(f) => f.min(header.frame_number),
            None => header.frame_number,
        });

        if self.accept_fragment(header, payload) {
            self.drain_deliverable(now, &mut events);
        }
        events
    }

    /// Store the fragment; returns true if its frame just completed.
    fn accept_fragment(&mut self, header: &FragmentHeader, payload: Vec<u8>) -> bool {
        if !self.pending.contains_key(&header.frame_number) && self.pending.len() >= MAX_IN_PROGRESS
        {
            // Shed the oldest partial; the gap logic will report it lost if
            // delivery was waiting on it.
            if let Some((&oldest, _)) = self.pending.iter().next() {
                if oldest < header.frame_number {
                    self.pending.remove(&oldest);
                    self.metrics.packets_discarded += 1;
                } else {
                    self.metrics.packets_discarded += 1;
                    return false;
                }
            }
        }

        let entry = self
            .pending
            .entry(header.frame_number)
            .or_insert_with(|| PendingFrame {
                fragments: vec![None; header.fragment_count as usize],
                received: 0,
                fragment_count: header.fragment_count,
                frame_byte_count: header.frame_byte_count,
                keyframe: false,
                discontinuity: false,
                timestamp: header.timestamp,
                content_rect: header.content_rect,
                dimension_token: header.dimension_token,
                epoch: header.epoch,
                assembled: None,
            });

        if entry.is_complete() {
            self.metrics.duplicates += 1;
            return false;
        }

        if header.fragment_count != entry.fragment_count
            || header.frame_byte_count != entry.frame_byte_count
        {
            warn!(
                stream_id = self.stream_id,
                frame = header.frame_number,
                "fragment disagrees with frame shape, dropping"
            );
            self.metrics.packets_discarded += 1;
            return false;
        }

        let idx = header.fragment_index as usize;
        if entry.fragments[idx].is_some() {
            self.metrics.duplicates += 1;
            return false;
        }

        entry.fragments[idx] = Some(payload);
        entry.received += 1;
        entry.keyframe |= header.flags.keyframe();
        entry.discontinuity |= header.flags.discontinuity();

        if entry.received < entry.fragment_count {
            return false;
        }

        // Frame complete: stitch and validate total size.
        let mut data = Vec::with_capacity(entry.frame_byte_count as usize);
        for frag in entry.fragments.iter_mut() {
            data.extend_from_slice(frag.as_ref().expect("all fragments present"));
            *frag = None; // free early, payloads can be large
        }

        if data.len() != entry.frame_byte_count as usize {
            warn!(
                stream_id = self.stream_id,
                frame = header.frame_number,
                expected = entry.frame_byte_count,
                got = data.len(),
                "assembled frame size mismatch, dropping"
            );
            self.pending.remove(&header.frame_number);
            self.metrics.packets_discarded += 1;
            return false;
        }

        entry.assembled = Some(data);
        true
    }

    /// Deliver everything that is in order, applying keyframe gap-clearing
    /// and gap-window abandonment.
    fn drain_deliverable(&mut self, now: Instant, events: &mut Vec<ReassemblyEvent>) {
        loop {
            let next = match self.last_delivered {
                Some(last) => last + 1,
                None => match self.first_seen {
                    Some(first) => first,
                    None => return,
                },
            };

            // In-order frame ready: deliver immediately.
            if self.pending.get(&next).is_some_and(PendingFrame::is_complete) {
                let frame = self.pending.remove(&next).expect("checked above");
                self.deliver(next, frame, events);
                continue;
            }

            // A completed keyframe ahead of the gap clears it silently.
            let completed_keyframe = self
                .pending
                .iter()
                .find(|(_, f)| f.is_complete() && f.keyframe)
                .map(|(&n, _)| n);
            if let Some(k) = completed_keyframe {
                debug!(
                    stream_id = self.stream_id,
                    keyframe = k,
                    skipped = k - next,
                    "keyframe clears reassembly gap"
                );
                let frame = self.pending.remove(&k).expect("found above");
                self.pending.retain(|&n, _| n > k);
                self.deliver(k, frame, events);
                continue;
            }

            // Is delivery actually blocked, i.e. is something newer waiting?
            let oldest_complete = self
                .pending
                .iter()
                .find(|(_, f)| f.is_complete())
                .map(|(&n, _)| n);
            let Some(blocked_until) = oldest_complete else {
                self.gap_since = None;
                return;
            };

            match self.gap_since {
                None => {
                    self.gap_since = Some(now);
                    return;
                }
                Some(since) if now.duration_since(since) < self.gap_window => return,
                Some(_) => {
                    // Window expired: abandon everything in front of the
                    // oldest completed frame.
                    for n in next..blocked_until {
                        self.pending.remove(&n);
                        self.metrics.frames_lost += 1;
                        events.push(ReassemblyEvent::Loss { frame_number: n });
                    }
                    debug!(
                        stream_id = self.stream_id,
                        from = next,
                        to = blocked_until,
                        "gap window expired, abandoned missing frames"
                    );
                    let frame = self.pending.remove(&blocked_until).expect("complete");
                    self.deliver(blocked_until, frame, events);
                }
            }
        }
    }

    fn deliver(
        &mut self,
        frame_number: FrameNumber,
        frame: PendingFrame,
        events: &mut Vec<ReassemblyEvent>,
    ) {
        self.last_delivered = Some(frame_number);
        self.gap_since = None;
        self.metrics.frames_delivered += 1;
        events.push(ReassemblyEvent::Frame(frame.into_frame(frame_number)));
    }
}
