//! Bounded FIFO of decoded frames, one per stream.
//!
//! The decoder is the producer, the render loop the consumer. The cache
//! owns entries until they are dequeued; dequeue transfers ownership to the
//! presenter. Capacity is fixed; overflow evicts the oldest entry so a
//! stalled presenter can never wedge the decoder.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use mirage_protocol::fragment::ContentRect;
use tracing::debug;

use crate::decoder::DecodedBuffer;
use crate::policy::PresentationPolicy;

/// Hard cap on cached decoded frames.
pub const MAX_DEPTH: usize = 24;

/// Window after a keystroke during which presentation snaps to newest.
pub const TYPING_BURST_WINDOW: Duration = Duration::from_millis(400);

/// One decoded frame waiting to be presented.
#[derive(Debug)]
pub struct FrameEntry {
    /// Cache-local sequence, strictly increasing, never reused.
    pub sequence: u64,
    pub buffer: DecodedBuffer,
    pub content_rect: ContentRect,
    pub decode_time: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct PresentationMark {
    sequence: u64,
    at: Option<Instant>,
}

struct Inner {
    entries: VecDeque<FrameEntry>,
    next_sequence: u64,
    evictions: u64,
    presented: PresentationMark,
    typing_burst_until: Option<Instant>,
}

pub struct FrameCache {
    inner: Mutex<Inner>,
    stream_id: u32,
}

impl FrameCache {
    pub fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(MAX_DEPTH),
                next_sequence: 1,
                evictions: 0,
                presented: PresentationMark::default(),
                typing_burst_until: None,
            }),
        }
    }

    /// Append a decoded buffer, assigning its cache sequence. Returns the
    /// number of entries emergency-dropped to make room.
    pub fn enqueue(
        &self,
        buffer: DecodedBuffer,
        content_rect: ContentRect,
        decode_time: Instant,
    ) -> u32 {
        let mut inner = self.inner.lock().expect("cache lock");

        let mut drops = 0u32;
        while inner.entries.len() >= MAX_DEPTH {
            inner.entries.pop_front();
            inner.evictions += 1;
            drops += 1;
        }
        if drops > 0 {
            debug!(
                stream_id = self.stream_id,
                drops, "frame cache overflow, dropped oldest"
            );
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.entries.push_back(FrameEntry {
            sequence,
            buffer,
            content_rect,
            decode_time,
        });
        drops
    }

    /// Strict FIFO dequeue.
    pub fn dequeue(&self) -> Option<FrameEntry> {
        self.inner.lock().expect("cache lock").entries.pop_front()
    }

    /// Dequeue according to the presentation policy. An active typing
    /// burst overrides the requested policy with `Latest`.
    pub fn dequeue_for_presentation(
        &self,
        policy: PresentationPolicy,
        now: Instant,
    ) -> Option<FrameEntry> {
        let mut inner = self.inner.lock().expect("cache lock");

        let policy = if inner
            .typing_burst_until
            .is_some_and(|until| now < until)
        {
            PresentationPolicy::Latest
        } else {
            policy
        };

        match policy {
            PresentationPolicy::Latest => {
                let newest = inner.entries.pop_back()?;
                inner.entries.clear();
                Some(newest)
            }
            PresentationPolicy::Buffered(depth) => {
                while inner.entries.len() > depth as usize + 1 {
                    inner.entries.pop_front();
                }
                inner.entries.pop_front()
            }
        }
    }

    /// Sequence of the newest queued entry.
    pub fn peek_latest(&self) -> Option<u64> {
        self.inner
            .lock()
            .expect("cache lock")
            .entries
            .back()
            .map(|e| e.sequence)
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.lock().expect("cache lock").entries.len()
    }

    /// Age of the oldest queued entry.
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.inner
            .lock()
            .expect("cache lock")
            .entries
            .front()
            .map(|e| now.duration_since(e.decode_time))
    }

    /// Record that `sequence` reached the screen. Older marks never
    /// overwrite newer ones; concurrent present paths race here.
    pub fn mark_presented(&self, sequence: u64, at: Instant) {
        let mut inner = self.inner.lock().expect("cache lock");
        if sequence > inner.presented.sequence {
            inner.presented = PresentationMark {
                sequence,
                at: Some(at),
            };
        }
    }

    /// Latest presented sequence and when it was presented.
    pub fn presentation_snapshot(&self) -> Option<(u64, Instant)> {
        let inner = self.inner.lock().expect("cache lock");
        inner.presented.at.map(|at| (inner.presented.sequence, at))
    }

    pub fn eviction_count(&self) -> u64 {
        self.inner.lock().expect("cache lock").evictions
    }

    /// Arm the typing-burst window.
    pub fn note_typing_burst_activity(&self, now: Instant) {
        self.inner.lock().expect("cache lock").typing_burst_until =
            Some(now + TYPING_BURST_WINDOW);
    }

    pub fn is_typing_burst_active(&self, now: Instant) -> bool {
        self.inner
            .lock()
            .expect("cache lock")
            .typing_burst_until
            .is_some_and(|until| now < until)
    }

    /// Drop all queued entries (decode storm recovery). The sequence
    /// counter and presentation mark survive.
    pub fn flush(&self) -> usize {
        let mut inner = self.inner.lock().expect("cache lock");
        let n = inner.entries.len();
        inner.entries.clear();
        n
    }
}
