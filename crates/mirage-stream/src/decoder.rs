//! Decoder façade: bounded submission in front of a platform codec.
//!
//! The actual codec (hardware or software) lives behind [`FrameDecoder`];
//! the core never links codec bindings. The façade owns the submission
//! gate: callers `submit().await`, the worker decodes, pushes the result
//! into the frame cache, releases the slot, and reports the outcome to the
//! stream controller.

use std::sync::Arc;
use std::time::Instant;

use mirage_protocol::fragment::ContentRect;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::admission::AdmissionGate;
use crate::cache::FrameCache;
use crate::error::StreamError;

/// Pixel layout of a decoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Nv12,
    P010,
    Bgra8,
}

/// One decoded picture.
#[derive(Debug, Clone)]
pub struct DecodedBuffer {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: Vec<u8>,
}

/// Platform codec boundary. Implementations wrap hardware decoder
/// sessions; decode is called from the façade's worker task only.
pub trait FrameDecoder: Send + 'static {
    /// Decode one encoded frame. A codec may buffer and return zero or
    /// several pictures.
    fn decode(&mut self, data: &[u8], keyframe: bool) -> Result<Vec<DecodedBuffer>, StreamError>;
}

impl FrameDecoder for Box<dyn FrameDecoder> {
    fn decode(&mut self, data: &[u8], keyframe: bool) -> Result<Vec<DecodedBuffer>, StreamError> {
        (**self).decode(data, keyframe)
    }
}

/// One frame handed to the façade.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub frame_number: u32,
    pub timestamp: u64,
    pub keyframe: bool,
    pub content_rect: ContentRect,
    pub data: Vec<u8>,
}

/// Result of a submission, reported to the stream controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    Decoded { frame_number: u32 },
    Failed { frame_number: u32 },
}

/// Handle to a running decoder worker.
pub struct DecoderFacade {
    gate: Arc<AdmissionGate>,
    request_tx: mpsc::Sender<(u64, DecodeRequest)>,
    epoch: Arc<std::sync::atomic::AtomicU64>,
}

impl DecoderFacade {
    /// Spawn the worker task around a codec instance.
    ///
    /// Decoded buffers land in `cache`; outcomes go to `outcome_tx`.
    pub fn spawn<D: FrameDecoder>(
        mut decoder: D,
        cache: Arc<FrameCache>,
        outcome_tx: mpsc::UnboundedSender<DecodeOutcome>,
        submission_limit: u32,
    ) -> Self {
        let gate = Arc::new(AdmissionGate::new(submission_limit));
        let (request_tx, mut request_rx) = mpsc::channel::<(u64, DecodeRequest)>(8);
        let epoch = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let worker_gate = gate.clone();
        let worker_epoch = epoch.clone();
        tokio::spawn(async move {
            while let Some((submitted_epoch, req)) = request_rx.recv().await {
                // Requests from a superseded epoch were cleared by a soft
                // recovery; give the slot back without decoding.
                if submitted_epoch < worker_epoch.load(std::sync::atomic::Ordering::Acquire) {
                    worker_gate.release();
                    continue;
                }
                let frame_number = req.frame_number;
                let result = decoder.decode(&req.data, req.keyframe);
                worker_gate.release();

                let outcome = match result {
                    Ok(buffers) => {
                        for buffer in buffers {
                            let drops = cache.enqueue(buffer, req.content_rect, Instant::now());
                            if drops > 0 {
                                // Backpressure drop; logged, never escalated
                                // to a keyframe request.
                                debug!(frame_number, drops, "cache dropped oldest entries");
                            }
                        }
                        DecodeOutcome::Decoded { frame_number }
                    }
                    Err(e) => {
                        warn!(frame_number, error = %e, "decode failed");
                        DecodeOutcome::Failed { frame_number }
                    }
                };
                if outcome_tx.send(outcome).is_err() {
                    break;
                }
            }
        });

        Self {
            gate,
            request_tx,
            epoch,
        }
    }

    /// Submit a frame, waiting for an in-flight slot first.
    pub async fn submit(&self, request: DecodeRequest) -> Result<(), StreamError> {
        self.gate.acquire().await?;
        let epoch = self.epoch.load(std::sync::atomic::Ordering::Acquire);
        if self.request_tx.send((epoch, request)).await.is_err() {
            self.gate.release();
            return Err(StreamError::DecoderStopped);
        }
        Ok(())
    }

    /// Discard submissions not yet decoded (soft recovery after a decode
    /// error). Frames already inside the codec are unaffected.
    pub fn clear_pending(&self) {
        self.epoch
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    /// Adjust the in-flight submission limit; waiters that fit under a
    /// raised limit are drained.
    pub fn set_submission_limit(&self, limit: u32) {
        self.gate.set_limit(limit);
    }

    pub fn submission_limit(&self) -> u32 {
        self.gate.limit()
    }

    pub fn in_flight(&self) -> u32 {
        self.gate.in_flight()
    }

    /// Cancel pending slot waiters; they return `Cancelled`.
    pub fn stop(&self) {
        self.gate.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    struct InstantDecoder;

    impl FrameDecoder for InstantDecoder {
        fn decode(
            &mut self,
            data: &[u8],
            _keyframe: bool,
        ) -> Result<Vec<DecodedBuffer>, StreamError> {
            Ok(vec![DecodedBuffer {
                width: 2,
                height: 2,
                pixel_format: PixelFormat::Nv12,
                data: data.to_vec(),
            }])
        }
    }

    struct FailingDecoder;

    impl FrameDecoder for FailingDecoder {
        fn decode(
            &mut self,
            _data: &[u8],
            _keyframe: bool,
        ) -> Result<Vec<DecodedBuffer>, StreamError> {
            Err(StreamError::Decode {
                frame_number: 0,
                detail: "corrupt".into(),
            })
        }
    }

    /// Blocks each decode until the test sends a release token.
    struct GatedDecoder {
        release: std_mpsc::Receiver<()>,
    }

    impl FrameDecoder for GatedDecoder {
        fn decode(
            &mut self,
            _data: &[u8],
            _keyframe: bool,
        ) -> Result<Vec<DecodedBuffer>, StreamError> {
            self.release.recv().expect("test keeps sender alive");
            Ok(vec![])
        }
    }

    fn request(frame_number: u32) -> DecodeRequest {
        DecodeRequest {
            frame_number,
            timestamp: 0,
            keyframe: frame_number == 0,
            content_rect: ContentRect::default(),
            data: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn decoded_frames_reach_the_cache() {
        let cache = Arc::new(FrameCache::new(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let facade = DecoderFacade::spawn(InstantDecoder, cache.clone(), tx, 2);

        facade.submit(request(0)).await.unwrap();
        assert_eq!(rx.recv().await, Some(DecodeOutcome::Decoded { frame_number: 0 }));
        assert_eq!(cache.queue_depth(), 1);
    }

    #[tokio::test]
    async fn failures_are_reported_not_cached() {
        let cache = Arc::new(FrameCache::new(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let facade = DecoderFacade::spawn(FailingDecoder, cache.clone(), tx, 2);

        facade.submit(request(5)).await.unwrap();
        assert_eq!(rx.recv().await, Some(DecodeOutcome::Failed { frame_number: 5 }));
        assert_eq!(cache.queue_depth(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submissions_respect_the_in_flight_limit() {
        let cache = Arc::new(FrameCache::new(1));
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let facade = Arc::new(DecoderFacade::spawn(
            GatedDecoder {
                release: release_rx,
            },
            cache,
            outcome_tx,
            2,
        ));

        facade.submit(request(0)).await.unwrap();
        facade.submit(request(1)).await.unwrap();

        // Third submission has to wait for a slot.
        let blocked = {
            let facade = facade.clone();
            tokio::spawn(async move { facade.submit(request(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // Let one decode finish; the waiter gets its slot.
        release_tx.send(()).unwrap();
        blocked.await.unwrap().unwrap();

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        for _ in 0..3 {
            assert!(outcome_rx.recv().await.is_some());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clear_pending_discards_queued_submissions() {
        let cache = Arc::new(FrameCache::new(1));
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let facade = DecoderFacade::spawn(
            GatedDecoder {
                release: release_rx,
            },
            cache,
            outcome_tx,
            2,
        );

        // First request occupies the worker; second sits in the queue.
        facade.submit(request(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        facade.submit(request(1)).await.unwrap();
        facade.clear_pending();

        release_tx.send(()).unwrap();
        // Frame 0 decodes; frame 1 was cleared and produces no outcome,
        // but its slot comes back.
        assert_eq!(
            outcome_rx.recv().await,
            Some(DecodeOutcome::Decoded { frame_number: 0 })
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(facade.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_cancels_pending_waiters() {
        let cache = Arc::new(FrameCache::new(1));
        let (outcome_tx, _outcome_rx) = mpsc::unbounded_channel();
        let (_release_tx, release_rx) = std_mpsc::channel();
        let facade = Arc::new(DecoderFacade::spawn(
            GatedDecoder {
                release: release_rx,
            },
            cache,
            outcome_tx,
            1,
        ));

        facade.submit(request(0)).await.unwrap();
        let blocked = {
            let facade = facade.clone();
            tokio::spawn(async move { facade.submit(request(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        facade.stop();
        assert!(matches!(
            blocked.await.unwrap(),
            Err(StreamError::Cancelled)
        ));
    }
}
