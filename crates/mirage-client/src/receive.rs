//! Media receive path: datagrams → reassembly → decode → cache.
//!
//! The UDP loop does no per-packet allocation beyond the payload itself
//! and never blocks: fragments are handed to per-stream pipeline tasks
//! over bounded channels, and a backlogged pipeline sheds fragments the
//! way the network would. Each video pipeline owns its reassembler,
//! stream controller and decoder façade; the controller's actions are
//! carried out right here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mirage_crypto::{Direction, MediaCipher};
use mirage_protocol::codec::encode_client_msg;
use mirage_protocol::fragment::FragmentHeader;
use mirage_protocol::messages::{ClientMessage, StreamAnnounce};
use mirage_protocol::packet::{deserialize_audio_fragment, deserialize_fragment};
use mirage_protocol::reassembler::{AssembledFrame, Reassembler, ReassemblyEvent};
use mirage_protocol::types::{DimensionToken, StreamId, StreamKind, TargetFrameRate};
use mirage_stream::cache::FrameCache;
use mirage_stream::controller::{ControllerAction, StreamController, BASE_SUBMISSION_LIMIT};
use mirage_stream::decoder::{DecodeOutcome, DecodeRequest, DecoderFacade, FrameDecoder};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, trace, warn};

/// Platform decoder creation, chosen per stream announcement.
pub trait DecoderFactory: Send + Sync {
    fn create_decoder(&self, announce: &StreamAnnounce) -> Box<dyn FrameDecoder>;
}

enum PipelineMsg {
    Fragment(FragmentHeader, Vec<u8>),
    SetDimensionToken(DimensionToken),
    /// The codec layer rejected a datagram for this stream (CRC/AEAD).
    PacketDiscarded,
}

/// Handle to one stream's pipeline task.
pub struct PipelineHandle {
    pub stream_id: StreamId,
    pub kind: StreamKind,
    /// Present for video streams; plug into a render loop.
    pub cache: Option<Arc<FrameCache>>,
    pub frame_ready: Option<Arc<Notify>>,
    tx: mpsc::Sender<PipelineMsg>,
}

impl PipelineHandle {
    pub(crate) fn ingest(&self, header: FragmentHeader, payload: Vec<u8>) {
        if self
            .tx
            .try_send(PipelineMsg::Fragment(header, payload))
            .is_err()
        {
            trace!(
                stream_id = self.stream_id,
                "pipeline backlogged, shedding fragment"
            );
        }
    }

    /// Resolution epoch changed; partial reassembly is invalid.
    pub fn set_dimension_token(&self, token: DimensionToken) {
        let _ = self.tx.try_send(PipelineMsg::SetDimensionToken(token));
    }

    fn note_discard(&self) {
        let _ = self.tx.try_send(PipelineMsg::PacketDiscarded);
    }
}

/// Start the pipeline for one video stream.
pub fn spawn_video_pipeline(
    announce: &StreamAnnounce,
    decoder: Box<dyn FrameDecoder>,
    outbound: mpsc::Sender<Vec<u8>>,
    target: TargetFrameRate,
) -> PipelineHandle {
    let stream_id = announce.stream_id;
    let cache = Arc::new(FrameCache::new(stream_id));
    let frame_ready = Arc::new(Notify::new());

    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let facade = DecoderFacade::spawn(decoder, cache.clone(), outcome_tx, BASE_SUBMISSION_LIMIT);

    let mut reassembler = Reassembler::new(stream_id, target.frame_interval());
    reassembler.set_expected_dimension_token(announce.dimension_token);

    let (tx, rx) = mpsc::channel(128);
    tokio::spawn(run_video_pipeline(
        stream_id,
        rx,
        outcome_rx,
        reassembler,
        StreamController::new(stream_id),
        facade,
        cache.clone(),
        frame_ready.clone(),
        outbound,
    ));

    PipelineHandle {
        stream_id,
        kind: announce.kind,
        cache: Some(cache),
        frame_ready: Some(frame_ready),
        tx,
    }
}

/// Start the pipeline for one audio stream: reassembly only, assembled
/// frames go to the embedder's audio sink.
pub fn spawn_audio_pipeline(
    stream_id: StreamId,
    target: TargetFrameRate,
    frames_tx: mpsc::Sender<AssembledFrame>,
) -> PipelineHandle {
    let (tx, mut rx) = mpsc::channel(128);
    let mut reassembler = Reassembler::new(stream_id, target.frame_interval());

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                PipelineMsg::Fragment(header, payload) => {
                    for event in reassembler.ingest(&header, payload, Instant::now()) {
                        match event {
                            ReassemblyEvent::Frame(frame) => {
                                if frames_tx.try_send(frame).is_err() {
                                    trace!(stream_id, "audio sink backlogged, dropping frame");
                                }
                            }
                            ReassemblyEvent::Loss { frame_number } => {
                                trace!(stream_id, frame_number, "audio frame lost");
                            }
                            ReassemblyEvent::TokenMismatch { .. } => {}
                        }
                    }
                }
                PipelineMsg::SetDimensionToken(token) => {
                    reassembler.set_expected_dimension_token(token);
                }
                PipelineMsg::PacketDiscarded => reassembler.note_packet_discarded(),
            }
        }
    });

    PipelineHandle {
        stream_id,
        kind: StreamKind::Audio,
        cache: None,
        frame_ready: None,
        tx,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_video_pipeline(
    stream_id: StreamId,
    mut rx: mpsc::Receiver<PipelineMsg>,
    mut outcome_rx: mpsc::UnboundedReceiver<DecodeOutcome>,
    mut reassembler: Reassembler,
    mut controller: StreamController,
    facade: DecoderFacade,
    cache: Arc<FrameCache>,
    frame_ready: Arc<Notify>,
    outbound: mpsc::Sender<Vec<u8>>,
) {
    let mut report = tokio::time::interval(Duration::from_secs(1));
    report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last_decoded = 0u64;
    let mut last_errors = 0u64;
    let mut last_lost = 0u64;
    let mut last_evictions = 0u64;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(PipelineMsg::Fragment(header, payload)) => {
                    let now = Instant::now();
                    for event in reassembler.ingest(&header, payload, now) {
                        let actions = controller.on_reassembly_event(event, now);
                        if !apply_actions(actions, stream_id, &facade, &cache, &frame_ready, &outbound).await {
                            return;
                        }
                    }
                }
                Some(PipelineMsg::SetDimensionToken(token)) => {
                    reassembler.set_expected_dimension_token(token);
                    // A resolution change resets the stream the same way an
                    // unexpected token would.
                    let actions = controller
                        .on_reassembly_event(ReassemblyEvent::TokenMismatch { token }, Instant::now());
                    if !apply_actions(actions, stream_id, &facade, &cache, &frame_ready, &outbound).await {
                        return;
                    }
                }
                Some(PipelineMsg::PacketDiscarded) => reassembler.note_packet_discarded(),
                None => break,
            },
            outcome = outcome_rx.recv() => match outcome {
                Some(outcome) => {
                    let decoded = matches!(outcome, DecodeOutcome::Decoded { .. });
                    let actions = controller.on_decode_outcome(decoded, Instant::now());
                    if !apply_actions(actions, stream_id, &facade, &cache, &frame_ready, &outbound).await {
                        return;
                    }
                }
                None => break,
            },
            _ = report.tick() => {
                let m = controller.metrics();
                let decoded_fps = (m.frames_decoded - last_decoded) as f32;
                let actions = controller.on_window_tick(decoded_fps, Instant::now());
                if !apply_actions(actions, stream_id, &facade, &cache, &frame_ready, &outbound).await {
                    return;
                }

                let evictions = cache.eviction_count();
                let health = ClientMessage::DecodeHealthReport {
                    stream_id,
                    decoded_fps,
                    decode_errors: (m.decode_errors - last_errors) as u32,
                    frames_lost: (m.frames_lost - last_lost) as u32,
                    cache_evictions: (evictions - last_evictions) as u32,
                };
                send_control(&outbound, &health).await;

                last_decoded = m.frames_decoded;
                last_errors = m.decode_errors;
                last_lost = m.frames_lost;
                last_evictions = evictions;
            }
        }
    }
    facade.stop();
}

/// Execute controller actions. Returns false when the pipeline must stop.
async fn apply_actions(
    actions: Vec<ControllerAction>,
    stream_id: StreamId,
    facade: &DecoderFacade,
    cache: &Arc<FrameCache>,
    frame_ready: &Arc<Notify>,
    outbound: &mpsc::Sender<Vec<u8>>,
) -> bool {
    for action in actions {
        match action {
            ControllerAction::SubmitDecode(frame) => {
                let request = DecodeRequest {
                    frame_number: frame.frame_number,
                    timestamp: frame.timestamp,
                    keyframe: frame.keyframe,
                    content_rect: frame.content_rect,
                    data: frame.data,
                };
                if let Err(e) = facade.submit(request).await {
                    warn!(stream_id, error = %e, "decode submission failed, stopping pipeline");
                    return false;
                }
            }
            ControllerAction::RequestKeyframe => {
                send_control(outbound, &ClientMessage::KeyframeRequest { stream_id }).await;
            }
            ControllerAction::FlushCache => {
                let flushed = cache.flush();
                debug!(stream_id, flushed, "flushed presentation cache");
            }
            ControllerAction::ClearInFlight => facade.clear_pending(),
            ControllerAction::SetSubmissionLimit(limit) => facade.set_submission_limit(limit),
            ControllerAction::RequestAdaptiveFallback => {
                send_control(outbound, &ClientMessage::AdaptiveFallbackRequest { stream_id })
                    .await;
            }
            ControllerAction::NotifyFrameReady => frame_ready.notify_one(),
        }
    }
    true
}

async fn send_control(outbound: &mpsc::Sender<Vec<u8>>, msg: &ClientMessage) {
    match encode_client_msg(msg) {
        Ok(frame) => {
            if outbound.send(frame).await.is_err() {
                debug!("control writer gone");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode control message"),
    }
}

/// Counters kept by the receive loop.
#[derive(Default)]
pub struct ReceiveStats {
    pub datagrams: AtomicU64,
    pub discarded: AtomicU64,
    pub unknown_stream: AtomicU64,
}

/// Byte offset of the stream id shared by both header layouts.
const STREAM_ID_OFFSET: usize = 6;

/// Run the client's datagram receive loop until shutdown.
pub async fn run_receive_loop(
    socket: Arc<UdpSocket>,
    cipher: Option<Arc<MediaCipher>>,
    pipelines: Arc<DashMap<StreamId, PipelineHandle>>,
    stats: Arc<ReceiveStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 1500];
    loop {
        let len = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            recv = socket.recv(&mut buf) => match recv {
                Ok(len) => len,
                Err(e) => {
                    warn!(error = %e, "media recv error");
                    continue;
                }
            },
        };

        let data = &buf[..len];
        stats.datagrams.fetch_add(1, Ordering::Relaxed);

        if data.len() < STREAM_ID_OFFSET + 4 {
            stats.discarded.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        let stream_id = u32::from_le_bytes([
            data[STREAM_ID_OFFSET],
            data[STREAM_ID_OFFSET + 1],
            data[STREAM_ID_OFFSET + 2],
            data[STREAM_ID_OFFSET + 3],
        ]);

        let Some(pipeline) = pipelines.get(&stream_id) else {
            stats.unknown_stream.fetch_add(1, Ordering::Relaxed);
            trace!(stream_id, "datagram for unknown stream");
            continue;
        };

        let cipher_ref = cipher.as_deref().map(|c| (c, Direction::HostToClient));
        match pipeline.kind {
            StreamKind::Audio => match deserialize_audio_fragment(data, cipher_ref) {
                Ok((header, payload)) => {
                    pipeline.ingest(header.reassembly_view(), payload);
                }
                Err(e) => {
                    stats.discarded.fetch_add(1, Ordering::Relaxed);
                    pipeline.note_discard();
                    trace!(stream_id, error = %e, "audio datagram discarded");
                }
            },
            _ => match deserialize_fragment(data, cipher_ref) {
                Ok((header, payload)) => {
                    pipeline.ingest(header, payload);
                }
                Err(e) => {
                    stats.discarded.fetch_add(1, Ordering::Relaxed);
                    pipeline.note_discard();
                    trace!(stream_id, error = %e, "video datagram discarded");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirage_protocol::codec::decode_client_msg;
    use mirage_protocol::fragment::{ContentRect, FragmentFlags};
    use mirage_stream::decoder::{DecodedBuffer, PixelFormat};
    use mirage_stream::error::StreamError;

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

    fn announce() -> StreamAnnounce {
        StreamAnnounce {
            stream_id: 7,
            kind: StreamKind::DesktopVideo,
            width: 640,
            height: 480,
            fps: 60,
            dimension_token: 1,
        }
    }

    fn header(frame: u32, keyframe: bool, payload_len: u32) -> FragmentHeader {
        let mut flags = FragmentFlags::default();
        if keyframe {
            flags = flags.with(FragmentFlags::KEYFRAME);
        }
        FragmentHeader {
            flags: flags.with(FragmentFlags::END_OF_FRAME),
            stream_id: 7,
            sequence_number: frame,
            timestamp: frame as u64,
            frame_number: frame,
            fragment_index: 0,
            fragment_count: 1,
            payload_length: payload_len,
            frame_byte_count: payload_len,
            checksum: 0,
            content_rect: ContentRect::default(),
            dimension_token: 1,
            epoch: 0,
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fragments_flow_into_the_cache() {
        let (outbound, _outbound_rx) = mpsc::channel(16);
        let pipeline = spawn_video_pipeline(
            &announce(),
            Box::new(InstantDecoder),
            outbound,
            TargetFrameRate::Fps60,
        );
        let cache = pipeline.cache.clone().unwrap();

        pipeline.ingest(header(0, true, 3), vec![1, 2, 3]);
        wait_for(|| cache.queue_depth() == 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resolution_change_requests_keyframe() {
        let (outbound, mut outbound_rx) = mpsc::channel(16);
        let pipeline = spawn_video_pipeline(
            &announce(),
            Box::new(InstantDecoder),
            outbound,
            TargetFrameRate::Fps60,
        );

        pipeline.set_dimension_token(2);

        let frame = tokio::time::timeout(Duration::from_secs(1), outbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let msg = decode_client_msg(&frame[4..]).unwrap();
        assert_eq!(msg, ClientMessage::KeyframeRequest { stream_id: 7 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn audio_pipeline_delivers_assembled_frames() {
        let (frames_tx, mut frames_rx) = mpsc::channel(16);
        let pipeline = spawn_audio_pipeline(9, TargetFrameRate::Fps60, frames_tx);

        let mut h = header(0, false, 4);
        h.stream_id = 9;
        pipeline.ingest(h, vec![1, 2, 3, 4]);

        let frame = tokio::time::timeout(Duration::from_secs(1), frames_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.frame_number, 0);
        assert_eq!(frame.data, vec![1, 2, 3, 4]);
    }
}
