//! Host side of the control channel.
//!
//! One TCP connection per client. The hello exchange runs first with a
//! deadline; after that the reader routes input events straight to the
//! injection sink and queues everything else for the single dispatcher.
//! Exactly one control message is dispatched at a time.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use bytes::BytesMut;
use mirage_protocol::codec::{decode_client_msg, encode_host_msg, try_decode_frame};
use mirage_protocol::messages::{ClientMessage, HostMessage, InputEvent, StreamAnnounce};
use mirage_protocol::queue::ControlQueue;
use mirage_protocol::types::StreamKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, error, info, warn};

use crate::handshake::{HelloValidator, TrustDecider};
use crate::session::HostState;

/// Deadline for the hello exchange.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Transient read errors are tolerated for this long before teardown.
const TRANSIENT_ERROR_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages processed per read before yielding back to the runtime.
const MAX_MSGS_PER_READ: u32 = 20;

/// OS input injection boundary (platform capture/injection is external).
pub trait InputSink: Send + Sync {
    fn handle(&self, event: InputEvent);
}

/// Fallback sink that only logs; used until an injector is wired in.
pub struct LogInputSink;

impl InputSink for LogInputSink {
    fn handle(&self, event: InputEvent) {
        debug!(?event, "input event");
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Handle one client control connection from accept to teardown.
pub async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<HostState>,
    validator: Arc<AsyncMutex<HelloValidator>>,
    trust: Arc<dyn TrustDecider>,
    input: Arc<dyn InputSink>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    info!(peer = %peer, "new control connection");

    let mut buf = BytesMut::with_capacity(4096);
    let hello = match tokio::time::timeout(HELLO_TIMEOUT, read_hello(&mut stream, &mut buf)).await
    {
        Ok(Ok(hello)) => hello,
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "hello exchange failed");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "hello exchange timed out");
            return;
        }
    };

    let outcome = validator
        .lock()
        .await
        .process(&hello, trust.as_ref(), state.busy(), now_ms());

    let (read_half, mut write_half) = stream.into_split();

    // Writer task: serialized frames in, socket writes out.
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let writer = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                error!(error = %e, "control write error");
                break;
            }
        }
    });

    let response = HostMessage::HelloResponse(outcome.response.clone());
    match encode_host_msg(&response) {
        Ok(frame) => {
            let _ = tx.send(frame).await;
        }
        Err(e) => error!(error = %e, "failed to encode hello response"),
    }

    let Some(accepted) = outcome.session else {
        // Rejection already carries the reason; close after sending it.
        drop(tx);
        let _ = writer.await;
        return;
    };

    if let Err(e) = state.install_session(&accepted, tx.clone()) {
        error!(error = %e, "failed to install session");
        drop(tx);
        let _ = writer.await;
        return;
    }

    // Announce the primary desktop stream. The capture integration owns
    // the real dimensions and corrects them via ResolutionChange.
    let stream_state = state.register_stream(StreamKind::DesktopVideo, 1920, 1080);
    announce_stream(&tx, &stream_state.announce).await;

    run_message_loop(read_half, buf, &state, &tx, input).await;

    state.clear_session();
    writer.abort();
    info!(peer = %peer, "control connection closed");
}

async fn read_hello(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<mirage_protocol::messages::Hello> {
    loop {
        if let Some(payload) = try_decode_frame(buf)? {
            match decode_client_msg(&payload)? {
                ClientMessage::Hello(hello) => return Ok(hello),
                _ => bail!("expected hello as the first control message"),
            }
        }
        if stream.read_buf(buf).await? == 0 {
            bail!("connection closed before hello");
        }
    }
}

async fn announce_stream(tx: &mpsc::Sender<Vec<u8>>, announce: &StreamAnnounce) {
    let msg = HostMessage::DesktopStreamStarted {
        stream: announce.clone(),
    };
    match encode_host_msg(&msg) {
        Ok(frame) => {
            let _ = tx.send(frame).await;
        }
        Err(e) => error!(error = %e, "failed to encode stream announce"),
    }
}

async fn run_message_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    mut buf: BytesMut,
    state: &Arc<HostState>,
    tx: &mpsc::Sender<Vec<u8>>,
    input: Arc<dyn InputSink>,
) {
    let queue = Arc::new(std::sync::Mutex::new(
        ControlQueue::<ClientMessage>::default(),
    ));
    let queue_notify = Arc::new(Notify::new());

    // Single dispatcher: pops one message, completes it, takes the next.
    let dispatcher = {
        let queue = queue.clone();
        let notify = queue_notify.clone();
        let state = state.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                let notified = notify.notified();
                let next = queue.lock().expect("queue lock").pop();
                match next {
                    Some(msg) => dispatch_control(&state, &tx, msg).await,
                    None => notified.await,
                }
            }
        })
    };

    let mut first_transient_error: Option<Instant> = None;
    loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                info!("client disconnected (EOF)");
                break;
            }
            Ok(_) => {
                first_transient_error = None;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::TimedOut
                ) =>
            {
                let first = *first_transient_error.get_or_insert_with(Instant::now);
                if first.elapsed() > TRANSIENT_ERROR_TIMEOUT {
                    error!(error = %e, "transient errors persisted past timeout");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            Err(e) => {
                error!(error = %e, "control read error");
                break;
            }
        }

        let mut msgs_this_read = 0u32;
        loop {
            if msgs_this_read >= MAX_MSGS_PER_READ {
                tokio::task::yield_now().await;
                msgs_this_read = 0;
            }
            match try_decode_frame(&mut buf) {
                Ok(Some(payload)) => {
                    msgs_this_read += 1;
                    match decode_client_msg(&payload) {
                        Ok(ClientMessage::InputEvent(event)) => {
                            // Fast path: never queued behind control work.
                            if event.is_typing() {
                                let now = Instant::now();
                                for entry in state.streams.iter() {
                                    entry
                                        .encoder
                                        .lock()
                                        .expect("encoder lock")
                                        .note_typing_input(now);
                                }
                            }
                            input.handle(event);
                        }
                        Ok(ClientMessage::Disconnect) => {
                            info!("client requested disconnect");
                            dispatcher.abort();
                            return;
                        }
                        Ok(ClientMessage::Hello(_)) => {
                            warn!("duplicate hello ignored");
                        }
                        Ok(msg) => {
                            let mut q = queue.lock().expect("queue lock");
                            if q.push(msg).is_err() {
                                warn!("control queue full, dropping message");
                            }
                            drop(q);
                            queue_notify.notify_one();
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to decode control message");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "control frame error");
                    dispatcher.abort();
                    return;
                }
            }
        }
    }
    dispatcher.abort();
}

/// Apply one dequeued control message.
pub async fn dispatch_control(
    state: &Arc<HostState>,
    tx: &mpsc::Sender<Vec<u8>>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::KeyframeRequest { stream_id } => {
            if let Some(stream) = state.streams.get(&stream_id) {
                stream
                    .keyframe_needed
                    .store(true, std::sync::atomic::Ordering::Release);
                debug!(stream_id, "keyframe requested");
            }
        }

        ClientMessage::StreamEncoderSettingsChange {
            stream_id,
            settings,
        } => {
            if let Some(stream) = state.streams.get(&stream_id) {
                stream
                    .encoder
                    .lock()
                    .expect("encoder lock")
                    .update_settings(settings);
            }
        }

        ClientMessage::StreamRefreshRateChange { stream_id, target } => {
            if let Some(stream) = state.streams.get(&stream_id) {
                let announce = &stream.announce;
                stream.encoder.lock().expect("encoder lock").update_shape(
                    announce.width,
                    announce.height,
                    target.as_u16(),
                );
                info!(stream_id, fps = target.as_u16(), "refresh rate changed");
            }
        }

        ClientMessage::StreamScaleChange { stream_id, scale } => {
            if let Some(stream) = state.streams.get(&stream_id) {
                let milli = (scale.clamp(0.1, 1.0) * 1000.0) as u32;
                stream
                    .requested_scale_milli
                    .store(milli, std::sync::atomic::Ordering::Release);
                info!(stream_id, scale, "stream scale changed");
            }
        }

        ClientMessage::DecodeHealthReport {
            stream_id,
            decoded_fps,
            decode_errors,
            frames_lost,
            cache_evictions,
        } => {
            debug!(
                stream_id,
                decoded_fps, decode_errors, frames_lost, cache_evictions, "decode health report"
            );
            if let Some(stream) = state.streams.get(&stream_id) {
                stream
                    .encoder
                    .lock()
                    .expect("encoder lock")
                    .maybe_restore(Instant::now());
            }
        }

        ClientMessage::AdaptiveFallbackRequest { stream_id } => {
            if !state.config.adaptive_fallback_enabled {
                debug!(stream_id, "adaptive fallback disabled by config");
                return;
            }
            if let Some(stream) = state.streams.get(&stream_id) {
                stream
                    .encoder
                    .lock()
                    .expect("encoder lock")
                    .note_decode_storm(Instant::now());
                // A fresh keyframe gets the degraded stream presentable
                // immediately.
                stream
                    .keyframe_needed
                    .store(true, std::sync::atomic::Ordering::Release);
            }
        }

        ClientMessage::QualityProbeRequest {
            probe_id,
            sent_at_ms,
        } => {
            let reply = HostMessage::QualityProbeResult {
                probe_id,
                sent_at_ms,
            };
            if let Ok(frame) = encode_host_msg(&reply) {
                let _ = tx.send(frame).await;
            }
        }

        ClientMessage::QualityTestRequest {
            test_id,
            byte_count,
        } => {
            let duration_ms = run_throughput_test(state, byte_count).await;
            let reply = HostMessage::QualityTestResult {
                test_id,
                byte_count,
                duration_ms,
            };
            if let Ok(frame) = encode_host_msg(&reply) {
                let _ = tx.send(frame).await;
            }
        }

        // Handled on the reader path.
        ClientMessage::Hello(_) | ClientMessage::InputEvent(_) | ClientMessage::Disconnect => {}
    }
}

/// Burst `byte_count` bytes of filler at the client's media address and
/// report how long the sends took. The client counts what arrives.
async fn run_throughput_test(state: &Arc<HostState>, byte_count: u32) -> u32 {
    let Some(addr) = state.client_media_addr() else {
        return 0;
    };
    let chunk = [0u8; 1200];
    let started = Instant::now();
    let mut remaining = byte_count as usize;
    while remaining > 0 {
        let n = remaining.min(chunk.len());
        if state.udp_socket.send_to(&chunk[..n], addr).await.is_err() {
            break;
        }
        remaining -= n;
    }
    started.elapsed().as_millis() as u32
}
