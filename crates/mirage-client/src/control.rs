//! Client side of the control channel.
//!
//! Host messages are queued with latest-by-type coalescing and dispatched
//! one at a time, mirroring the host's receive discipline. Stream
//! lifecycle messages create and tear down media pipelines; everything
//! the embedder cares about surfaces as a [`SessionEvent`].

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use mirage_protocol::codec::{decode_host_msg, try_decode_frame};
use mirage_protocol::messages::HostMessage;
use mirage_protocol::queue::ControlQueue;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{watch, Notify};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::receive::{spawn_audio_pipeline, spawn_video_pipeline};
use crate::session::{SessionEvent, SessionShared};

/// Transient read errors are tolerated for this long before teardown.
const TRANSIENT_ERROR_TIMEOUT: Duration = Duration::from_secs(2);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) async fn run_control_loop(
    mut read_half: OwnedReadHalf,
    mut buf: BytesMut,
    shared: Arc<SessionShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let queue = Arc::new(std::sync::Mutex::new(ControlQueue::<HostMessage>::default()));
    let queue_notify = Arc::new(Notify::new());

    let dispatcher = {
        let queue = queue.clone();
        let notify = queue_notify.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            loop {
                let notified = notify.notified();
                let next = queue.lock().expect("queue lock").pop();
                match next {
                    Some(msg) => dispatch_host(&shared, msg).await,
                    None => notified.await,
                }
            }
        })
    };

    let mut first_transient_error: Option<Instant> = None;
    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            read = read_half.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                info!("host closed the control channel");
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

        loop {
            match try_decode_frame(&mut buf) {
                Ok(Some(payload)) => match decode_host_msg(&payload) {
                    Ok(HostMessage::Disconnect) => {
                        info!("host requested disconnect");
                        let _ = shared.events.send(SessionEvent::Disconnected);
                        dispatcher.abort();
                        return;
                    }
                    Ok(msg) => {
                        let mut q = queue.lock().expect("queue lock");
                        if q.push(msg).is_err() {
                            warn!("control queue full, dropping host message");
                        }
                        drop(q);
                        queue_notify.notify_one();
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to decode host message");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "control frame error");
                    let _ = shared.events.send(SessionEvent::Disconnected);
                    dispatcher.abort();
                    return;
                }
            }
        }
    }

    let _ = shared.events.send(SessionEvent::Disconnected);
    dispatcher.abort();
}

async fn dispatch_host(shared: &Arc<SessionShared>, msg: HostMessage) {
    match msg {
        HostMessage::DesktopStreamStarted { stream } => {
            let decoder = shared.decoders.create_decoder(&stream);
            let pipeline =
                spawn_video_pipeline(&stream, decoder, shared.outbound.clone(), shared.target);
            shared.pipelines.insert(stream.stream_id, pipeline);
            shared.send_registration(stream.stream_id).await;
            info!(stream_id = stream.stream_id, "desktop stream started");
            let _ = shared.events.send(SessionEvent::StreamStarted(stream));
        }

        HostMessage::AppStreamStarted { stream, app_name } => {
            let decoder = shared.decoders.create_decoder(&stream);
            let pipeline =
                spawn_video_pipeline(&stream, decoder, shared.outbound.clone(), shared.target);
            shared.pipelines.insert(stream.stream_id, pipeline);
            shared.send_registration(stream.stream_id).await;
            info!(stream_id = stream.stream_id, app = %app_name, "app stream started");
            let _ = shared
                .events
                .send(SessionEvent::AppStreamStarted { stream, app_name });
        }

        HostMessage::DesktopStreamStopped { stream_id }
        | HostMessage::AudioStreamStopped { stream_id } => {
            // Dropping the handle closes the pipeline's channel; its task
            // drains and stops.
            shared.pipelines.remove(&stream_id);
            let _ = shared.events.send(SessionEvent::StreamStopped(stream_id));
        }

        HostMessage::AudioStreamStarted {
            stream_id,
            codec,
            sample_rate,
            channel_count,
            samples_per_frame,
        } => {
            let (frames_tx, frames_rx) = mpsc::channel(64);
            let pipeline = spawn_audio_pipeline(stream_id, shared.target, frames_tx);
            shared.pipelines.insert(stream_id, pipeline);
            shared.send_registration(stream_id).await;
            let _ = shared.events.send(SessionEvent::AudioStreamStarted {
                stream_id,
                codec,
                sample_rate,
                channel_count,
                samples_per_frame,
                frames: frames_rx,
            });
        }

        HostMessage::ResolutionChange {
            stream_id,
            width,
            height,
            dimension_token,
        } => {
            if let Some(pipeline) = shared.pipelines.get(&stream_id) {
                pipeline.set_dimension_token(dimension_token);
            }
            debug!(stream_id, width, height, dimension_token, "resolution changed");
            let _ = shared.events.send(SessionEvent::ResolutionChanged {
                stream_id,
                width,
                height,
                dimension_token,
            });
        }

        HostMessage::TransportRefreshRequest => {
            // Re-teach the host our return address for every stream.
            let ids: Vec<u32> = shared.pipelines.iter().map(|p| p.stream_id).collect();
            for stream_id in ids {
                shared.send_registration(stream_id).await;
            }
        }

        HostMessage::QualityProbeResult {
            probe_id,
            sent_at_ms,
        } => {
            let rtt_ms = now_ms().saturating_sub(sent_at_ms) as u32;
            let _ = shared
                .events
                .send(SessionEvent::ProbeResult { probe_id, rtt_ms });
        }

        HostMessage::QualityTestResult {
            test_id,
            byte_count,
            duration_ms,
        } => {
            let _ = shared.events.send(SessionEvent::ThroughputResult {
                test_id,
                byte_count,
                duration_ms,
            });
        }

        HostMessage::HostSoftwareUpdateStarted { message } => {
            let _ = shared
                .events
                .send(SessionEvent::HostUpdateStarted { message });
        }

        HostMessage::HelloResponse(_) => {
            warn!("unexpected hello response after handshake");
        }

        // Handled on the reader path.
        HostMessage::Disconnect => {}
    }
}
