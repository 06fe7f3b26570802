//! Client session lifecycle: connect, handshake, register, stream.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use dashmap::DashMap;
use mirage_crypto::device::DeviceIdentity;
use mirage_crypto::identity::KeyId;
use mirage_crypto::MediaCipher;
use mirage_protocol::codec::{decode_host_msg, encode_client_msg, try_decode_frame};
use mirage_protocol::messages::{
    ClientMessage, HelloResponse, HostMessage, InputEvent, Negotiation, StreamAnnounce,
};
use mirage_protocol::packet::UdpRegistration;
use mirage_protocol::reassembler::AssembledFrame;
use mirage_protocol::types::{DimensionToken, LatencyMode, StreamId, TargetFrameRate};
use mirage_stream::cache::FrameCache;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{error, info, warn};

use crate::control;
use crate::handshake;
use crate::receive::{self, DecoderFactory, PipelineHandle, ReceiveStats};

/// Deadline for the hello response.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_name: String,
    pub latency_mode: LatencyMode,
    pub target_frame_rate: TargetFrameRate,
    pub request_host_update_on_protocol_mismatch: bool,
    /// Directory holding the device identity; platform default when unset.
    pub state_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "mirage-client".into(),
            latency_mode: LatencyMode::default(),
            target_frame_rate: TargetFrameRate::default(),
            request_host_update_on_protocol_mismatch: false,
            state_dir: None,
        }
    }
}

/// Events surfaced to the embedder.
#[derive(Debug)]
pub enum SessionEvent {
    StreamStarted(StreamAnnounce),
    AppStreamStarted {
        stream: StreamAnnounce,
        app_name: String,
    },
    AudioStreamStarted {
        stream_id: StreamId,
        codec: u32,
        sample_rate: u32,
        channel_count: u16,
        samples_per_frame: u16,
        /// Assembled (still encoded) audio frames for the platform codec.
        frames: mpsc::Receiver<AssembledFrame>,
    },
    StreamStopped(StreamId),
    ResolutionChanged {
        stream_id: StreamId,
        width: u32,
        height: u32,
        dimension_token: DimensionToken,
    },
    ProbeResult {
        probe_id: u32,
        rtt_ms: u32,
    },
    ThroughputResult {
        test_id: u32,
        byte_count: u32,
        duration_ms: u32,
    },
    HostUpdateStarted {
        message: String,
    },
    Disconnected,
}

/// State shared by the control loop, receive loop and session handle.
pub(crate) struct SessionShared {
    pub udp_socket: Arc<UdpSocket>,
    pub device_id: [u8; 16],
    pub target: TargetFrameRate,
    pub pipelines: Arc<DashMap<StreamId, PipelineHandle>>,
    pub decoders: Arc<dyn DecoderFactory>,
    /// Serialized frames to the control writer task.
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionShared {
    /// Send the registration datagram that teaches the host our return
    /// address.
    pub async fn send_registration(&self, stream_id: StreamId) {
        let reg = UdpRegistration {
            stream_id,
            device_id: self.device_id,
        };
        if let Err(e) = self.udp_socket.send(&reg.encode()).await {
            warn!(stream_id, error = %e, "failed to send UDP registration");
        }
    }
}

/// Facts about the established session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub host_name: String,
    pub host_key_id: KeyId,
    pub media_encryption_enabled: bool,
    pub negotiation: Negotiation,
}

pub struct ClientSession {
    info: SessionInfo,
    outbound: mpsc::Sender<Vec<u8>>,
    input_tx: mpsc::UnboundedSender<InputEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown_tx: watch::Sender<bool>,
    pipelines: Arc<DashMap<StreamId, PipelineHandle>>,
}

impl ClientSession {
    /// Connect to a host, complete the handshake and start the media
    /// loops.
    pub async fn connect(
        control_addr: SocketAddr,
        config: ClientConfig,
        decoders: Arc<dyn DecoderFactory>,
    ) -> Result<Self> {
        let state_dir = config
            .state_dir
            .clone()
            .unwrap_or_else(DeviceIdentity::default_dir);
        let identity = DeviceIdentity::load_or_create(&state_dir)
            .with_context(|| format!("failed to load identity from {}", state_dir.display()))?;

        let mut stream = TcpStream::connect(control_addr)
            .await
            .with_context(|| format!("failed to connect to {control_addr}"))?;
        stream.set_nodelay(true)?;

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let (hello, pending) = handshake::build_hello(
            &identity,
            &config.client_name,
            config.request_host_update_on_protocol_mismatch,
            now_ms,
        )?;
        let frame = encode_client_msg(&ClientMessage::Hello(hello))?;
        stream.write_all(&frame).await?;

        let mut buf = BytesMut::with_capacity(4096);
        let response =
            tokio::time::timeout(HELLO_TIMEOUT, read_hello_response(&mut stream, &mut buf))
                .await
                .context("timed out waiting for hello response")??;
        let established = handshake::verify_response(&response, pending)?;

        // Media socket with a large receive buffer to absorb fragment
        // bursts, connected to the host's data port so plain send/recv
        // apply.
        let udp = {
            let bind_addr: SocketAddr = if control_addr.is_ipv4() {
                "0.0.0.0:0".parse().expect("literal address")
            } else {
                "[::]:0".parse().expect("literal address")
            };
            let sock = socket2::Socket::new(
                socket2::Domain::for_address(bind_addr),
                socket2::Type::DGRAM,
                Some(socket2::Protocol::UDP),
            )
            .context("failed to create media socket")?;
            let _ = sock.set_recv_buffer_size(2 * 1024 * 1024);
            sock.bind(&bind_addr.into())
                .context("failed to bind media socket")?;
            sock.set_nonblocking(true)
                .context("failed to set non-blocking")?;
            let std_sock: std::net::UdpSocket = sock.into();
            UdpSocket::from_std(std_sock).context("failed to wrap media socket in tokio")?
        };
        udp.connect((control_addr.ip(), established.data_port))
            .await?;
        let udp = Arc::new(udp);

        let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(64);
        let (read_half, mut write_half) = stream.into_split();
        tokio::spawn(async move {
            while let Some(data) = outbound_rx.recv().await {
                if let Err(e) = write_half.write_all(&data).await {
                    error!(error = %e, "control write error");
                    break;
                }
            }
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipelines: Arc<DashMap<StreamId, PipelineHandle>> = Arc::new(DashMap::new());
        let stats = Arc::new(ReceiveStats::default());

        let shared = Arc::new(SessionShared {
            udp_socket: udp.clone(),
            device_id: *identity.device_id.as_bytes(),
            target: config.target_frame_rate,
            pipelines: pipelines.clone(),
            decoders,
            outbound: outbound.clone(),
            events: events_tx,
        });

        // Teach the host our return address before any stream starts.
        shared.send_registration(0).await;

        tokio::spawn(control::run_control_loop(
            read_half,
            buf,
            shared.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(receive::run_receive_loop(
            udp,
            established.cipher.clone(),
            pipelines.clone(),
            stats,
            shutdown_rx,
        ));

        // Input pump: fire-and-forget, in send order. A key press also
        // arms the typing-burst window on every video cache.
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<InputEvent>();
        {
            let outbound = outbound.clone();
            let pipelines = pipelines.clone();
            tokio::spawn(async move {
                while let Some(event) = input_rx.recv().await {
                    if event.is_typing() {
                        let now = Instant::now();
                        for pipeline in pipelines.iter() {
                            if let Some(cache) = &pipeline.cache {
                                cache.note_typing_burst_activity(now);
                            }
                        }
                    }
                    match encode_client_msg(&ClientMessage::InputEvent(event)) {
                        Ok(frame) => {
                            if outbound.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode input event"),
                    }
                }
            });
        }

        info!(host = %established.host_name, "client session running");

        Ok(Self {
            info: SessionInfo {
                host_name: established.host_name,
                host_key_id: established.host_key_id,
                media_encryption_enabled: established.media_encryption_enabled,
                negotiation: established.negotiation,
            },
            outbound,
            input_tx,
            events: events_rx,
            shutdown_tx,
            pipelines,
        })
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Queue an input event. Never blocks; events reach the host in send
    /// order.
    pub fn send_input(&self, event: InputEvent) {
        let _ = self.input_tx.send(event);
    }

    /// Send an arbitrary control message.
    pub async fn send_message(&self, msg: &ClientMessage) -> Result<()> {
        let frame = encode_client_msg(msg)?;
        if self.outbound.send(frame).await.is_err() {
            bail!("control channel closed");
        }
        Ok(())
    }

    pub async fn request_keyframe(&self, stream_id: StreamId) -> Result<()> {
        self.send_message(&ClientMessage::KeyframeRequest { stream_id })
            .await
    }

    /// Next session event; `None` after disconnect teardown.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Presentation hooks for one video stream: the frame cache and the
    /// decode-arrival notifier a render loop needs.
    pub fn stream_presentation(
        &self,
        stream_id: StreamId,
    ) -> Option<(Arc<FrameCache>, Arc<Notify>)> {
        let pipeline = self.pipelines.get(&stream_id)?;
        Some((pipeline.cache.clone()?, pipeline.frame_ready.clone()?))
    }

    /// Graceful teardown: tell the host, then cancel the loops.
    pub async fn disconnect(self) {
        if let Ok(frame) = encode_client_msg(&ClientMessage::Disconnect) {
            let _ = self.outbound.send(frame).await;
        }
        let _ = self.shutdown_tx.send(true);
        self.pipelines.clear();
    }
}

async fn read_hello_response(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<HelloResponse> {
    loop {
        if let Some(payload) = try_decode_frame(buf)? {
            match decode_host_msg(&payload)? {
                HostMessage::HelloResponse(response) => return Ok(response),
                _ => bail!("expected hello response as the first host message"),
            }
        }
        if stream.read_buf(buf).await? == 0 {
            bail!("connection closed before hello response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirage_crypto::agreement::{derive_media_key, EphemeralDh};
    use mirage_crypto::identity::IdentityKeyPair;
    use mirage_protocol::codec::{decode_client_msg, encode_host_msg, PROTOCOL_VERSION};
    use mirage_protocol::messages::{
        hello_response_signing_context, HostInfo, IdentityEnvelope,
        HELLO_RESPONSE_SIGNING_LABEL,
    };
    use mirage_protocol::types::{FeatureSet, StreamKind};
    use mirage_stream::decoder::{DecodedBuffer, FrameDecoder, PixelFormat};
    use mirage_stream::error::StreamError;
    use tokio::net::TcpListener;

    struct NullDecoder;

    impl FrameDecoder for NullDecoder {
        fn decode(
            &mut self,
            _data: &[u8],
            _keyframe: bool,
        ) -> Result<Vec<DecodedBuffer>, StreamError> {
            Ok(vec![DecodedBuffer {
                width: 1,
                height: 1,
                pixel_format: PixelFormat::Nv12,
                data: vec![0],
            }])
        }
    }

    struct NullFactory;

    impl DecoderFactory for NullFactory {
        fn create_decoder(&self, _announce: &StreamAnnounce) -> Box<dyn FrameDecoder> {
            Box::new(NullDecoder)
        }
    }

    /// Minimal in-test host: accepts the hello, signs a response, then
    /// announces one desktop stream.
    async fn fake_host(listener: TcpListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();

        let hello = loop {
            if let Some(payload) = try_decode_frame(&mut buf).unwrap() {
                match decode_client_msg(&payload).unwrap() {
                    ClientMessage::Hello(hello) => break hello,
                    other => panic!("unexpected message {other:?}"),
                }
            }
            stream.read_buf(&mut buf).await.unwrap();
        };

        let host_identity = IdentityKeyPair::generate().unwrap();
        let dh = EphemeralDh::generate().unwrap();
        let token = [5u8; 32];
        let host_nonce = [6u8; 16];
        let dh_public = dh.public_key().to_vec();
        let shared = dh.agree(&hello.identity.dh_public).unwrap();
        let _media_key = derive_media_key(&shared, &host_nonce, &hello.identity.nonce, &token);

        let mut envelope = IdentityEnvelope {
            key_id: host_identity.key_id(),
            public_key: host_identity.public_key(),
            dh_public,
            ts_ms: 2_000,
            nonce: host_nonce,
            signature: Vec::new(),
        };
        let context = hello_response_signing_context(&hello.identity.nonce, &token, 47190, true);
        let payload = envelope.canonical_payload(HELLO_RESPONSE_SIGNING_LABEL, &context);
        envelope.signature = host_identity.sign(&payload);

        let response = HelloResponse {
            accepted: true,
            host_info: HostInfo {
                device_id: [8; 16],
                name: "studio".into(),
                platform: "linux".into(),
            },
            data_port: 47190,
            negotiation: Negotiation {
                protocol_version: PROTOCOL_VERSION,
                supported_features: FeatureSet::all_supported(),
                selected_features: FeatureSet::all_supported(),
            },
            request_nonce: hello.identity.nonce,
            media_encryption_enabled: true,
            udp_registration_token: token,
            identity: envelope,
            rejection_reason: None,
            protocol_mismatch: None,
        };
        stream
            .write_all(&encode_host_msg(&HostMessage::HelloResponse(response)).unwrap())
            .await
            .unwrap();

        let announce = HostMessage::DesktopStreamStarted {
            stream: StreamAnnounce {
                stream_id: 1,
                kind: StreamKind::DesktopVideo,
                width: 1920,
                height: 1080,
                fps: 60,
                dimension_token: 1,
            },
        };
        stream
            .write_all(&encode_host_msg(&announce).unwrap())
            .await
            .unwrap();

        // Keep the connection open until the client is done.
        let mut hold = vec![0u8; 64];
        let _ = stream.read(&mut hold).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_establishes_session_and_streams() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(fake_host(listener));

        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            state_dir: Some(dir.path().to_path_buf()),
            ..ClientConfig::default()
        };

        let mut session = ClientSession::connect(addr, config, Arc::new(NullFactory))
            .await
            .unwrap();
        assert!(session.info().media_encryption_enabled);
        assert_eq!(session.info().host_name, "studio");

        match session.next_event().await.unwrap() {
            SessionEvent::StreamStarted(stream) => {
                assert_eq!(stream.stream_id, 1);
                assert_eq!(stream.width, 1920);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // The pipeline exposes its presentation hooks.
        let hooks = session.stream_presentation(1);
        assert!(hooks.is_some());

        session.disconnect().await;
    }

    #[test]
    fn default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.latency_mode, LatencyMode::Auto);
        assert_eq!(config.target_frame_rate, TargetFrameRate::Fps60);
    }
}
