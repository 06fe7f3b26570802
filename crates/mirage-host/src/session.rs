//! Host session state and the UDP media send path.
//!
//! A host serves one client at a time. The media security context and the
//! client's learned return address are swapped atomically so the datagram
//! paths read them without taking a lock or allocating.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use mirage_crypto::identity::KeyId;
use mirage_crypto::{Direction, MediaCipher};
use mirage_protocol::messages::StreamAnnounce;
use mirage_protocol::packet::UdpRegistration;
use mirage_protocol::packetizer::{FrameMeta, Packetizer};
use mirage_protocol::types::{FeatureSet, StreamId, StreamKind};
use mirage_protocol::ProtocolError;
use subtle::ConstantTimeEq;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::encoder::EncoderControl;
use crate::handshake::AcceptedSession;

/// Read-mostly media security context, swapped on session install/teardown.
#[derive(Default)]
pub struct MediaSecurity {
    pub cipher: Option<Arc<MediaCipher>>,
}

/// The one active client relation.
pub struct ActiveSession {
    pub peer_key_id: KeyId,
    pub client_device_id: [u8; 16],
    pub udp_registration_token: [u8; 32],
    pub negotiated_features: FeatureSet,
    pub protocol_version: u16,
    /// Serialized host messages travel to the connection's writer task.
    pub control_tx: mpsc::Sender<Vec<u8>>,
}

/// Per-stream send-side state.
pub struct StreamState {
    pub announce: StreamAnnounce,
    pub packetizer: Mutex<Packetizer>,
    pub encoder: Mutex<EncoderControl>,
    /// Set by client keyframe requests; consumed by the encode path.
    pub keyframe_needed: AtomicBool,
    /// Client-requested stream scale, in thousandths.
    pub requested_scale_milli: AtomicU32,
}

impl StreamState {
    pub fn new(announce: StreamAnnounce, encoder: EncoderControl, max_payload: usize) -> Self {
        Self {
            packetizer: Mutex::new(Packetizer::new(announce.stream_id, max_payload)),
            encoder: Mutex::new(encoder),
            keyframe_needed: AtomicBool::new(true),
            requested_scale_milli: AtomicU32::new(1000),
            announce,
        }
    }

    /// Consume a pending keyframe request.
    pub fn take_keyframe_needed(&self) -> bool {
        self.keyframe_needed.swap(false, Ordering::AcqRel)
    }
}

pub struct HostState {
    pub config: HostConfig,
    pub udp_socket: Arc<UdpSocket>,
    session: Mutex<Option<ActiveSession>>,
    media: ArcSwap<MediaSecurity>,
    client_media_addr: ArcSwapOption<SocketAddr>,
    pub streams: DashMap<StreamId, Arc<StreamState>>,
    next_stream_id: AtomicU32,
    datagrams_sent: AtomicU64,
    registrations_rejected: AtomicU64,
}

impl HostState {
    pub fn new(config: HostConfig, udp_socket: Arc<UdpSocket>) -> Self {
        Self {
            config,
            udp_socket,
            session: Mutex::new(None),
            media: ArcSwap::from_pointee(MediaSecurity::default()),
            client_media_addr: ArcSwapOption::empty(),
            streams: DashMap::new(),
            next_stream_id: AtomicU32::new(1),
            datagrams_sent: AtomicU64::new(0),
            registrations_rejected: AtomicU64::new(0),
        }
    }

    pub fn busy(&self) -> bool {
        self.session.lock().expect("session lock").is_some()
    }

    /// Install the session established by a successful handshake.
    pub fn install_session(
        &self,
        accepted: &AcceptedSession,
        control_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), mirage_crypto::CryptoError> {
        let cipher = if accepted
            .negotiated_features
            .contains(FeatureSet::MEDIA_ENCRYPTION)
        {
            Some(Arc::new(MediaCipher::from_media_key(&accepted.media_key)?))
        } else {
            None
        };

        self.media.store(Arc::new(MediaSecurity { cipher }));
        *self.session.lock().expect("session lock") = Some(ActiveSession {
            peer_key_id: accepted.peer_key_id,
            client_device_id: accepted.client_device_id,
            udp_registration_token: accepted.udp_registration_token,
            negotiated_features: accepted.negotiated_features,
            protocol_version: accepted.protocol_version,
            control_tx,
        });
        Ok(())
    }

    /// Tear down the session: forget keys, return address and streams.
    pub fn clear_session(&self) {
        *self.session.lock().expect("session lock") = None;
        self.media.store(Arc::new(MediaSecurity::default()));
        self.client_media_addr.store(None);
        self.streams.clear();
        info!("session cleared");
    }

    pub fn control_tx(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.session
            .lock()
            .expect("session lock")
            .as_ref()
            .map(|s| s.control_tx.clone())
    }

    pub fn with_session<T>(&self, f: impl FnOnce(&ActiveSession) -> T) -> Option<T> {
        self.session.lock().expect("session lock").as_ref().map(f)
    }

    /// Allocate a stream id and register its send-side state.
    pub fn register_stream(&self, kind: StreamKind, width: u32, height: u32) -> Arc<StreamState> {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::AcqRel);
        let announce = StreamAnnounce {
            stream_id,
            kind,
            width,
            height,
            fps: self.config.target_frame_rate.as_u16(),
            dimension_token: 1,
        };
        let encoder = EncoderControl::new(
            stream_id,
            self.config.encoder_settings(),
            mirage_protocol::types::LatencyMode::Auto,
            width,
            height,
            announce.fps,
        );
        let state = Arc::new(StreamState::new(
            announce,
            encoder,
            mirage_protocol::fragment::MAX_VIDEO_PAYLOAD_SIZE
                - mirage_crypto::GCM_TAG_SIZE,
        ));
        self.streams.insert(stream_id, state.clone());
        state
    }

    pub fn client_media_addr(&self) -> Option<SocketAddr> {
        self.client_media_addr.load_full().map(|a| *a)
    }

    /// Handle the client's registration datagram, learning its return
    /// address. The device id must match the session established over the
    /// control channel.
    pub fn handle_registration(&self, data: &[u8], src: SocketAddr) {
        let reg = match UdpRegistration::decode(data) {
            Ok(reg) => reg,
            Err(e) => {
                self.registrations_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(src = %src, error = %e, "bad registration datagram");
                return;
            }
        };

        let device_matches = self
            .with_session(|s| bool::from(s.client_device_id.ct_eq(&reg.device_id)))
            .unwrap_or(false);
        if !device_matches {
            self.registrations_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(src = %src, stream_id = reg.stream_id, "registration from unknown device");
            return;
        }

        debug!(src = %src, stream_id = reg.stream_id, "learned client media address");
        self.client_media_addr.store(Some(Arc::new(src)));
    }

    /// Packetize one encoded frame under the current media security
    /// context. Separated from sending so it is testable without sockets.
    pub fn packetize_frame(
        &self,
        stream: &StreamState,
        encoded: &[u8],
        meta: FrameMeta,
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let media = self.media.load();
        let mut packetizer = stream.packetizer.lock().expect("packetizer lock");
        packetizer.packetize(
            encoded,
            meta,
            media
                .cipher
                .as_deref()
                .map(|c| (c, Direction::HostToClient)),
        )
    }

    /// Packetize and transmit one encoded frame to the registered client.
    pub async fn send_frame(
        &self,
        stream: &StreamState,
        encoded: &[u8],
        meta: FrameMeta,
    ) -> Result<(), ProtocolError> {
        let Some(addr) = self.client_media_addr() else {
            // Client has not registered yet; the frame has nowhere to go.
            debug!(stream_id = stream.announce.stream_id, "dropping frame, no client address");
            return Ok(());
        };

        let datagrams = self.packetize_frame(stream, encoded, meta)?;
        for datagram in datagrams {
            self.udp_socket.send_to(&datagram, addr).await?;
            self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Run the host's UDP receive loop. The only expected inbound datagrams
/// are client registrations; anything else is counted and dropped.
pub async fn run_udp_loop(socket: Arc<UdpSocket>, state: Arc<HostState>) {
    let mut buf = vec![0u8; 1500];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "UDP recv error");
                continue;
            }
        };
        state.handle_registration(&buf[..len], src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirage_protocol::fragment::ContentRect;
    use mirage_protocol::packet::deserialize_fragment;
    use zeroize::Zeroizing;

    async fn state() -> HostState {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        HostState::new(HostConfig::default(), socket)
    }

    fn accepted(device_id: [u8; 16]) -> AcceptedSession {
        AcceptedSession {
            peer_key_id: [1; 32],
            client_device_id: device_id,
            media_key: Zeroizing::new([7; 32]),
            udp_registration_token: [2; 32],
            negotiated_features: FeatureSet::all_supported(),
            protocol_version: 1,
        }
    }

    fn meta() -> FrameMeta {
        FrameMeta {
            keyframe: true,
            timestamp: 0,
            content_rect: ContentRect::default(),
            dimension_token: 1,
            epoch: 0,
        }
    }

    #[tokio::test]
    async fn session_slot_tracks_busy() {
        let state = state().await;
        assert!(!state.busy());

        let (tx, _rx) = mpsc::channel(4);
        state.install_session(&accepted([3; 16]), tx).unwrap();
        assert!(state.busy());

        state.clear_session();
        assert!(!state.busy());
    }

    #[tokio::test]
    async fn registration_learns_address_only_for_session_device() {
        let state = state().await;
        let (tx, _rx) = mpsc::channel(4);
        state.install_session(&accepted([3; 16]), tx).unwrap();

        let src: SocketAddr = "192.168.1.50:50000".parse().unwrap();
        let other = UdpRegistration {
            stream_id: 1,
            device_id: [9; 16],
        };
        state.handle_registration(&other.encode(), src);
        assert!(state.client_media_addr().is_none());

        let ours = UdpRegistration {
            stream_id: 1,
            device_id: [3; 16],
        };
        state.handle_registration(&ours.encode(), src);
        assert_eq!(state.client_media_addr(), Some(src));
    }

    #[tokio::test]
    async fn frames_are_sealed_under_the_session_key() {
        let state = state().await;
        let (tx, _rx) = mpsc::channel(4);
        let session = accepted([3; 16]);
        state.install_session(&session, tx).unwrap();

        let stream = state.register_stream(StreamKind::DesktopVideo, 1920, 1080);
        let datagrams = state
            .packetize_frame(&stream, &[1, 2, 3, 4], meta())
            .unwrap();
        assert_eq!(datagrams.len(), 1);

        let cipher = MediaCipher::from_media_key(&session.media_key).unwrap();
        let (header, payload) =
            deserialize_fragment(&datagrams[0], Some((&cipher, Direction::HostToClient))).unwrap();
        assert!(header.flags.encrypted());
        assert_eq!(payload, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn teardown_disables_encryption_context() {
        let state = state().await;
        let (tx, _rx) = mpsc::channel(4);
        state.install_session(&accepted([3; 16]), tx).unwrap();
        let stream = state.register_stream(StreamKind::DesktopVideo, 640, 480);
        state.clear_session();

        // Stream map was cleared with the session.
        assert!(state.streams.is_empty());

        // The retained handle packetizes plaintext now.
        let datagrams = state.packetize_frame(&stream, &[9, 9], meta()).unwrap();
        let (header, _) = deserialize_fragment(&datagrams[0], None).unwrap();
        assert!(!header.flags.encrypted());
    }

    #[tokio::test]
    async fn keyframe_flag_is_consumed_once() {
        let state = state().await;
        let stream = state.register_stream(StreamKind::DesktopVideo, 640, 480);
        assert!(stream.take_keyframe_needed());
        assert!(!stream.take_keyframe_needed());

        stream.keyframe_needed.store(true, Ordering::Release);
        assert!(stream.take_keyframe_needed());
    }

    #[tokio::test]
    async fn stream_ids_are_unique() {
        let state = state().await;
        let a = state.register_stream(StreamKind::DesktopVideo, 640, 480);
        let b = state.register_stream(StreamKind::Audio, 0, 0);
        assert_ne!(a.announce.stream_id, b.announce.stream_id);
    }
}
