//! Host-side hello validation and session key establishment.
//!
//! Validation order matters: cheap structural checks (fingerprint) come
//! before the replay window, which comes before signature verification, so
//! a flood of junk hellos costs as little as possible. Only a hello that
//! passes every check consumes the single client slot.

use std::time::{SystemTime, UNIX_EPOCH};

use mirage_crypto::agreement::{derive_media_key, EphemeralDh};
use mirage_crypto::identity::{self, IdentityKeyPair, KeyId};
use mirage_crypto::replay::ReplayGuard;
use mirage_protocol::codec::PROTOCOL_VERSION;
use mirage_protocol::messages::{
    hello_response_signing_context, hello_signing_context, Hello, HelloResponse, HostInfo,
    IdentityEnvelope, Negotiation, ProtocolMismatch, RejectionReason,
    HELLO_RESPONSE_SIGNING_LABEL, HELLO_SIGNING_LABEL,
};
use mirage_protocol::types::FeatureSet;
use rand::RngCore;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// External trust decision (pairing UI, allow lists). The core only asks.
pub trait TrustDecider: Send + Sync {
    fn is_trusted(&self, key_id: &KeyId, device_name: &str) -> bool;
}

/// Accept every identity; useful for tests and closed networks.
pub struct TrustAll;

impl TrustDecider for TrustAll {
    fn is_trusted(&self, _key_id: &KeyId, _device_name: &str) -> bool {
        true
    }
}

/// Everything a successfully accepted hello establishes.
pub struct AcceptedSession {
    pub peer_key_id: KeyId,
    pub client_device_id: [u8; 16],
    pub media_key: Zeroizing<[u8; 32]>,
    pub udp_registration_token: [u8; 32],
    pub negotiated_features: FeatureSet,
    pub protocol_version: u16,
}

/// Outcome of processing one hello.
pub struct HandshakeOutcome {
    pub response: HelloResponse,
    pub session: Option<AcceptedSession>,
}

pub struct HelloValidator {
    identity: IdentityKeyPair,
    host_info: HostInfo,
    data_port: u16,
    media_encryption_required: bool,
    update_trigger_allowed: bool,
    replay: ReplayGuard,
}

impl HelloValidator {
    pub fn new(
        identity: IdentityKeyPair,
        host_info: HostInfo,
        data_port: u16,
        media_encryption_required: bool,
        update_trigger_allowed: bool,
    ) -> Self {
        Self {
            identity,
            host_info,
            data_port,
            media_encryption_required,
            update_trigger_allowed,
            replay: ReplayGuard::default(),
        }
    }

    /// Run the full validation sequence against one hello.
    ///
    /// `busy` reflects whether the single client slot is taken. `now_ms`
    /// is wall-clock milliseconds for the replay window.
    pub fn process(
        &mut self,
        hello: &Hello,
        trust: &dyn TrustDecider,
        busy: bool,
        now_ms: u64,
    ) -> HandshakeOutcome {
        let peer = &hello.identity;

        // 1. Fingerprint must match the key it names.
        if identity::verify_key_id(&peer.key_id, &peer.public_key).is_err() {
            warn!("hello rejected: key id does not match public key");
            return self.reject(hello, RejectionReason::InvalidIdentity);
        }

        // 2. Replay window.
        if let Err(e) = self
            .replay
            .check_and_record(peer.ts_ms, peer.nonce, now_ms)
        {
            warn!(error = %e, "hello rejected: replay check failed");
            return self.reject(hello, RejectionReason::InvalidIdentity);
        }

        // 3. Signature over the canonical payload.
        let context = hello_signing_context(
            &hello.device_info.device_id,
            hello.protocol_version,
            hello.features,
        );
        let payload = peer.canonical_payload(HELLO_SIGNING_LABEL, &context);
        if identity::verify(&peer.public_key, &payload, &peer.signature).is_err() {
            warn!("hello rejected: bad signature");
            return self.reject(hello, RejectionReason::InvalidIdentity);
        }

        // 4. Protocol version.
        if hello.protocol_version != PROTOCOL_VERSION {
            info!(
                client = hello.protocol_version,
                host = PROTOCOL_VERSION,
                "hello rejected: protocol version mismatch"
            );
            return self.reject_version_mismatch(hello);
        }

        // 5. Required features.
        let required = if self.media_encryption_required {
            FeatureSet::required()
        } else {
            FeatureSet(0)
        };
        if !hello.features.contains(required) {
            return self.reject(hello, RejectionReason::ProtocolFeaturesMismatch);
        }

        // 6. Capacity.
        if busy {
            return self.reject(hello, RejectionReason::HostBusy);
        }

        // 7. Trust decision is external.
        if !trust.is_trusted(&peer.key_id, &hello.device_info.name) {
            info!(device = %hello.device_info.name, "hello rejected: not trusted");
            return self.reject(hello, RejectionReason::NotTrusted);
        }

        // 8. Accept: agree on a media key and sign the response.
        self.accept(hello, now_ms)
    }

    fn accept(&self, hello: &Hello, now_ms: u64) -> HandshakeOutcome {
        let Ok(dh) = EphemeralDh::generate() else {
            return self.reject(hello, RejectionReason::HostBusy);
        };

        let mut token = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);
        let mut host_nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut host_nonce);

        let dh_public = dh.public_key().to_vec();
        let Ok(shared) = dh.agree(&hello.identity.dh_public) else {
            warn!("hello rejected: invalid client agreement key");
            return self.reject(hello, RejectionReason::InvalidIdentity);
        };

        let media_key = derive_media_key(&shared, &host_nonce, &hello.identity.nonce, &token);

        let selected = hello.features.intersection(FeatureSet::all_supported());
        let negotiation = Negotiation {
            protocol_version: PROTOCOL_VERSION,
            supported_features: FeatureSet::all_supported(),
            selected_features: selected,
        };

        let mut envelope = IdentityEnvelope {
            key_id: self.identity.key_id(),
            public_key: self.identity.public_key(),
            dh_public,
            ts_ms: now_ms,
            nonce: host_nonce,
            signature: Vec::new(),
        };
        let context = hello_response_signing_context(
            &hello.identity.nonce,
            &token,
            self.data_port,
            true,
        );
        let payload = envelope.canonical_payload(HELLO_RESPONSE_SIGNING_LABEL, &context);
        envelope.signature = self.identity.sign(&payload);

        let response = HelloResponse {
            accepted: true,
            host_info: self.host_info.clone(),
            data_port: self.data_port,
            negotiation,
            request_nonce: hello.identity.nonce,
            media_encryption_enabled: selected.contains(FeatureSet::MEDIA_ENCRYPTION),
            udp_registration_token: token,
            identity: envelope,
            rejection_reason: None,
            protocol_mismatch: None,
        };

        info!(
            device = %hello.device_info.name,
            features = ?selected,
            "hello accepted"
        );

        HandshakeOutcome {
            session: Some(AcceptedSession {
                peer_key_id: hello.identity.key_id,
                client_device_id: hello.device_info.device_id,
                media_key,
                udp_registration_token: token,
                negotiated_features: selected,
                protocol_version: PROTOCOL_VERSION,
            }),
            response,
        }
    }

    fn reject(&self, hello: &Hello, reason: RejectionReason) -> HandshakeOutcome {
        HandshakeOutcome {
            response: self.rejection_response(hello, reason, None),
            session: None,
        }
    }

    fn reject_version_mismatch(&self, hello: &Hello) -> HandshakeOutcome {
        let trigger = hello.request_host_update_on_protocol_mismatch;
        let mismatch = ProtocolMismatch {
            host_version: PROTOCOL_VERSION,
            client_version: hello.protocol_version,
            update_trigger_accepted: trigger.then_some(self.update_trigger_allowed),
            update_trigger_message: (trigger && self.update_trigger_allowed)
                .then(|| "host update check started".to_string()),
        };
        HandshakeOutcome {
            response: self.rejection_response(
                hello,
                RejectionReason::ProtocolVersionMismatch,
                Some(mismatch),
            ),
            session: None,
        }
    }

    fn rejection_response(
        &self,
        hello: &Hello,
        reason: RejectionReason,
        mismatch: Option<ProtocolMismatch>,
    ) -> HelloResponse {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut host_nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut host_nonce);

        // Rejections are signed too, so a client never acts on a spoofed
        // refusal.
        let mut envelope = IdentityEnvelope {
            key_id: self.identity.key_id(),
            public_key: self.identity.public_key(),
            dh_public: Vec::new(),
            ts_ms: now_ms,
            nonce: host_nonce,
            signature: Vec::new(),
        };
        let token = [0u8; 32];
        let context =
            hello_response_signing_context(&hello.identity.nonce, &token, self.data_port, false);
        let payload = envelope.canonical_payload(HELLO_RESPONSE_SIGNING_LABEL, &context);
        envelope.signature = self.identity.sign(&payload);

        HelloResponse {
            accepted: false,
            host_info: self.host_info.clone(),
            data_port: self.data_port,
            negotiation: Negotiation {
                protocol_version: PROTOCOL_VERSION,
                supported_features: FeatureSet::all_supported(),
                selected_features: FeatureSet(0),
            },
            request_nonce: hello.identity.nonce,
            media_encryption_enabled: false,
            udp_registration_token: token,
            identity: envelope,
            rejection_reason: Some(reason),
            protocol_mismatch: mismatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirage_protocol::messages::ClientDeviceInfo;

    struct TrustNone;

    impl TrustDecider for TrustNone {
        fn is_trusted(&self, _key_id: &KeyId, _device_name: &str) -> bool {
            false
        }
    }

    fn host_info() -> HostInfo {
        HostInfo {
            device_id: [9; 16],
            name: "studio".into(),
            platform: "linux".into(),
        }
    }

    fn validator() -> HelloValidator {
        HelloValidator::new(
            IdentityKeyPair::generate().unwrap(),
            host_info(),
            47100,
            true,
            true,
        )
    }

    /// Build a correctly signed hello; returns the client DH half too.
    fn signed_hello(version: u16, features: FeatureSet, ts_ms: u64) -> (Hello, EphemeralDh, IdentityKeyPair) {
        let identity = IdentityKeyPair::generate().unwrap();
        let dh = EphemeralDh::generate().unwrap();
        let device_id = [3u8; 16];
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut envelope = IdentityEnvelope {
            key_id: identity.key_id(),
            public_key: identity.public_key(),
            dh_public: dh.public_key().to_vec(),
            ts_ms,
            nonce,
            signature: Vec::new(),
        };
        let context = hello_signing_context(&device_id, version, features);
        let payload = envelope.canonical_payload(HELLO_SIGNING_LABEL, &context);
        envelope.signature = identity.sign(&payload);

        let hello = Hello {
            device_info: ClientDeviceInfo {
                device_id,
                name: "tablet".into(),
                platform: "ios".into(),
            },
            protocol_version: version,
            features,
            identity: envelope,
            request_host_update_on_protocol_mismatch: true,
        };
        (hello, dh, identity)
    }

    #[test]
    fn valid_hello_is_accepted_with_matching_media_key() {
        let mut v = validator();
        let (hello, dh, _) = signed_hello(PROTOCOL_VERSION, FeatureSet::all_supported(), 1_000);

        let outcome = v.process(&hello, &TrustAll, false, 1_000);
        assert!(outcome.response.accepted);
        let session = outcome.session.expect("session established");

        // Client derives the same media key from the response.
        let resp = &outcome.response;
        let shared = dh.agree(&resp.identity.dh_public).unwrap();
        let client_key = derive_media_key(
            &shared,
            &resp.identity.nonce,
            &hello.identity.nonce,
            &resp.udp_registration_token,
        );
        assert_eq!(*client_key, *session.media_key);
    }

    #[test]
    fn version_mismatch_reports_both_versions() {
        let mut v = validator();
        let (hello, _, _) = signed_hello(2, FeatureSet::all_supported(), 1_000);

        let outcome = v.process(&hello, &TrustAll, false, 1_000);
        assert!(!outcome.response.accepted);
        assert_eq!(
            outcome.response.rejection_reason,
            Some(RejectionReason::ProtocolVersionMismatch)
        );
        let mismatch = outcome.response.protocol_mismatch.unwrap();
        assert_eq!(mismatch.host_version, PROTOCOL_VERSION);
        assert_eq!(mismatch.client_version, 2);
        assert_eq!(mismatch.update_trigger_accepted, Some(true));
        assert!(outcome.session.is_none());
    }

    #[test]
    fn missing_required_features_rejected() {
        let mut v = validator();
        let (hello, _, _) = signed_hello(PROTOCOL_VERSION, FeatureSet(0), 1_000);
        let outcome = v.process(&hello, &TrustAll, false, 1_000);
        assert_eq!(
            outcome.response.rejection_reason,
            Some(RejectionReason::ProtocolFeaturesMismatch)
        );
    }

    #[test]
    fn busy_host_rejects() {
        let mut v = validator();
        let (hello, _, _) = signed_hello(PROTOCOL_VERSION, FeatureSet::all_supported(), 1_000);
        let outcome = v.process(&hello, &TrustAll, true, 1_000);
        assert_eq!(
            outcome.response.rejection_reason,
            Some(RejectionReason::HostBusy)
        );
    }

    #[test]
    fn untrusted_client_rejected() {
        let mut v = validator();
        let (hello, _, _) = signed_hello(PROTOCOL_VERSION, FeatureSet::all_supported(), 1_000);
        let outcome = v.process(&hello, &TrustNone, false, 1_000);
        assert_eq!(
            outcome.response.rejection_reason,
            Some(RejectionReason::NotTrusted)
        );
    }

    #[test]
    fn replayed_hello_rejected() {
        let mut v = validator();
        let (hello, _, _) = signed_hello(PROTOCOL_VERSION, FeatureSet::all_supported(), 1_000);

        assert!(v.process(&hello, &TrustAll, false, 1_000).response.accepted);
        let outcome = v.process(&hello, &TrustAll, false, 1_100);
        assert_eq!(
            outcome.response.rejection_reason,
            Some(RejectionReason::InvalidIdentity)
        );
    }

    #[test]
    fn tampered_signature_rejected() {
        let mut v = validator();
        let (mut hello, _, _) = signed_hello(PROTOCOL_VERSION, FeatureSet::all_supported(), 1_000);
        hello.identity.signature[0] ^= 0xFF;
        let outcome = v.process(&hello, &TrustAll, false, 1_000);
        assert!(!outcome.response.accepted);
    }

    #[test]
    fn wrong_key_id_rejected() {
        let mut v = validator();
        let (mut hello, _, _) = signed_hello(PROTOCOL_VERSION, FeatureSet::all_supported(), 1_000);
        hello.identity.key_id[0] ^= 0xFF;
        let outcome = v.process(&hello, &TrustAll, false, 1_000);
        assert!(!outcome.response.accepted);
    }

    #[test]
    fn stale_timestamp_rejected() {
        let mut v = validator();
        let (hello, _, _) = signed_hello(PROTOCOL_VERSION, FeatureSet::all_supported(), 1_000);
        // Host clock is 10 minutes ahead.
        let outcome = v.process(&hello, &TrustAll, false, 600_000);
        assert!(!outcome.response.accepted);
    }

    #[test]
    fn rejection_is_signed() {
        let mut v = validator();
        let (hello, _, _) = signed_hello(2, FeatureSet::all_supported(), 1_000);
        let outcome = v.process(&hello, &TrustAll, false, 1_000);
        let resp = &outcome.response;

        let context = hello_response_signing_context(
            &resp.request_nonce,
            &resp.udp_registration_token,
            resp.data_port,
            false,
        );
        let payload = resp
            .identity
            .canonical_payload(HELLO_RESPONSE_SIGNING_LABEL, &context);
        identity::verify(&resp.identity.public_key, &payload, &resp.identity.signature).unwrap();
    }
}
