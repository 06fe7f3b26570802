//! Client side of the hello exchange.

use std::sync::Arc;

use mirage_crypto::agreement::{derive_media_key, EphemeralDh};
use mirage_crypto::device::DeviceIdentity;
use mirage_crypto::identity::{self, KeyId};
use mirage_crypto::{CryptoError, MediaCipher};
use mirage_protocol::codec::PROTOCOL_VERSION;
use mirage_protocol::messages::{
    hello_response_signing_context, hello_signing_context, ClientDeviceInfo, Hello, HelloResponse,
    IdentityEnvelope, Negotiation, ProtocolMismatch, RejectionReason,
    HELLO_RESPONSE_SIGNING_LABEL, HELLO_SIGNING_LABEL,
};
use mirage_protocol::types::FeatureSet;
use rand::RngCore;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("host rejected hello: {reason:?}")]
    Rejected {
        reason: Option<RejectionReason>,
        mismatch: Option<ProtocolMismatch>,
    },

    #[error("hello response failed verification: {0}")]
    BadResponse(&'static str),

    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

/// Client-side secrets held between sending the hello and verifying the
/// response.
pub struct PendingHandshake {
    dh: EphemeralDh,
    nonce: [u8; 16],
    features: FeatureSet,
}

/// Everything the accepted response establishes on the client.
pub struct EstablishedSession {
    pub cipher: Option<Arc<MediaCipher>>,
    pub media_encryption_enabled: bool,
    pub data_port: u16,
    pub udp_registration_token: [u8; 32],
    pub negotiation: Negotiation,
    pub host_key_id: KeyId,
    pub host_device_id: [u8; 16],
    pub host_name: String,
}

/// Build a signed hello for this device.
pub fn build_hello(
    identity: &DeviceIdentity,
    client_name: &str,
    request_host_update_on_protocol_mismatch: bool,
    now_ms: u64,
) -> Result<(Hello, PendingHandshake), CryptoError> {
    let features = FeatureSet::all_supported();
    let dh = EphemeralDh::generate()?;
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);

    let device_id = *identity.device_id.as_bytes();
    let mut envelope = IdentityEnvelope {
        key_id: identity.key_pair.key_id(),
        public_key: identity.key_pair.public_key(),
        dh_public: dh.public_key().to_vec(),
        ts_ms: now_ms,
        nonce,
        signature: Vec::new(),
    };
    let context = hello_signing_context(&device_id, PROTOCOL_VERSION, features);
    let payload = envelope.canonical_payload(HELLO_SIGNING_LABEL, &context);
    envelope.signature = identity.key_pair.sign(&payload);

    let hello = Hello {
        device_info: ClientDeviceInfo {
            device_id,
            name: client_name.to_string(),
            platform: std::env::consts::OS.to_string(),
        },
        protocol_version: PROTOCOL_VERSION,
        features,
        identity: envelope,
        request_host_update_on_protocol_mismatch,
    };

    Ok((
        hello,
        PendingHandshake {
            dh,
            nonce,
            features,
        },
    ))
}

/// Verify the host's response and derive the session media key.
pub fn verify_response(
    response: &HelloResponse,
    pending: PendingHandshake,
) -> Result<EstablishedSession, HandshakeError> {
    let host = &response.identity;

    identity::verify_key_id(&host.key_id, &host.public_key)
        .map_err(|_| HandshakeError::BadResponse("host key id does not match key"))?;

    if response.request_nonce != pending.nonce {
        return Err(HandshakeError::BadResponse("request nonce not echoed"));
    }

    let context = hello_response_signing_context(
        &pending.nonce,
        &response.udp_registration_token,
        response.data_port,
        response.accepted,
    );
    let payload = host.canonical_payload(HELLO_RESPONSE_SIGNING_LABEL, &context);
    identity::verify(&host.public_key, &payload, &host.signature)
        .map_err(|_| HandshakeError::BadResponse("host signature invalid"))?;

    if !response.accepted {
        return Err(HandshakeError::Rejected {
            reason: response.rejection_reason,
            mismatch: response.protocol_mismatch.clone(),
        });
    }

    if response.negotiation.protocol_version != PROTOCOL_VERSION {
        return Err(HandshakeError::BadResponse(
            "accepted response carries foreign protocol version",
        ));
    }
    let selected = response.negotiation.selected_features;
    if !pending.features.contains(selected) {
        return Err(HandshakeError::BadResponse(
            "host selected features we never offered",
        ));
    }

    let cipher = if response.media_encryption_enabled {
        let shared = pending
            .dh
            .agree(&host.dh_public)
            .map_err(|_| HandshakeError::BadResponse("host agreement key invalid"))?;
        let media_key = derive_media_key(
            &shared,
            &host.nonce,
            &pending.nonce,
            &response.udp_registration_token,
        );
        Some(Arc::new(MediaCipher::from_media_key(&media_key)?))
    } else {
        None
    };

    info!(
        host = %response.host_info.name,
        features = ?selected,
        encrypted = response.media_encryption_enabled,
        "session established"
    );

    Ok(EstablishedSession {
        cipher,
        media_encryption_enabled: response.media_encryption_enabled,
        data_port: response.data_port,
        udp_registration_token: response.udp_registration_token,
        negotiation: response.negotiation,
        host_key_id: host.key_id,
        host_device_id: response.host_info.device_id,
        host_name: response.host_info.name.clone(),
    })
}
