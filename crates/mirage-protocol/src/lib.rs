//! Wire protocol for Mirage streams.
//!
//! The media plane is unreliable datagrams: encoded frames are sliced into
//! header-prefixed fragments ([`packetizer`]), carried with CRC or AEAD
//! protection ([`packet`]), and rebuilt in order on the far side
//! ([`reassembler`]). The control plane is a reliable byte stream carrying
//! length-prefixed postcard envelopes ([`codec`], [`messages`]) with
//! latest-by-type coalescing for bursty settings traffic ([`queue`]).

pub mod codec;
pub mod error;
pub mod fragment;
pub mod messages;
pub mod packet;
pub mod packetizer;
pub mod queue;
pub mod reassembler;
pub mod types;

pub use error::ProtocolError;
pub use fragment::{AudioFragmentHeader, ContentRect, FragmentFlags, FragmentHeader};
