//! Client side of a Mirage session.
//!
//! Connects to a host, runs the signed hello exchange, registers on the
//! media socket and wires incoming fragments through reassembly, decode
//! and the frame cache. Rendering stays with the embedder: each stream
//! exposes its [`mirage_stream::FrameCache`] and a frame-ready notifier,
//! which plug straight into [`mirage_stream::render::RenderLoop`].

pub mod control;
pub mod handshake;
pub mod receive;
pub mod session;

pub use handshake::HandshakeError;
pub use receive::DecoderFactory;
pub use session::{ClientConfig, ClientSession, SessionEvent};
