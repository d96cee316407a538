//! WebSocket support: the opening handshake and RFC 6455 framing.
//!
//! After a successful handshake the connection bypasses routing. Frames go
//! straight to the dispatcher's channel registry, keyed by the request path.

pub mod frame;
pub mod handshake;

pub use frame::{Frame, FrameDecoder, Message, MessageAssembler, OpCode};
pub use handshake::{negotiate, Accepted, Handshake};
