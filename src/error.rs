//! Error types for the wire layer and the engine lifecycle.
//!
//! Handler failures are not represented here: routes return `anyhow::Error`
//! and the dispatcher turns every failure into an [`HttpResult`](crate::result::HttpResult).

use std::fmt;
use std::io;

/// Failure while decoding an inbound HTTP request.
///
/// Head-level errors are transport failures (the connection is closed).
/// Body-level errors are deferred on the [`Context`](crate::context::Context)
/// and surface when the request is dispatched.
#[derive(Debug)]
pub enum DecodeError {
    /// The request line or a header could not be parsed
    MalformedHead(httparse::Error),
    /// The request head exceeded the configured limit
    HeadTooLarge { limit: usize },
    /// Unsupported HTTP method token
    InvalidMethod(String),
    /// `Content-Length` is not a number, or several different values were sent
    InvalidContentLength(String),
    /// `Transfer-Encoding` other than a final `chunked`
    UnsupportedTransferEncoding(String),
    /// A chunk-size line is not valid hexadecimal
    InvalidChunkSize(String),
    /// A chunk was not terminated by CRLF
    MissingChunkTerminator,
    /// The multipart body does not follow RFC 7578 framing
    Multipart(String),
    /// An url-encoded form exceeded the in-memory limit
    FormTooLarge { limit: usize },
    /// Writing an upload to its spill file failed
    Io(io::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::MalformedHead(e) => write!(f, "malformed request head: {e}"),
            DecodeError::HeadTooLarge { limit } => {
                write!(f, "request head larger than {limit} bytes")
            }
            DecodeError::InvalidMethod(m) => write!(f, "invalid HTTP method '{m}'"),
            DecodeError::InvalidContentLength(v) => write!(f, "invalid Content-Length '{v}'"),
            DecodeError::UnsupportedTransferEncoding(v) => {
                write!(f, "unsupported Transfer-Encoding '{v}'")
            }
            DecodeError::InvalidChunkSize(v) => write!(f, "invalid chunk size '{v}'"),
            DecodeError::MissingChunkTerminator => write!(f, "chunk data not followed by CRLF"),
            DecodeError::Multipart(msg) => write!(f, "invalid multipart body: {msg}"),
            DecodeError::FormTooLarge { limit } => {
                write!(f, "url-encoded form larger than {limit} bytes")
            }
            DecodeError::Io(e) => write!(f, "cannot store request body: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::MalformedHead(e) => Some(e),
            DecodeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> Self {
        DecodeError::Io(e)
    }
}

impl From<httparse::Error> for DecodeError {
    fn from(e: httparse::Error) -> Self {
        DecodeError::MalformedHead(e)
    }
}

/// Failure while decoding a WebSocket frame.
///
/// Each variant maps to the close status code sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Client frames must be masked (RFC 6455 §5.1)
    UnmaskedClientFrame,
    /// Reserved bits set without a negotiated extension
    ReservedBits,
    /// Unknown opcode
    InvalidOpcode(u8),
    /// Control frames must not be fragmented nor exceed 125 bytes
    InvalidControlFrame,
    /// Continuation frame without a message in progress, or a new
    /// data frame while one is in progress
    UnexpectedContinuation,
    /// The frame or reassembled message exceeds the configured limit
    PayloadTooLarge { limit: usize },
    /// A text message is not valid UTF-8
    InvalidUtf8,
}

impl FrameError {
    /// Close status code (RFC 6455 §7.4.1) reported to the peer.
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::PayloadTooLarge { .. } => 1009,
            FrameError::InvalidUtf8 => 1007,
            _ => 1002,
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::UnmaskedClientFrame => write!(f, "client frame is not masked"),
            FrameError::ReservedBits => write!(f, "reserved bits set"),
            FrameError::InvalidOpcode(op) => write!(f, "invalid opcode 0x{op:x}"),
            FrameError::InvalidControlFrame => write!(f, "invalid control frame"),
            FrameError::UnexpectedContinuation => write!(f, "unexpected continuation frame"),
            FrameError::PayloadTooLarge { limit } => {
                write!(f, "payload larger than {limit} bytes")
            }
            FrameError::InvalidUtf8 => write!(f, "text message is not valid UTF-8"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Reason a WebSocket upgrade request was rejected as malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Upgrade requests must use GET
    MethodNotGet(String),
    /// `Upgrade: websocket` is missing
    MissingUpgrade,
    /// `Sec-WebSocket-Key` is missing
    MissingKey,
    /// `Sec-WebSocket-Key` is not a base64-encoded 16 byte nonce
    InvalidKey(String),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::MethodNotGet(m) => {
                write!(f, "websocket upgrade must use GET, got {m}")
            }
            HandshakeError::MissingUpgrade => write!(f, "missing 'Upgrade: websocket' header"),
            HandshakeError::MissingKey => write!(f, "missing Sec-WebSocket-Key header"),
            HandshakeError::InvalidKey(k) => write!(f, "invalid Sec-WebSocket-Key '{k}'"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Errors raised while configuring or starting the engine.
#[derive(Debug)]
pub enum EngineError {
    /// Configuration file could not be read or parsed
    Config(String),
    /// TLS material could not be loaded
    Tls(String),
    /// A listener could not be bound
    Bind { addr: String, source: io::Error },
    /// The coroutine runtime refused to spawn an acceptor
    Spawn(io::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Config(msg) => write!(f, "configuration error: {msg}"),
            EngineError::Tls(msg) => write!(f, "TLS configuration error: {msg}"),
            EngineError::Bind { addr, source } => write!(f, "cannot bind {addr}: {source}"),
            EngineError::Spawn(e) => write!(f, "cannot spawn acceptor coroutine: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Bind { source, .. } => Some(source),
            EngineError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}
