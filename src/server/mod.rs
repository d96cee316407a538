//! # Server Module
//!
//! The wire side of the engine, built on `may` coroutines:
//!
//! - [`http_server`] binds the HTTP and HTTPS listeners and spawns one
//!   coroutine per accepted connection
//! - [`transport`] splits a socket (plain or rustls) into a reader and a
//!   shareable writer
//! - [`request`], [`chunked`] and [`body`] decode request heads and bodies
//!   incrementally, spilling large uploads to temporary files
//! - [`response`] writes results buffered or chunked
//!
//! A connection coroutine decodes one request at a time, dispatches it, waits
//! for async results without blocking its worker thread, and writes the
//! response before reading the next request.

pub mod body;
pub mod chunked;
mod connection;
pub mod http_server;
pub mod request;
pub mod response;
pub mod transport;

pub use http_server::{EngineServer, ServerHandle};
pub use response::{Persistence, ResponseWriter};
