//! # Dispatcher Module
//!
//! The dispatcher turns a fully decoded [`Context`](crate::context::Context)
//! into an [`Outcome`](crate::result::Outcome) and keeps the registry of open
//! WebSocket channels.
//!
//! ## Request Flow
//!
//! 1. A body decoding failure stored on the context goes straight to the
//!    error handler chain (400 by default)
//! 2. The [`Router`](crate::router::Router) is asked for a route; a miss goes
//!    through `on_no_route` (404 by default)
//! 3. The route is invoked under `catch_unwind`; errors and panics go through
//!    `on_error` (500 from the root cause by default)
//! 4. An `Outcome::Async` is handed to the [`AsyncBridge`], which runs it on
//!    its own coroutine and gives the context back on completion
//!
//! ## Push Channels
//!
//! Upgraded connections register under their request path. Listeners are
//! notified of `opened`, `received` and `closed`; `publish_*` writes to every
//! socket of a URI and `send_*` to one of them.

mod async_bridge;
mod channels;
mod core;

pub use async_bridge::{AsyncBridge, Completion};
pub use channels::{Channels, FrameSink, WebSocketListener};
pub use core::Dispatcher;
