//! # sagewire
//!
//! **sagewire** is an embeddable HTTP/1.1 and WebSocket engine built on the `may` coroutine
//! runtime. It decodes raw requests, hands them to a pluggable [`router`], writes buffered or
//! chunked responses, negotiates content, upgrades connections to WebSocket channels and lets
//! handlers return deferred results that complete on their own coroutine.
//!
//! ## Architecture
//!
//! - **[`server`]** - listeners, per-connection coroutines, request decoding and response writing
//! - **[`dispatcher`]** - routing, error recovery, the WebSocket channel registry and the async bridge
//! - **[`websocket`]** - RFC 6455 handshake and frame codec
//! - **[`context`]**, **[`result`]**, **[`renderable`]** - the request and response model
//! - **[`content`]** - serializers selected by content type
//! - **[`router`]**, **[`error_handler`]** - the traits applications plug in
//! - **[`cache`]**, **[`static_files`]** - conditional GET and directory serving
//! - **[`config`]**, **[`otel`]** - YAML/env configuration and `tracing` setup
//!
//! ### Request Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Client
//!     participant Conn as server::connection
//!     participant Disp as Dispatcher
//!     participant Route
//!     participant Bridge as AsyncBridge
//!     participant Writer as ResponseWriter
//!
//!     Client->>Conn: HTTP request
//!     Conn->>Conn: decode head + body
//!     alt WebSocket upgrade
//!         Conn-->>Client: 101 Switching Protocols
//!         Conn->>Disp: add_web_socket(uri, client)
//!     else plain request
//!         Conn->>Disp: dispatch(ctx)
//!         Disp->>Route: invoke(ctx)
//!         alt ready result
//!             Route-->>Disp: HttpResult
//!             Disp-->>Conn: Outcome::Ready
//!         else async result
//!             Route-->>Disp: AsyncResult
//!             Disp-->>Conn: Outcome::Async
//!             Conn->>Bridge: submit(ctx, deferred)
//!             Bridge-->>Conn: Completion
//!         end
//!         Conn->>Writer: write(result)
//!         Writer-->>Client: buffered or chunked response
//!     end
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sagewire::config::EngineConfig;
//! use sagewire::dispatcher::Dispatcher;
//! use sagewire::result::HttpResult;
//! use sagewire::router::RouteTable;
//! use sagewire::server::EngineServer;
//! use std::sync::Arc;
//!
//! let mut routes = RouteTable::new();
//! routes.get("/x", |_ctx| Ok(HttpResult::ok_text("hi").as_text()));
//!
//! let dispatcher = Arc::new(Dispatcher::new(Arc::new(routes)));
//! let handle = EngineServer::new(EngineConfig::default(), dispatcher).start()?;
//! handle.wait_ready()?;
//! handle.join().ok();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Configuration
//!
//! See [`config::EngineConfig`] for the YAML keys and the `SAGE_*` environment overrides, and
//! [`otel::LogConfig`] for the logging variables.

pub mod cache;
pub mod cli;
pub mod config;
pub mod content;
pub mod context;
pub mod cookies;
pub mod dispatcher;
pub mod error;
pub mod error_handler;
pub mod ids;
pub mod otel;
pub mod renderable;
pub mod result;
pub mod router;
pub mod server;
pub mod session;
pub mod static_files;
pub mod websocket;

pub use config::EngineConfig;
pub use context::Context;
pub use dispatcher::{Dispatcher, WebSocketListener};
pub use error::EngineError;
pub use renderable::Renderable;
pub use result::{AsyncResult, HttpResult, Outcome};
pub use router::{Route, RouteTable, Router};
pub use server::{EngineServer, ServerHandle};
