//! # Router Module
//!
//! The dispatcher consumes routing through two traits: a [`Router`] maps a
//! method and a path to a [`Route`], and a `Route` is invoked with the request
//! [`Context`](crate::context::Context) to produce an
//! [`Outcome`](crate::result::Outcome).
//!
//! [`RouteTable`] is a small table of exact paths and prefix mounts that is
//! enough for embedding the engine; applications with richer matching plug
//! in their own `Router`.
//!
//! ## Example
//!
//! ```rust
//! use sagewire::router::{RouteTable, Router};
//! use sagewire::result::HttpResult;
//! use http::Method;
//!
//! let mut routes = RouteTable::new();
//! routes.get("/x", |_ctx| Ok(HttpResult::ok_text("hi").as_text()));
//! assert!(routes.route_for(&Method::GET, "/x").is_some());
//! ```

mod core;

pub use core::{FnRoute, Route, RouteTable, Router};
