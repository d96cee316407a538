//! Error handler chain.
//!
//! Handlers are consulted in registration order and the last non-`None`
//! result wins. When no handler answers, the dispatcher falls back to an
//! empty `404` for routing misses and to a `500` built from the failure's root
//! cause otherwise.

use crate::context::Context;
use crate::error::DecodeError;
use crate::renderable::Renderable;
use crate::result::HttpResult;
use crate::router::Route;
use http::Method;
use serde_json::json;
use std::sync::Arc;

pub trait ErrorHandler: Send + Sync {
    /// No route matched `method` and `path`.
    fn on_no_route(&self, _method: &Method, _path: &str) -> Option<HttpResult> {
        None
    }

    /// `route` (absent when the request body could not be decoded before
    /// routing) failed with `failure`.
    fn on_error(
        &self,
        _ctx: &Context,
        _route: Option<&Arc<dyn Route>>,
        _failure: &anyhow::Error,
    ) -> Option<HttpResult> {
        None
    }
}

/// Answers body decoding failures with `400 Bad Request`.
///
/// Registered by default so that a malformed upload never reaches a route.
#[derive(Debug, Default)]
pub struct BadRequestOnDecodeError;

impl ErrorHandler for BadRequestOnDecodeError {
    fn on_error(
        &self,
        _ctx: &Context,
        _route: Option<&Arc<dyn Route>>,
        failure: &anyhow::Error,
    ) -> Option<HttpResult> {
        let decode = failure.downcast_ref::<DecodeError>()?;
        Some(
            HttpResult::bad_request()
                .render(Renderable::json(json!({ "error": decode.to_string() }))),
        )
    }
}
