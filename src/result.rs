//! Route outcomes.
//!
//! A route returns an [`Outcome`]: either a ready [`HttpResult`] or an
//! [`AsyncResult`] whose computation runs on the async bridge. An
//! `AsyncResult` is never written to the wire itself.

use crate::context::Context;
use crate::cookies::Cookie;
use crate::renderable::{Renderable, MIME_JSON, MIME_TEXT};
use http::StatusCode;
use serde_json::{json, Value};
use std::fmt;

/// Status, headers, cookies, charset and body of a response.
#[derive(Debug)]
pub struct HttpResult {
    pub status: StatusCode,
    /// Response headers in insertion order; names are matched case-insensitively
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<Cookie>,
    pub charset: Option<String>,
    /// Explicit content type; the body's own MIME type applies otherwise
    pub content_type: Option<String>,
    pub body: Option<Renderable>,
}

impl HttpResult {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            cookies: Vec::new(),
            charset: None,
            content_type: None,
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// `200 OK` with a text body.
    pub fn ok_text(text: impl Into<String>) -> Self {
        Self::ok().render(Renderable::text(text))
    }

    /// `200 OK` with a JSON body.
    pub fn ok_json(node: Value) -> Self {
        Self::ok().render(Renderable::json(node))
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND)
    }

    pub fn bad_request() -> Self {
        Self::new(StatusCode::BAD_REQUEST)
    }

    pub fn not_modified() -> Self {
        Self::new(StatusCode::NOT_MODIFIED)
    }

    pub fn redirect(location: impl Into<String>) -> Self {
        Self::new(StatusCode::SEE_OTHER).with("Location", location)
    }

    /// `500` carrying `{"error": "<message>"}` built from the root cause of `failure`.
    pub fn internal_server_error(failure: &anyhow::Error) -> Self {
        let message = failure.root_cause().to_string();
        Self::new(StatusCode::INTERNAL_SERVER_ERROR)
            .render(Renderable::json(json!({ "error": message })))
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn render(mut self, body: Renderable) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the content type. A `charset=` parameter is split off into
    /// [`charset`](Self::charset).
    pub fn as_type(mut self, content_type: &str) -> Self {
        let mut parts = content_type.split(';');
        let mime = parts.next().unwrap_or("").trim().to_string();
        for param in parts {
            if let Some((k, v)) = param.trim().split_once('=') {
                if k.trim().eq_ignore_ascii_case("charset") {
                    self.charset = Some(v.trim().trim_matches('"').to_string());
                }
            }
        }
        if let Some(body) = self.body.as_mut() {
            body.adapt_to(&mime);
        }
        self.content_type = Some(mime);
        self
    }

    pub fn as_json(self) -> Self {
        self.as_type(MIME_JSON)
    }

    pub fn as_text(self) -> Self {
        self.as_type(MIME_TEXT)
    }

    /// Append a header, replacing any value with the same name.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// The explicit content type, or the body's MIME type.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type
            .as_deref()
            .or_else(|| self.body.as_ref().and_then(Renderable::mime_type))
    }

    /// Content type with the charset parameter, when one is set.
    pub fn full_content_type(&self) -> Option<String> {
        let mime = self.content_type()?;
        Some(match &self.charset {
            Some(cs) => format!("{mime}; charset={cs}"),
            None => mime.to_string(),
        })
    }
}

type Callable = Box<dyn FnOnce(&mut Context) -> anyhow::Result<HttpResult> + Send + 'static>;

/// A deferred computation producing the response.
///
/// Headers set here are merged into the final result unless it defines them.
pub struct AsyncResult {
    pub headers: Vec<(String, String)>,
    callable: Callable,
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl AsyncResult {
    pub fn new<F>(callable: F) -> Self
    where
        F: FnOnce(&mut Context) -> anyhow::Result<HttpResult> + Send + 'static,
    {
        Self {
            headers: Vec::new(),
            callable: Box::new(callable),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Run the computation and merge the headers into its result.
    pub fn run(self, ctx: &mut Context) -> anyhow::Result<HttpResult> {
        let AsyncResult { headers, callable } = self;
        let mut result = callable(ctx)?;
        for (name, value) in headers {
            if !result.has_header(&name) {
                result.headers.push((name, value));
            }
        }
        Ok(result)
    }
}

/// What a route produced.
#[derive(Debug)]
pub enum Outcome {
    Ready(HttpResult),
    Async(AsyncResult),
}

impl From<HttpResult> for Outcome {
    fn from(r: HttpResult) -> Self {
        Outcome::Ready(r)
    }
}

impl From<AsyncResult> for Outcome {
    fn from(r: AsyncResult) -> Self {
        Outcome::Async(r)
    }
}
