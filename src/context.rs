//! Per-request state.
//!
//! A [`Context`] is created when a request head has been decoded and is owned
//! by the connection serving that request. Routes receive it explicitly. It
//! moves to the async bridge when a route defers its result, and it is dropped
//! once the response is written. Dropping it releases spilled upload files.

use crate::error::DecodeError;
use crate::ids::{ConnectionId, RequestId};
use crate::router::Route;
use crate::server::body::{BodyData, DecodedBody, FileUpload};
use crate::server::request::{header_value, parse_query_params, split_target, HeaderVec, RequestHead};
use crate::session::{Flash, Session, SessionCodec};
use http::{Method, Version};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct Context {
    pub request_id: RequestId,
    pub connection_id: ConnectionId,
    method: Method,
    target: String,
    path: String,
    version: Version,
    headers: HeaderVec,
    query: HashMap<String, Vec<String>>,
    cookies: HashMap<String, String>,
    form: HashMap<String, Vec<String>>,
    uploads: Vec<FileUpload>,
    body: Option<BodyData>,
    session: Session,
    flash: Flash,
    attributes: HashMap<String, serde_json::Value>,
    route: Option<Arc<dyn Route>>,
    decode_error: Option<DecodeError>,
    remote_addr: Option<SocketAddr>,
    secure: bool,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.request_id)
            .field("connection_id", &self.connection_id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("uploads", &self.uploads.len())
            .field("decode_error", &self.decode_error)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Build a context for `method` and request target `target`.
    pub fn new(method: Method, target: &str, headers: HeaderVec) -> Self {
        let (path, query) = split_target(target);
        let query = parse_query_params(query);
        let cookies = header_value(&headers, "cookie")
            .map(crate::cookies::parse_cookies)
            .unwrap_or_default();
        let request_id = RequestId::from_header_or_new(header_value(&headers, "x-request-id"));
        Self {
            request_id,
            connection_id: ConnectionId::new(),
            method,
            target: target.to_string(),
            path,
            version: Version::HTTP_11,
            headers,
            query,
            cookies,
            form: HashMap::new(),
            uploads: Vec::new(),
            body: None,
            session: Session::default(),
            flash: Flash::default(),
            attributes: HashMap::new(),
            route: None,
            decode_error: None,
            remote_addr: None,
            secure: false,
        }
    }

    /// Build the context of a decoded request head on connection `connection_id`.
    pub fn from_head(
        head: RequestHead,
        connection_id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        secure: bool,
        codec: &SessionCodec,
    ) -> Self {
        let RequestHead {
            method,
            target,
            version,
            headers,
        } = head;
        let mut ctx = Self::new(method, &target, headers);
        ctx.connection_id = connection_id;
        ctx.version = version;
        ctx.remote_addr = remote_addr;
        ctx.secure = secure;
        let (session, flash) = codec.load(&ctx.cookies);
        ctx.session = session;
        ctx.flash = flash;
        ctx
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Decoded path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request target exactly as received.
    pub fn uri(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Every value of header `name`.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    /// First value of `name` from the query string, then from the form body.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .or_else(|| self.form.get(name))
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values of `name` from the query string and the form body.
    pub fn parameter_values(&self, name: &str) -> Vec<&str> {
        self.query
            .get(name)
            .into_iter()
            .chain(self.form.get(name))
            .flatten()
            .map(String::as_str)
            .collect()
    }

    pub fn query(&self) -> &HashMap<String, Vec<String>> {
        &self.query
    }

    pub fn form(&self) -> &HashMap<String, Vec<String>> {
        &self.form
    }

    pub fn uploads(&self) -> &[FileUpload] {
        &self.uploads
    }

    /// The upload sent for form field `field`.
    pub fn file(&self, field: &str) -> Option<&FileUpload> {
        self.uploads.iter().find(|u| u.field == field)
    }

    /// The raw request body, if one was received.
    pub fn body(&self) -> Option<&BodyData> {
        self.body.as_ref()
    }

    pub fn body_bytes(&self) -> io::Result<Vec<u8>> {
        match &self.body {
            Some(b) => b.to_vec(),
            None => Ok(Vec::new()),
        }
    }

    pub fn body_text(&self) -> io::Result<String> {
        String::from_utf8(self.body_bytes()?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn body_json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(&self.body_bytes()?)?)
    }

    /// Attach a decoded body.
    pub fn set_body(&mut self, decoded: DecodedBody) {
        for (k, mut v) in decoded.form {
            self.form.entry(k).or_default().append(&mut v);
        }
        self.uploads.extend(decoded.uploads);
        self.body = decoded.raw;
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
    }

    /// Media types of the `Accept` header, most preferred first.
    ///
    /// Entries with `q=0` are dropped; equal weights keep header order.
    pub fn media_types(&self) -> Vec<String> {
        let mut weighted: Vec<(f32, String)> = self
            .header_values("accept")
            .flat_map(|v| v.split(','))
            .filter_map(|entry| {
                let mut parts = entry.split(';');
                let mime = parts.next()?.trim().to_ascii_lowercase();
                if mime.is_empty() {
                    return None;
                }
                let q = parts
                    .filter_map(|p| p.trim().strip_prefix("q="))
                    .find_map(|q| q.trim().parse::<f32>().ok())
                    .unwrap_or(1.0);
                (q > 0.0).then_some((q, mime))
            })
            .collect();
        weighted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        weighted.into_iter().map(|(_, m)| m).collect()
    }

    /// Whether the client accepts `mime` (exactly or through a wildcard).
    pub fn accepts(&self, mime: &str) -> bool {
        let types = self.media_types();
        if types.is_empty() {
            return true;
        }
        let major = mime.split('/').next().unwrap_or("");
        types.iter().any(|t| {
            t == mime || t == "*/*" || t.strip_suffix("/*").is_some_and(|m| m == major)
        })
    }

    pub fn is_keep_alive(&self) -> bool {
        let has = |token: &str| {
            self.header_values("connection")
                .flat_map(|v| v.split(','))
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        };
        match self.version {
            Version::HTTP_10 | Version::HTTP_09 => has("keep-alive"),
            _ => !has("close"),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn flash(&self) -> &Flash {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut Flash {
        &mut self.flash
    }

    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(name.into(), value);
    }

    /// The route matched for this request, once routing succeeded.
    pub fn route(&self) -> Option<&Arc<dyn Route>> {
        self.route.as_ref()
    }

    pub fn set_route(&mut self, route: Arc<dyn Route>) {
        self.route = Some(route);
    }

    /// Record a body decoding failure to surface at dispatch.
    pub fn set_decode_error(&mut self, error: DecodeError) {
        self.decode_error = Some(error);
    }

    pub fn take_decode_error(&mut self) -> Option<DecodeError> {
        self.decode_error.take()
    }
}
