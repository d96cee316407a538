//! Response writing.
//!
//! A result is written either buffered, with an exact `Content-Length`, or
//! chunked when its body length is unknown (or chunking was requested).
//! Chunked responses always close the connection afterwards. The body is
//! resolved before the status line is written, so a body that cannot be
//! rendered turns into an empty `400` instead of a broken response.

use crate::content::ContentEngine;
use crate::context::Context;
use crate::cookies::Cookie;
use crate::renderable::{Renderable, MIME_TEXT};
use crate::result::HttpResult;
use crate::server::chunked::ChunkedWriter;
use crate::session::SessionCodec;
use http::{Method, StatusCode};
use serde_json::Value;
use std::io::{self, Read, Write};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Whether the connection may serve another request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    KeepAlive,
    Close,
}

enum Payload<'a> {
    Buffered(Vec<u8>),
    Chunked(Box<dyn Read + Send + 'a>),
}

/// Headers the writer owns; values set on the result are ignored.
const FRAMING_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

pub struct ResponseWriter<'a> {
    content: &'a dyn ContentEngine,
    sessions: &'a SessionCodec,
    server_name: &'a str,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(content: &'a dyn ContentEngine, sessions: &'a SessionCodec, server_name: &'a str) -> Self {
        Self {
            content,
            sessions,
            server_name,
        }
    }

    /// Write `result` as the response to `ctx`.
    ///
    /// Session and flash cookies are emitted only with
    /// `handle_flash_and_session`; failed async computations pass `false`.
    pub fn write<W: Write>(
        &self,
        out: &mut W,
        ctx: &Context,
        mut result: HttpResult,
        handle_flash_and_session: bool,
    ) -> io::Result<Persistence> {
        let mut body = result.body.take().unwrap_or(Renderable::Empty);
        if body.require_serializer() {
            self.serialize(ctx, &mut result, &mut body);
        }
        let content_type = content_type_header(&result, &body);

        let bodyless = result.status.is_informational()
            || result.status == StatusCode::NO_CONTENT
            || result.status == StatusCode::NOT_MODIFIED;
        let head_only = *ctx.method() == Method::HEAD;

        let payload = if bodyless {
            Payload::Buffered(Vec::new())
        } else if body.must_be_chunked() {
            match body.render() {
                Ok(reader) => Payload::Chunked(reader),
                Err(e) => degrade(&mut result, ctx, &e),
            }
        } else {
            match body.to_bytes() {
                Ok(bytes) => Payload::Buffered(bytes),
                Err(e) => degrade(&mut result, ctx, &e),
            }
        };

        let mut cookies = std::mem::take(&mut result.cookies);
        if handle_flash_and_session {
            cookies.extend(self.sessions.save(ctx.session(), ctx.flash()));
        }

        let mut head = self.head(&result, content_type.as_deref(), &cookies)?;
        match payload {
            Payload::Chunked(mut reader) => {
                head.extend_from_slice(b"Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n");
                out.write_all(&head)?;
                if head_only {
                    out.flush()?;
                } else {
                    let mut chunked = ChunkedWriter::new(&mut *out);
                    io::copy(&mut reader, &mut chunked)?;
                    chunked.finish()?;
                }
                debug!(
                    request_id = %ctx.request_id,
                    status = result.status.as_u16(),
                    "Chunked response written"
                );
                Ok(Persistence::Close)
            }
            Payload::Buffered(bytes) => {
                let keep_alive = ctx.is_keep_alive();
                if !bodyless {
                    write!(head, "Content-Length: {}\r\n", bytes.len())?;
                }
                head.extend_from_slice(if keep_alive {
                    b"Connection: keep-alive\r\n\r\n".as_slice()
                } else {
                    b"Connection: close\r\n\r\n".as_slice()
                });
                out.write_all(&head)?;
                if !bodyless && !head_only {
                    out.write_all(&bytes)?;
                }
                out.flush()?;
                debug!(
                    request_id = %ctx.request_id,
                    status = result.status.as_u16(),
                    size = bytes.len(),
                    "Response written"
                );
                Ok(if keep_alive {
                    Persistence::KeepAlive
                } else {
                    Persistence::Close
                })
            }
        }
    }

    /// Fill the serialized form of `body`.
    ///
    /// Serializers are looked up by the declared type, then by the request's
    /// `Accept` types, then by its `Content-Type`. Without one the content's
    /// string form is sent as `text/plain`.
    fn serialize(&self, ctx: &Context, result: &mut HttpResult, body: &mut Renderable) {
        let declared = result
            .content_type
            .clone()
            .or_else(|| body.mime_type().map(str::to_string));
        let serializer = declared
            .as_deref()
            .and_then(|ct| self.content.serializer_for_content_type(ct))
            .or_else(|| self.content.best_serializer(&ctx.media_types()))
            .or_else(|| {
                ctx.content_type()
                    .and_then(|ct| self.content.serializer_for_content_type(ct))
            });

        match serializer {
            Some(serializer) => {
                if let Err(e) = serializer.serialize(body) {
                    warn!(
                        request_id = %ctx.request_id,
                        serializer = %serializer.content_type(),
                        error = %e,
                        "Serialization failed"
                    );
                }
                if result.content_type.is_none() {
                    result.content_type = Some(serializer.content_type().to_string());
                }
            }
            None => {
                debug!(request_id = %ctx.request_id, "No serializer, sending text/plain");
                *body = match body.content() {
                    Some(Value::String(s)) => Renderable::text(s),
                    Some(other) => Renderable::text(other.to_string()),
                    None => Renderable::Empty,
                };
                if !matches!(body, Renderable::Empty) {
                    result.content_type = Some(MIME_TEXT.to_string());
                }
            }
        }
    }

    fn head(&self, result: &HttpResult, content_type: Option<&str>, cookies: &[Cookie]) -> io::Result<Vec<u8>> {
        let mut head = Vec::with_capacity(256);
        let status = result.status;
        write!(
            head,
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )?;
        for (name, value) in &result.headers {
            if FRAMING_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            write!(head, "{name}: {value}\r\n")?;
        }
        if let Some(ct) = content_type {
            if !result.has_header("content-type") {
                write!(head, "Content-Type: {ct}\r\n")?;
            }
        }
        for cookie in cookies {
            write!(head, "Set-Cookie: {}\r\n", cookie.to_header_value())?;
        }
        if !result.has_header("server") {
            write!(head, "Server: {}\r\n", self.server_name)?;
        }
        if !result.has_header("date") {
            write!(head, "Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now()))?;
        }
        Ok(head)
    }
}

fn degrade<'b>(result: &mut HttpResult, ctx: &Context, error: &io::Error) -> Payload<'b> {
    warn!(
        request_id = %ctx.request_id,
        status = result.status.as_u16(),
        error = %error,
        "Cannot render response body, sending an empty 400"
    );
    result.status = StatusCode::BAD_REQUEST;
    Payload::Buffered(Vec::new())
}

fn content_type_header(result: &HttpResult, body: &Renderable) -> Option<String> {
    let mime = result
        .content_type
        .as_deref()
        .or_else(|| body.mime_type())?;
    Some(match &result.charset {
        Some(cs) => format!("{mime}; charset={cs}"),
        None => mime.to_string(),
    })
}

/// Interim response for `Expect: 100-continue`.
pub fn write_continue<W: Write>(out: &mut W) -> io::Result<()> {
    out.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CookieConfig;
    use crate::content::DefaultContentEngine;
    use crate::server::request::HeaderVec;
    use serde_json::json;
    use std::io::Cursor;

    struct Parsed {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl Parsed {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    fn parse(raw: &[u8]) -> Parsed {
        let split = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        let head = std::str::from_utf8(&raw[..split]).unwrap();
        let mut lines = head.split("\r\n");
        let status = lines.next().unwrap().split(' ').nth(1).unwrap().parse().unwrap();
        let headers = lines
            .map(|l| {
                let (k, v) = l.split_once(": ").unwrap();
                (k.to_string(), v.to_string())
            })
            .collect();
        Parsed {
            status,
            headers,
            body: raw[split + 4..].to_vec(),
        }
    }

    fn ctx(method: Method, headers: &[(&str, &str)]) -> Context {
        let headers: HeaderVec = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Context::new(method, "/r", headers)
    }

    fn write_with(ctx: &Context, result: HttpResult, persist: bool) -> (Parsed, Persistence) {
        let engine = DefaultContentEngine::new();
        let codec = SessionCodec::new(CookieConfig::default());
        let writer = ResponseWriter::new(&engine, &codec, "sagewire-test");
        let mut out = Vec::new();
        let p = writer.write(&mut out, ctx, result, persist).unwrap();
        (parse(&out), p)
    }

    fn write(ctx: &Context, result: HttpResult) -> (Parsed, Persistence) {
        write_with(ctx, result, true)
    }

    #[test]
    fn test_buffered_response_has_exact_length() {
        let c = ctx(Method::GET, &[]);
        let (res, p) = write(&c, HttpResult::ok_text("hi").as_text());
        assert_eq!(res.status, 200);
        assert_eq!(res.header("Content-Type"), Some("text/plain"));
        assert_eq!(res.header("Content-Length"), Some("2"));
        assert_eq!(res.header("Connection"), Some("keep-alive"));
        assert_eq!(res.header("Server"), Some("sagewire-test"));
        assert!(res.header("Date").is_some());
        assert!(res.header("Transfer-Encoding").is_none());
        assert_eq!(res.body, b"hi");
        assert_eq!(p, Persistence::KeepAlive);
    }

    #[test]
    fn test_chunked_response_closes() {
        let c = ctx(Method::GET, &[]);
        let body = Renderable::stream(Cursor::new(b"streamed".to_vec()), None);
        let (res, p) = write(&c, HttpResult::ok().render(body));
        assert_eq!(res.header("Transfer-Encoding"), Some("chunked"));
        assert!(res.header("Content-Length").is_none());
        assert_eq!(res.header("Connection"), Some("close"));
        assert_eq!(res.body, b"8\r\nstreamed\r\n0\r\n\r\n");
        assert_eq!(p, Persistence::Close);
    }

    #[test]
    fn test_not_found_has_empty_body() {
        let c = ctx(Method::GET, &[("Connection", "close")]);
        let (res, p) = write(&c, HttpResult::not_found());
        assert_eq!(res.status, 404);
        assert_eq!(res.header("Content-Length"), Some("0"));
        assert!(res.header("Content-Type").is_none());
        assert!(res.body.is_empty());
        assert_eq!(p, Persistence::Close);
    }

    #[test]
    fn test_head_and_not_modified() {
        let head = ctx(Method::HEAD, &[]);
        let (res, _) = write(&head, HttpResult::ok_text("four"));
        assert_eq!(res.header("Content-Length"), Some("4"));
        assert!(res.body.is_empty());

        let get = ctx(Method::GET, &[]);
        let (res, _) = write(&get, HttpResult::not_modified().with("ETag", "abc"));
        assert_eq!(res.status, 304);
        assert!(res.header("Content-Length").is_none());
        assert_eq!(res.header("ETag"), Some("abc"));
        assert!(res.body.is_empty());
    }

    #[test]
    fn test_serializer_chosen_by_accept() {
        let c = ctx(Method::GET, &[("Accept", "text/html;q=0.2, application/json")]);
        let (res, _) = write(&c, HttpResult::ok().render(Renderable::object(json!({"a": 1}))));
        assert_eq!(res.header("Content-Type"), Some("application/json"));
        assert_eq!(res.body, br#"{"a":1}"#);
    }

    #[test]
    fn test_without_serializer_falls_back_to_text() {
        let c = ctx(Method::GET, &[("Accept", "image/png")]);
        let (res, _) = write(&c, HttpResult::ok().render(Renderable::object(json!(42))));
        assert_eq!(res.status, 200);
        assert_eq!(res.header("Content-Type"), Some("text/plain"));
        assert_eq!(res.body, b"42");
    }

    #[test]
    fn test_unrenderable_body_degrades_to_400() {
        let c = ctx(Method::GET, &[]);
        let missing = Renderable::file("/definitely/not/here.txt");
        let (res, p) = write(&c, HttpResult::ok().render(missing));
        assert_eq!(res.status, 400);
        assert_eq!(res.header("Content-Length"), Some("0"));
        assert!(res.body.is_empty());
        assert_eq!(p, Persistence::KeepAlive);
    }

    #[test]
    fn test_session_cookies_only_when_requested() {
        let mut c = ctx(Method::GET, &[]);
        c.session_mut().put("user", "ada");
        c.flash_mut().success("saved");

        let (res, _) = write_with(&c, HttpResult::ok(), true);
        let cookies: Vec<_> = res
            .headers
            .iter()
            .filter(|(k, _)| k == "Set-Cookie")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().any(|c| c.starts_with("SAGE_SESSION=")));
        assert!(cookies.iter().any(|c| c.starts_with("SAGE_FLASH=")));

        let (res, _) = write_with(&c, HttpResult::ok(), false);
        assert!(res.header("Set-Cookie").is_none());
    }

    #[test]
    fn test_result_cookies_and_framing_headers() {
        let c = ctx(Method::GET, &[]);
        let result = HttpResult::ok_text("x")
            .with("Content-Length", "999")
            .with_cookie(Cookie::new("theme", "dark"));
        let (res, _) = write(&c, result);
        assert_eq!(res.header("Content-Length"), Some("1"));
        assert!(res.header("Set-Cookie").unwrap().starts_with("theme=dark"));
    }

    #[test]
    fn test_continue() {
        let mut out = Vec::new();
        write_continue(&mut out).unwrap();
        assert_eq!(out, b"HTTP/1.1 100 Continue\r\n\r\n");
    }
}
