//! Incremental HTTP/1.x request decoding.
//!
//! [`RequestDecoder`] turns the bytes read from a connection into a sequence
//! of [`Fragment`]s: one `Start` carrying the request head, zero or more
//! `Content` fragments and a terminal `Last`. It never blocks and can be fed
//! partial reads; it returns `Ok(None)` until more input is needed.

use crate::error::DecodeError;
use crate::server::chunked::ChunkedDecoder;
use bytes::{Buf, Bytes, BytesMut};
use http::{Method, Version};
use smallvec::SmallVec;
use std::collections::HashMap;

/// Most requests carry fewer than 16 headers.
pub type HeaderVec = SmallVec<[(String, String); 16]>;

const MAX_HEADERS: usize = 64;

/// Decoded request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request target as sent (path and query, still percent-encoded)
    pub target: String,
    pub version: Version,
    /// Header names keep the client's spelling; lookups ignore case
    pub headers: HeaderVec,
}

impl RequestHead {
    /// First value of header `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Whether the comma-separated header `name` contains `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// HTTP/1.1 keeps the connection unless `Connection: close`; HTTP/1.0
    /// only with `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.version {
            Version::HTTP_10 | Version::HTTP_09 => self.has_token("connection", "keep-alive"),
            _ => !self.has_token("connection", "close"),
        }
    }

    pub fn expects_continue(&self) -> bool {
        self.version == Version::HTTP_11
            && self
                .header("expect")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }

    /// `Connection: Upgrade` or `Upgrade: websocket`.
    pub fn is_upgrade_request(&self) -> bool {
        self.has_token("connection", "upgrade") || self.has_token("upgrade", "websocket")
    }
}

/// Case-insensitive lookup in a header list.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Split a request target into its decoded path and raw query string.
pub fn split_target(target: &str) -> (String, Option<&str>) {
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (target, None),
    };
    let path = urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string());
    (path, query)
}

/// Parse a query string, keeping repeated keys in order.
pub fn parse_query_params(query: Option<&str>) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    if let Some(q) = query {
        for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
            out.entry(k.into_owned()).or_default().push(v.into_owned());
        }
    }
    out
}

/// One step of an inbound request.
#[derive(Debug)]
pub enum Fragment {
    Start(RequestHead),
    Content(Bytes),
    /// End of the request; may carry the final body bytes
    Last(Bytes),
}

#[derive(Debug)]
enum Framing {
    Empty,
    Length(u64),
    Chunked(ChunkedDecoder),
}

#[derive(Debug)]
enum State {
    Head,
    Body(Framing),
}

/// Request decoder for one connection.
#[derive(Debug)]
pub struct RequestDecoder {
    state: State,
    max_head: usize,
}

impl RequestDecoder {
    pub fn new(max_head: usize) -> Self {
        Self {
            state: State::Head,
            max_head,
        }
    }

    /// True between requests.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Head)
    }

    /// Decode the next fragment from `buf`, consuming the bytes it covers.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Fragment>, DecodeError> {
        if self.is_idle() {
            return self.decode_head(buf);
        }
        match &mut self.state {
            State::Head => Ok(None),
            State::Body(Framing::Empty) => {
                self.state = State::Head;
                Ok(Some(Fragment::Last(Bytes::new())))
            }
            State::Body(Framing::Length(remaining)) => {
                if *remaining == 0 {
                    self.state = State::Head;
                    return Ok(Some(Fragment::Last(Bytes::new())));
                }
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                let data = buf.split_to(take).freeze();
                *remaining -= take as u64;
                if *remaining == 0 {
                    self.state = State::Head;
                    Ok(Some(Fragment::Last(data)))
                } else {
                    Ok(Some(Fragment::Content(data)))
                }
            }
            State::Body(Framing::Chunked(chunked)) => match chunked.decode(buf)? {
                Some(data) => Ok(Some(Fragment::Content(data))),
                None if chunked.is_complete() => {
                    self.state = State::Head;
                    Ok(Some(Fragment::Last(Bytes::new())))
                }
                None => Ok(None),
            },
        }
    }

    fn decode_head(&mut self, buf: &mut BytesMut) -> Result<Option<Fragment>, DecodeError> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut raw_headers);
        let head_len = match req.parse(&buf[..])? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                if buf.len() > self.max_head {
                    return Err(DecodeError::HeadTooLarge {
                        limit: self.max_head,
                    });
                }
                return Ok(None);
            }
        };

        let method_str = req.method.unwrap_or_default();
        let method = Method::from_bytes(method_str.as_bytes())
            .map_err(|_| DecodeError::InvalidMethod(method_str.to_string()))?;
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let target = req.path.unwrap_or("/").to_string();
        let headers: HeaderVec = req
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();

        let framing = body_framing(&headers)?;
        buf.advance(head_len);
        self.state = State::Body(framing);
        Ok(Some(Fragment::Start(RequestHead {
            method,
            target,
            version,
            headers,
        })))
    }
}

// RFC 9112 §6.3: Transfer-Encoding overrides Content-Length; differing
// Content-Length values are a framing error.
fn body_framing(headers: &[(String, String)]) -> Result<Framing, DecodeError> {
    if let Some(te) = header_value(headers, "transfer-encoding") {
        let last = te.rsplit(',').next().unwrap_or("").trim();
        if last.eq_ignore_ascii_case("chunked") {
            return Ok(Framing::Chunked(ChunkedDecoder::new()));
        }
        return Err(DecodeError::UnsupportedTransferEncoding(te.to_string()));
    }
    let mut length: Option<u64> = None;
    for (_, value) in headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("content-length"))
    {
        let parsed: u64 = value
            .trim()
            .parse()
            .map_err(|_| DecodeError::InvalidContentLength(value.clone()))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(DecodeError::InvalidContentLength(value.clone()))
            }
            _ => length = Some(parsed),
        }
    }
    Ok(match length {
        Some(0) | None => Framing::Empty,
        Some(n) => Framing::Length(n),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(dec: &mut RequestDecoder, buf: &mut BytesMut) -> Vec<Fragment> {
        let mut out = Vec::new();
        while let Some(f) = dec.decode(buf).unwrap() {
            let last = matches!(f, Fragment::Last(_));
            out.push(f);
            if last {
                break;
            }
        }
        out
    }

    #[test]
    fn test_get_without_body() {
        let mut dec = RequestDecoder::new(8192);
        let mut buf = BytesMut::from(&b"GET /a%20b?x=1&x=2 HTTP/1.1\r\nHost: h\r\n\r\n"[..]);
        let frags = collect(&mut dec, &mut buf);
        assert_eq!(frags.len(), 2);
        let Fragment::Start(head) = &frags[0] else {
            panic!("expected start");
        };
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.header("HOST"), Some("h"));
        assert!(head.is_keep_alive());
        let (path, query) = split_target(&head.target);
        assert_eq!(path, "/a b");
        assert_eq!(parse_query_params(query)["x"], vec!["1", "2"]);
        assert!(matches!(&frags[1], Fragment::Last(b) if b.is_empty()));
        assert!(dec.is_idle());
    }

    #[test]
    fn test_content_length_body_across_reads() {
        let mut dec = RequestDecoder::new(8192);
        let mut buf = BytesMut::from(&b"POST /p HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123"[..]);
        assert!(matches!(
            dec.decode(&mut buf).unwrap(),
            Some(Fragment::Start(_))
        ));
        assert!(matches!(dec.decode(&mut buf).unwrap(), Some(Fragment::Content(b)) if &b[..] == b"0123"));
        assert!(dec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"456789GET");
        assert!(matches!(dec.decode(&mut buf).unwrap(), Some(Fragment::Last(b)) if &b[..] == b"456789"));
        assert_eq!(&buf[..], b"GET");
    }

    #[test]
    fn test_chunked_body() {
        let mut dec = RequestDecoder::new(8192);
        let mut buf = BytesMut::from(
            &b"PUT /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n"[..],
        );
        let frags = collect(&mut dec, &mut buf);
        assert_eq!(frags.len(), 3);
        assert!(matches!(&frags[1], Fragment::Content(b) if &b[..] == b"abc"));
        assert!(matches!(&frags[2], Fragment::Last(_)));
    }

    #[test]
    fn test_partial_head_waits() {
        let mut dec = RequestDecoder::new(8192);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHo"[..]);
        assert!(dec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 18);
    }

    #[test]
    fn test_head_too_large() {
        let mut dec = RequestDecoder::new(16);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaa"[..]);
        assert!(matches!(
            dec.decode(&mut buf),
            Err(DecodeError::HeadTooLarge { limit: 16 })
        ));
    }

    #[test]
    fn test_conflicting_content_lengths() {
        let mut dec = RequestDecoder::new(8192);
        let mut buf = BytesMut::from(
            &b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n"[..],
        );
        assert!(matches!(
            dec.decode(&mut buf),
            Err(DecodeError::InvalidContentLength(_))
        ));
    }

    #[test]
    fn test_keep_alive_rules() {
        let mut dec = RequestDecoder::new(8192);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.0\r\n\r\n"[..]);
        let Some(Fragment::Start(head)) = dec.decode(&mut buf).unwrap() else {
            panic!("expected start");
        };
        assert!(!head.is_keep_alive());

        let mut dec = RequestDecoder::new(8192);
        let mut buf = BytesMut::from(
            &b"GET / HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\nExpect: 100-continue\r\n\r\n"[..],
        );
        let Some(Fragment::Start(head)) = dec.decode(&mut buf).unwrap() else {
            panic!("expected start");
        };
        assert!(head.is_keep_alive());
        assert!(head.is_upgrade_request());
        assert!(head.expects_continue());
    }
}
