//! Cookie-backed session and flash scopes.
//!
//! Both scopes are serialized as `application/x-www-form-urlencoded` pairs.
//! The session cookie is signed with a hex SHA-1 of `secret + payload` when a
//! secret is configured; tampered or unsigned values are discarded on read.
//!
//! Flash values set during a request are visible to the *next* request only.
//! The response writer persists both scopes, except when it writes the result
//! of a failed async computation.

use crate::cache::sha1_hex;
use crate::config::CookieConfig;
use crate::cookies::Cookie;
use std::collections::{BTreeMap, HashMap};

/// Session scope of one request.
#[derive(Debug, Default, Clone)]
pub struct Session {
    data: BTreeMap<String, String>,
    /// The request carried a session cookie
    loaded: bool,
    dirty: bool,
}

impl Session {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.data.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn clear(&mut self) {
        if !self.data.is_empty() {
            self.dirty = true;
        }
        self.data.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Flash scope of one request.
#[derive(Debug, Default, Clone)]
pub struct Flash {
    /// Values carried over from the previous request
    incoming: BTreeMap<String, String>,
    /// Values handed to the next request
    outgoing: BTreeMap<String, String>,
}

impl Flash {
    /// Look up a value from the previous request, or one set during this one.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.outgoing
            .get(key)
            .or_else(|| self.incoming.get(key))
            .map(String::as_str)
    }

    /// Make `value` available to the next request.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.outgoing.insert(key.into(), value.into());
    }

    /// Keep every incoming value for one more request.
    pub fn keep(&mut self) {
        for (k, v) in &self.incoming {
            self.outgoing.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.put("error", message);
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.put("success", message);
    }

    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty() && self.outgoing.is_empty()
    }
}

/// Reads and writes the session and flash cookies.
#[derive(Debug, Clone)]
pub struct SessionCodec {
    config: CookieConfig,
}

impl SessionCodec {
    pub fn new(config: CookieConfig) -> Self {
        Self { config }
    }

    pub fn session_cookie_name(&self) -> String {
        format!("{}_SESSION", self.config.prefix)
    }

    pub fn flash_cookie_name(&self) -> String {
        format!("{}_FLASH", self.config.prefix)
    }

    /// Restore both scopes from the request cookies.
    pub fn load(&self, cookies: &HashMap<String, String>) -> (Session, Flash) {
        let mut session = Session::default();
        if let Some(raw) = cookies.get(&self.session_cookie_name()) {
            session.loaded = true;
            match self.verify(raw) {
                Some(payload) => session.data = decode_pairs(payload),
                None => {
                    tracing::warn!(cookie = %self.session_cookie_name(), "Discarding session cookie with invalid signature");
                    session.dirty = true;
                }
            }
        }
        let incoming = cookies
            .get(&self.flash_cookie_name())
            .map(|raw| decode_pairs(raw.as_str()))
            .unwrap_or_default();
        (
            session,
            Flash {
                incoming,
                outgoing: BTreeMap::new(),
            },
        )
    }

    /// Cookies to send back so that the client holds the new state.
    pub fn save(&self, session: &Session, flash: &Flash) -> Vec<Cookie> {
        let mut out = Vec::new();
        if session.dirty || (session.loaded && session.is_empty()) {
            if session.is_empty() {
                if session.loaded {
                    out.push(self.decorate(Cookie::removal(self.session_cookie_name())));
                }
            } else {
                let payload = encode_pairs(&session.data);
                let mut cookie = self.decorate(Cookie::new(
                    self.session_cookie_name(),
                    self.sign(&payload),
                ));
                if let Some(age) = self.config.session_max_age {
                    cookie = cookie.max_age(age as i64);
                }
                out.push(cookie);
            }
        }
        if !flash.outgoing.is_empty() {
            out.push(self.decorate(Cookie::new(
                self.flash_cookie_name(),
                encode_pairs(&flash.outgoing),
            )));
        } else if !flash.incoming.is_empty() {
            out.push(self.decorate(Cookie::removal(self.flash_cookie_name())));
        }
        out
    }

    fn decorate(&self, cookie: Cookie) -> Cookie {
        cookie
            .secure(self.config.secure)
            .http_only(self.config.http_only)
    }

    fn sign(&self, payload: &str) -> String {
        match &self.config.secret {
            Some(secret) => format!("{}-{payload}", signature(secret, payload)),
            None => payload.to_string(),
        }
    }

    fn verify<'a>(&self, raw: &'a str) -> Option<&'a str> {
        match &self.config.secret {
            None => Some(raw),
            Some(secret) => {
                let (sig, payload) = raw.split_once('-')?;
                (signature(secret, payload) == sig).then_some(payload)
            }
        }
    }
}

fn signature(secret: &str, payload: &str) -> String {
    sha1_hex(format!("{secret}{payload}").as_bytes())
}

fn encode_pairs(map: &BTreeMap<String, String>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(map.iter())
        .finish()
}

fn decode_pairs(raw: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect()
}
