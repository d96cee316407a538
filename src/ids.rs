//! ULID-backed identifiers used for log correlation.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

macro_rules! ulid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
        pub struct $name(pub ulid::Ulid);

        impl $name {
            pub fn new() -> Self {
                Self(ulid::Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(ulid::Ulid::from_string(s)?))
            }
        }
    };
}

ulid_id!(
    /// Identifier of one request/response exchange.
    ///
    /// Assigned once the request head is decoded and carried by the
    /// [`Context`](crate::context::Context). A valid ULID in `X-Request-Id`
    /// is reused so traces can span services.
    RequestId
);

ulid_id!(
    /// Identifier of one accepted TCP connection.
    ///
    /// This is the "client id" handed to WebSocket listeners and accepted by
    /// [`Dispatcher::send_text`](crate::dispatcher::Dispatcher::send_text).
    ConnectionId
);

impl RequestId {
    /// Reuse the id announced by the client, or mint a new one.
    pub fn from_header_or_new(header_value: Option<&str>) -> Self {
        header_value
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_round_trips_through_header() {
        let id = RequestId::new();
        let parsed = RequestId::from_header_or_new(Some(&format!(" {id} ")));
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_invalid_header_generates_fresh_id() {
        let a = RequestId::from_header_or_new(Some("not-a-ulid"));
        let b = RequestId::from_header_or_new(None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<ConnectionId>().unwrap(), a);
    }
}
