//! Inbound messages and handler replies.

use bytes::Bytes;

use crate::protocol::{HMsg, Headers, Msg, NO_RESPONDERS_STATUS};

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Subject the message was published to.
    pub subject: String,
    /// Subscription id it was delivered on.
    pub sid: String,
    /// Subject to send a reply to, if the publisher expects one.
    pub reply_to: Option<String>,
    /// Headers, present only for HMSG deliveries.
    pub headers: Option<Headers>,
    pub payload: Bytes,
}

impl Message {
    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Inline header status, e.g. `503`.
    pub fn status(&self) -> Option<u16> {
        self.headers.as_ref().and_then(Headers::status)
    }

    /// A server-generated "no responders" notice for a request.
    pub fn is_no_responders(&self) -> bool {
        self.status() == Some(NO_RESPONDERS_STATUS) && self.payload.is_empty()
    }

    /// Total bytes of payload, for accounting.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<Msg> for Message {
    fn from(msg: Msg) -> Self {
        Self {
            subject: msg.subject,
            sid: msg.sid,
            reply_to: msg.reply_to,
            headers: None,
            payload: msg.payload,
        }
    }
}

impl From<HMsg> for Message {
    fn from(msg: HMsg) -> Self {
        Self {
            subject: msg.subject,
            sid: msg.sid,
            reply_to: msg.reply_to,
            headers: Some(msg.headers),
            payload: msg.payload,
        }
    }
}

/// What a reply handler sends back: a payload and optional headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub payload: Bytes,
    pub headers: Option<Headers>,
}

impl Reply {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            headers: None,
        }
    }

    pub fn with_headers(payload: impl Into<Bytes>, headers: Headers) -> Self {
        Self {
            payload: payload.into(),
            headers: Some(headers),
        }
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

impl From<&str> for Reply {
    fn from(payload: &str) -> Self {
        Self::new(Bytes::copy_from_slice(payload.as_bytes()))
    }
}

impl From<String> for Reply {
    fn from(payload: String) -> Self {
        Self::new(payload)
    }
}

impl From<Vec<u8>> for Reply {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

impl From<Bytes> for Reply {
    fn from(payload: Bytes) -> Self {
        Self::new(payload)
    }
}

impl<T: Into<Bytes>> From<(T, Headers)> for Reply {
    fn from((payload, headers): (T, Headers)) -> Self {
        Self::with_headers(payload, headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(headers: Option<Headers>, payload: &'static [u8]) -> Message {
        Message {
            subject: "_INBOX.abc".into(),
            sid: "1".into(),
            reply_to: None,
            headers,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_no_responders_detection() {
        assert!(message(Some(Headers::with_status(503, None)), b"").is_no_responders());
        assert!(!message(Some(Headers::with_status(503, None)), b"x").is_no_responders());
        assert!(!message(Some(Headers::new()), b"").is_no_responders());
        assert!(!message(None, b"").is_no_responders());
    }

    #[test]
    fn test_payload_str() {
        assert_eq!(message(None, b"hi").payload_str(), Some("hi"));
        assert_eq!(message(None, &[0xff, 0xfe]).payload_str(), None);
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(Reply::from("pong").payload, Bytes::from_static(b"pong"));
        assert_eq!(Reply::from(String::from("a")).payload, Bytes::from_static(b"a"));
        assert!(Reply::from(()).payload.is_empty());

        let reply = Reply::from(("body", Headers::new().with("K", "v")));
        assert_eq!(reply.payload, Bytes::from_static(b"body"));
        assert_eq!(reply.headers.unwrap().get("K"), Some("v"));
    }

    #[test]
    fn test_from_hmsg_keeps_headers() {
        let hmsg = HMsg {
            subject: "s".into(),
            sid: "2".into(),
            reply_to: Some("r".into()),
            headers: Headers::new().with("A", "1"),
            payload: Bytes::from_static(b"p"),
        };
        let message = Message::from(hmsg);
        assert_eq!(message.headers.as_ref().and_then(|h| h.get("A")), Some("1"));
        assert_eq!(message.reply_to.as_deref(), Some("r"));
    }
}
