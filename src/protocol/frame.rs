//! Frame types and serialization.
//!
//! A [`Frame`] carries only the fields of its message type. Byte counts are
//! never stored: they are derived from the payload and headers when a frame
//! is encoded, and checked against the body when one is parsed.

use bytes::{Bytes, BytesMut};

use super::headers::Headers;
use super::info::{ConnectInfo, ServerInfo};
use super::wire_format::{Verb, CRLF};
use crate::error::Result;

/// `PUB <subject> [reply-to] <#bytes>`
#[derive(Debug, Clone, PartialEq)]
pub struct Pub {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

/// `HPUB <subject> [reply-to] <#header-bytes> <#total-bytes>`
#[derive(Debug, Clone, PartialEq)]
pub struct HPub {
    pub subject: String,
    pub reply_to: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
}

/// `SUB <subject> [queue-group] <sid>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sub {
    pub subject: String,
    pub queue_group: Option<String>,
    pub sid: String,
}

/// `UNSUB <sid> [max-msgs]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsub {
    pub sid: String,
    pub max_msgs: Option<u64>,
}

/// `MSG <subject> <sid> [reply-to] <#bytes>`
#[derive(Debug, Clone, PartialEq)]
pub struct Msg {
    pub subject: String,
    pub sid: String,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

/// `HMSG <subject> <sid> [reply-to] <#header-bytes> <#total-bytes>`
#[derive(Debug, Clone, PartialEq)]
pub struct HMsg {
    pub subject: String,
    pub sid: String,
    pub reply_to: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
}

/// A single protocol frame, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Info(Box<ServerInfo>),
    Connect(Box<ConnectInfo>),
    Pub(Pub),
    HPub(HPub),
    Sub(Sub),
    Unsub(Unsub),
    Msg(Msg),
    HMsg(HMsg),
    Ping,
    Pong,
    Ok,
    /// Server error text, surrounding quotes removed.
    Err(String),
}

impl Frame {
    /// The verb this frame is written with.
    pub fn verb(&self) -> Verb {
        match self {
            Frame::Info(_) => Verb::Info,
            Frame::Connect(_) => Verb::Connect,
            Frame::Pub(_) => Verb::Pub,
            Frame::HPub(_) => Verb::HPub,
            Frame::Sub(_) => Verb::Sub,
            Frame::Unsub(_) => Verb::Unsub,
            Frame::Msg(_) => Verb::Msg,
            Frame::HMsg(_) => Verb::HMsg,
            Frame::Ping => Verb::Ping,
            Frame::Pong => Verb::Pong,
            Frame::Ok => Verb::Ok,
            Frame::Err(_) => Verb::Err,
        }
    }

    /// Payload of a payload-bearing frame.
    ///
    /// Returns `None` for frames without a body section. An empty payload is
    /// still `Some`: it is written as `<#bytes>=0` followed by CRLF.
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Frame::Pub(p) => Some(&p.payload),
            Frame::HPub(p) => Some(&p.payload),
            Frame::Msg(m) => Some(&m.payload),
            Frame::HMsg(m) => Some(&m.payload),
            _ => None,
        }
    }

    /// Write the control line and, for HPUB/HMSG, the header block.
    ///
    /// The payload and its trailing CRLF are not written, so callers can
    /// send the payload without copying it.
    pub fn encode_head(&self, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(self.verb().as_str().as_bytes());
        match self {
            Frame::Info(info) => {
                dst.extend_from_slice(b" ");
                dst.extend_from_slice(&serde_json::to_vec(info)?);
            }
            Frame::Connect(connect) => {
                dst.extend_from_slice(b" ");
                dst.extend_from_slice(&serde_json::to_vec(connect)?);
            }
            Frame::Pub(p) => {
                put_arg(dst, &p.subject);
                put_opt(dst, p.reply_to.as_deref());
                put_num(dst, p.payload.len());
            }
            Frame::HPub(p) => {
                let header_len = p.headers.encoded_len();
                put_arg(dst, &p.subject);
                put_opt(dst, p.reply_to.as_deref());
                put_num(dst, header_len);
                put_num(dst, header_len + p.payload.len());
            }
            Frame::Sub(s) => {
                put_arg(dst, &s.subject);
                put_opt(dst, s.queue_group.as_deref());
                put_arg(dst, &s.sid);
            }
            Frame::Unsub(u) => {
                put_arg(dst, &u.sid);
                if let Some(max) = u.max_msgs {
                    put_arg(dst, &max.to_string());
                }
            }
            Frame::Msg(m) => {
                put_arg(dst, &m.subject);
                put_arg(dst, &m.sid);
                put_opt(dst, m.reply_to.as_deref());
                put_num(dst, m.payload.len());
            }
            Frame::HMsg(m) => {
                let header_len = m.headers.encoded_len();
                put_arg(dst, &m.subject);
                put_arg(dst, &m.sid);
                put_opt(dst, m.reply_to.as_deref());
                put_num(dst, header_len);
                put_num(dst, header_len + m.payload.len());
            }
            Frame::Err(message) => {
                dst.extend_from_slice(b" '");
                dst.extend_from_slice(message.as_bytes());
                dst.extend_from_slice(b"'");
            }
            Frame::Ping | Frame::Pong | Frame::Ok => {}
        }
        dst.extend_from_slice(CRLF);

        match self {
            Frame::HPub(p) => p.headers.encode(dst),
            Frame::HMsg(m) => m.headers.encode(dst),
            _ => {}
        }
        Ok(())
    }

    /// Serialize the whole frame.
    pub fn encode(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(64 + self.payload().map_or(0, Bytes::len));
        self.encode_head(&mut dst)?;
        if let Some(payload) = self.payload() {
            dst.extend_from_slice(payload);
            dst.extend_from_slice(CRLF);
        }
        Ok(dst.freeze())
    }
}

fn put_arg(dst: &mut BytesMut, arg: &str) {
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(arg.as_bytes());
}

fn put_opt(dst: &mut BytesMut, arg: Option<&str>) {
    if let Some(arg) = arg {
        put_arg(dst, arg);
    }
}

fn put_num(dst: &mut BytesMut, n: usize) {
    put_arg(dst, &n.to_string());
}
