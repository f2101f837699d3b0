//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForControlLine`: need a full CRLF-terminated line
//! - `WaitingForPayload`: control line parsed, need `<#total-bytes> + 2` more bytes
//!
//! Payload and header sections are taken by declared length, so CR/LF bytes
//! inside a payload never confuse the parser.
//!
//! # Example
//!
//! ```
//! use natswire_client::protocol::{Frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(b"MSG greet 1 5\r\nhel").unwrap().is_empty());
//! let frames = buffer.push(b"lo\r\nPING\r\n").unwrap();
//!
//! assert_eq!(frames.len(), 2);
//! assert_eq!(frames[1], Frame::Ping);
//! ```

use bytes::{Bytes, BytesMut};

use super::frame::{Frame, HMsg, HPub, Msg, Pub, Sub, Unsub};
use super::headers::Headers;
use super::wire_format::{
    find_line_end, parse_size, split_verb, Verb, CRLF, DEFAULT_MAX_CONTROL_LINE,
    DEFAULT_MAX_PAYLOAD_SIZE,
};
use crate::error::{NatsError, Result};

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete control line.
    WaitingForControlLine,
    /// Control line parsed, waiting for the body and its trailing CRLF.
    WaitingForPayload(PendingBody),
}

/// A parsed control line whose body has not fully arrived yet.
#[derive(Debug, Clone)]
struct PendingBody {
    verb: Verb,
    subject: String,
    sid: Option<String>,
    reply_to: Option<String>,
    /// Zero for PUB/MSG.
    header_len: usize,
    total_len: usize,
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// All data is stored in a single `BytesMut` buffer; payloads are split off
/// it without copying.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed body size.
    max_payload_size: usize,
    /// Maximum allowed control line length.
    max_control_line: usize,
    /// Bytes of the current line already scanned for `\n`.
    scanned: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with default limits.
    ///
    /// Default capacity: 64KB, max payload: 64MB, max control line: 64KB.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_MAX_CONTROL_LINE)
    }

    /// Create a new frame buffer with custom limits.
    pub fn with_limits(max_payload_size: usize, max_control_line: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForControlLine,
            max_payload_size,
            max_control_line,
            scanned: 0,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns `NatsError::Parse` on any malformed frame. The buffer should be
    /// discarded afterwards: the byte stream cannot be resynchronized.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_next()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Append data without parsing.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract a single frame from the buffered bytes.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a protocol violation
    pub fn try_next(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::WaitingForControlLine => {
                    let Some(end) = find_line_end(&self.buffer, self.scanned) else {
                        if self.buffer.len() > self.max_control_line {
                            return Err(NatsError::Parse(format!(
                                "control line exceeds {} bytes",
                                self.max_control_line
                            )));
                        }
                        self.scanned = self.buffer.len();
                        return Ok(None);
                    };

                    if end > self.max_control_line {
                        return Err(NatsError::Parse(format!(
                            "control line exceeds {} bytes",
                            self.max_control_line
                        )));
                    }

                    let line = self.buffer.split_to(end + 1);
                    self.scanned = 0;
                    let line = strip_line_ending(&line);
                    let line = std::str::from_utf8(line).map_err(|_| {
                        NatsError::Parse("control line is not valid UTF-8".into())
                    })?;

                    match parse_control_line(line)? {
                        Parsed::Frame(frame) => return Ok(Some(frame)),
                        Parsed::Body(body) => {
                            if body.total_len > self.max_payload_size {
                                return Err(NatsError::Parse(format!(
                                    "payload size {} exceeds maximum {}",
                                    body.total_len, self.max_payload_size
                                )));
                            }
                            self.state = State::WaitingForPayload(body);
                        }
                    }
                }
                State::WaitingForPayload(body) => {
                    let total_len = body.total_len;
                    if self.buffer.len() < total_len + CRLF.len() {
                        return Ok(None);
                    }

                    let data = self.buffer.split_to(total_len).freeze();
                    let trailer = self.buffer.split_to(CRLF.len());
                    if &trailer[..] != CRLF {
                        return Err(NatsError::Parse(format!(
                            "payload of {} {} is not followed by CRLF",
                            body.verb.as_str(),
                            body.subject
                        )));
                    }

                    let state = std::mem::replace(&mut self.state, State::WaitingForControlLine);
                    if let State::WaitingForPayload(body) = state {
                        return body.into_frame(data).map(Some);
                    }
                }
            }
        }
    }

    /// Clear all buffered data and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForControlLine;
        self.scanned = 0;
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForControlLine => "WaitingForControlLine",
            State::WaitingForPayload(_) => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingBody {
    fn into_frame(self, data: Bytes) -> Result<Frame> {
        let (headers, payload) = if matches!(self.verb, Verb::HPub | Verb::HMsg) {
            let headers = Headers::decode(&data[..self.header_len])?;
            (Some(headers), data.slice(self.header_len..))
        } else {
            (None, data)
        };

        let sid = self.sid.unwrap_or_default();
        Ok(match (self.verb, headers) {
            (Verb::Pub, _) => Frame::Pub(Pub {
                subject: self.subject,
                reply_to: self.reply_to,
                payload,
            }),
            (Verb::Msg, _) => Frame::Msg(Msg {
                subject: self.subject,
                sid,
                reply_to: self.reply_to,
                payload,
            }),
            (Verb::HPub, Some(headers)) => Frame::HPub(HPub {
                subject: self.subject,
                reply_to: self.reply_to,
                headers,
                payload,
            }),
            (Verb::HMsg, Some(headers)) => Frame::HMsg(HMsg {
                subject: self.subject,
                sid,
                reply_to: self.reply_to,
                headers,
                payload,
            }),
            (verb, _) => {
                return Err(NatsError::Parse(format!(
                    "{} does not carry a payload",
                    verb.as_str()
                )))
            }
        })
    }
}

enum Parsed {
    Frame(Frame),
    Body(PendingBody),
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_control_line(line: &str) -> Result<Parsed> {
    let (verb_token, rest) = split_verb(line);
    let verb = Verb::parse(verb_token)
        .ok_or_else(|| NatsError::Parse(format!("unknown verb {:?}", verb_token)))?;
    let args: Vec<&str> = rest.split_ascii_whitespace().collect();

    let frame = match verb {
        Verb::Info => Frame::Info(Box::new(serde_json::from_str(rest).map_err(|e| {
            NatsError::Parse(format!("invalid INFO body: {}", e))
        })?)),
        Verb::Connect => Frame::Connect(Box::new(serde_json::from_str(rest).map_err(|e| {
            NatsError::Parse(format!("invalid CONNECT body: {}", e))
        })?)),
        Verb::Ping => no_args(verb, &args, Frame::Ping)?,
        Verb::Pong => no_args(verb, &args, Frame::Pong)?,
        Verb::Ok => no_args(verb, &args, Frame::Ok)?,
        Verb::Err => Frame::Err(unquote(rest).to_string()),
        Verb::Sub => match args.as_slice() {
            [subject, sid] => Frame::Sub(Sub {
                subject: subject.to_string(),
                queue_group: None,
                sid: sid.to_string(),
            }),
            [subject, queue, sid] => Frame::Sub(Sub {
                subject: subject.to_string(),
                queue_group: Some(queue.to_string()),
                sid: sid.to_string(),
            }),
            _ => return Err(arg_count(verb, &args)),
        },
        Verb::Unsub => match args.as_slice() {
            [sid] => Frame::Unsub(Unsub {
                sid: sid.to_string(),
                max_msgs: None,
            }),
            [sid, max] => Frame::Unsub(Unsub {
                sid: sid.to_string(),
                max_msgs: Some(parse_size(max, "max-msgs")? as u64),
            }),
            _ => return Err(arg_count(verb, &args)),
        },
        Verb::Pub => {
            let (subject, reply_to, size) = match args.as_slice() {
                [subject, size] => (subject, None, size),
                [subject, reply, size] => (subject, Some(reply), size),
                _ => return Err(arg_count(verb, &args)),
            };
            return Ok(Parsed::Body(PendingBody {
                verb,
                subject: subject.to_string(),
                sid: None,
                reply_to: reply_to.map(|r| r.to_string()),
                header_len: 0,
                total_len: parse_size(size, "#bytes")?,
            }));
        }
        Verb::HPub => {
            let (subject, reply_to, hdr, total) = match args.as_slice() {
                [subject, hdr, total] => (subject, None, hdr, total),
                [subject, reply, hdr, total] => (subject, Some(reply), hdr, total),
                _ => return Err(arg_count(verb, &args)),
            };
            return header_body(verb, subject, None, reply_to.map(|r| *r), hdr, total);
        }
        Verb::Msg => {
            let (subject, sid, reply_to, size) = match args.as_slice() {
                [subject, sid, size] => (subject, sid, None, size),
                [subject, sid, reply, size] => (subject, sid, Some(reply), size),
                _ => return Err(arg_count(verb, &args)),
            };
            return Ok(Parsed::Body(PendingBody {
                verb,
                subject: subject.to_string(),
                sid: Some(sid.to_string()),
                reply_to: reply_to.map(|r| r.to_string()),
                header_len: 0,
                total_len: parse_size(size, "#bytes")?,
            }));
        }
        Verb::HMsg => {
            let (subject, sid, reply_to, hdr, total) = match args.as_slice() {
                [subject, sid, hdr, total] => (subject, sid, None, hdr, total),
                [subject, sid, reply, hdr, total] => (subject, sid, Some(reply), hdr, total),
                _ => return Err(arg_count(verb, &args)),
            };
            return header_body(verb, subject, Some(*sid), reply_to.map(|r| *r), hdr, total);
        }
    };
    Ok(Parsed::Frame(frame))
}

fn header_body(
    verb: Verb,
    subject: &str,
    sid: Option<&str>,
    reply_to: Option<&str>,
    hdr: &str,
    total: &str,
) -> Result<Parsed> {
    let header_len = parse_size(hdr, "#header-bytes")?;
    let total_len = parse_size(total, "#total-bytes")?;
    if header_len > total_len {
        return Err(NatsError::Parse(format!(
            "header size {} exceeds total size {}",
            header_len, total_len
        )));
    }
    Ok(Parsed::Body(PendingBody {
        verb,
        subject: subject.to_string(),
        sid: sid.map(str::to_owned),
        reply_to: reply_to.map(str::to_owned),
        header_len,
        total_len,
    }))
}

fn no_args(verb: Verb, args: &[&str], frame: Frame) -> Result<Frame> {
    if args.is_empty() {
        Ok(frame)
    } else {
        Err(arg_count(verb, args))
    }
}

fn arg_count(verb: Verb, args: &[&str]) -> NatsError {
    NatsError::Parse(format!(
        "wrong number of arguments for {}: {}",
        verb.as_str(),
        args.len()
    ))
}

fn unquote(text: &str) -> &str {
    let text = text.trim();
    text.strip_prefix('\'')
        .and_then(|t| t.strip_suffix('\''))
        .unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(subject: &str, sid: &str, reply_to: Option<&str>, payload: &'static [u8]) -> Frame {
        Frame::Msg(Msg {
            subject: subject.into(),
            sid: sid.into(),
            reply_to: reply_to.map(Into::into),
            payload: Bytes::from_static(payload),
        })
    }

    #[test]
    fn test_empty_buffer() {
        let mut buf = FrameBuffer::new();
        let frames = buf.push(&[]).unwrap();
        assert!(frames.is_empty());
        assert!(buf.is_empty());
        assert_eq!(buf.state_name(), "WaitingForControlLine");
    }

    #[test]
    fn test_single_msg() {
        let mut buf = FrameBuffer::new();
        let frames = buf.push(b"MSG foo.bar 9 5\r\nhello\r\n").unwrap();
        assert_eq!(frames, vec![msg("foo.bar", "9", None, b"hello")]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_msg_with_reply_to() {
        let mut buf = FrameBuffer::new();
        let frames = buf.push(b"MSG foo 1 _INBOX.abc 2\r\nhi\r\n").unwrap();
        assert_eq!(frames, vec![msg("foo", "1", Some("_INBOX.abc"), b"hi")]);
    }

    #[test]
    fn test_zero_length_payload() {
        let mut buf = FrameBuffer::new();
        let frames = buf.push(b"MSG foo 1 0\r\n\r\n").unwrap();
        assert_eq!(frames, vec![msg("foo", "1", None, b"")]);
    }

    #[test]
    fn test_payload_with_embedded_crlf() {
        let mut buf = FrameBuffer::new();
        let frames = buf.push(b"MSG foo 1 6\r\na\r\nb\r\n\r\n").unwrap();
        assert_eq!(frames, vec![msg("foo", "1", None, b"a\r\nb\r\n")]);
    }

    #[test]
    fn test_hmsg() {
        let mut buf = FrameBuffer::new();
        let frames = buf
            .push(b"HMSG foo 3 reply 18 20\r\nNATS/1.0\r\nA: b\r\n\r\nhi\r\n")
            .unwrap();
        assert_eq!(
            frames,
            vec![Frame::HMsg(HMsg {
                subject: "foo".into(),
                sid: "3".into(),
                reply_to: Some("reply".into()),
                headers: Headers::new().with("A", "b"),
                payload: Bytes::from_static(b"hi"),
            })]
        );
    }

    #[test]
    fn test_hmsg_status_only() {
        let mut buf = FrameBuffer::new();
        let frames = buf
            .push(b"HMSG _INBOX.x 2 16 16\r\nNATS/1.0 503\r\n\r\n\r\n")
            .unwrap();
        match &frames[0] {
            Frame::HMsg(m) => {
                assert_eq!(m.headers.status(), Some(503));
                assert!(m.payload.is_empty());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_fragmented_control_line_and_payload() {
        let mut buf = FrameBuffer::new();

        assert!(buf.push(b"MSG foo").unwrap().is_empty());
        assert_eq!(buf.state_name(), "WaitingForControlLine");

        assert!(buf.push(b" 1 5\r\nhe").unwrap().is_empty());
        assert_eq!(buf.state_name(), "WaitingForPayload");

        assert!(buf.push(b"llo").unwrap().is_empty());
        assert!(buf.push(b"\r").unwrap().is_empty());

        let frames = buf.push(b"\n").unwrap();
        assert_eq!(frames, vec![msg("foo", "1", None, b"hello")]);
        assert_eq!(buf.state_name(), "WaitingForControlLine");
    }

    #[test]
    fn test_byte_by_byte() {
        let wire = b"PING\r\nMSG a 1 3\r\nabc\r\n+OK\r\n-ERR 'Stale Connection'\r\n";
        let mut buf = FrameBuffer::new();
        let mut frames = Vec::new();
        for byte in wire.iter() {
            frames.extend(buf.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(
            frames,
            vec![
                Frame::Ping,
                msg("a", "1", None, b"abc"),
                Frame::Ok,
                Frame::Err("Stale Connection".into()),
            ]
        );
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buf = FrameBuffer::new();
        let frames = buf
            .push(b"PING\r\nPONG\r\nSUB foo q 1\r\nUNSUB 1 10\r\nPUB foo 1\r\nx\r\n")
            .unwrap();
        assert_eq!(frames.len(), 5);
        assert_eq!(
            frames[2],
            Frame::Sub(Sub {
                subject: "foo".into(),
                queue_group: Some("q".into()),
                sid: "1".into(),
            })
        );
        assert_eq!(
            frames[3],
            Frame::Unsub(Unsub {
                sid: "1".into(),
                max_msgs: Some(10),
            })
        );
    }

    #[test]
    fn test_info_frame() {
        let mut buf = FrameBuffer::new();
        let frames = buf
            .push(b"INFO {\"server_id\":\"S\",\"version\":\"2.10.0\",\"host\":\"h\",\"port\":4222,\"headers\":true,\"max_payload\":1024,\"proto\":1}\r\n")
            .unwrap();
        match &frames[0] {
            Frame::Info(info) => {
                assert_eq!(info.server_id, "S");
                assert_eq!(info.max_payload, 1024);
                assert!(info.headers);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_bare_lf_line_endings_accepted() {
        let mut buf = FrameBuffer::new();
        let frames = buf.push(b"PING\nPONG\n").unwrap();
        assert_eq!(frames, vec![Frame::Ping, Frame::Pong]);
    }

    #[test]
    fn test_unknown_verb() {
        let mut buf = FrameBuffer::new();
        assert!(matches!(
            buf.push(b"HELLO world\r\n"),
            Err(NatsError::Parse(_))
        ));
    }

    #[test]
    fn test_lowercase_verb_rejected() {
        let mut buf = FrameBuffer::new();
        assert!(buf.push(b"ping\r\n").is_err());
    }

    #[test]
    fn test_malformed_integer() {
        let mut buf = FrameBuffer::new();
        assert!(buf.push(b"MSG foo 1 five\r\n").is_err());
    }

    #[test]
    fn test_wrong_argument_count() {
        let mut buf = FrameBuffer::new();
        assert!(buf.push(b"MSG foo\r\n").is_err());
        let mut buf = FrameBuffer::new();
        assert!(buf.push(b"PING extra\r\n").is_err());
    }

    #[test]
    fn test_header_larger_than_total() {
        let mut buf = FrameBuffer::new();
        assert!(buf.push(b"HMSG foo 1 30 20\r\n").is_err());
    }

    #[test]
    fn test_header_block_not_terminated() {
        // Declared header length cuts the block before its blank line
        let mut buf = FrameBuffer::new();
        assert!(buf
            .push(b"HMSG foo 1 16 20\r\nNATS/1.0\r\nA: b\r\n\r\nhi\r\n")
            .is_err());
    }

    #[test]
    fn test_total_length_mismatch() {
        // Declared 3 bytes but 5 were sent before CRLF
        let mut buf = FrameBuffer::new();
        assert!(buf.push(b"MSG foo 1 3\r\nhello\r\n").is_err());
    }

    #[test]
    fn test_max_payload_exceeded() {
        let mut buf = FrameBuffer::with_limits(100, DEFAULT_MAX_CONTROL_LINE);
        let result = buf.push(b"MSG foo 1 101\r\n");
        assert!(matches!(result, Err(NatsError::Parse(_))));
    }

    #[test]
    fn test_control_line_too_long() {
        let mut buf = FrameBuffer::with_limits(DEFAULT_MAX_PAYLOAD_SIZE, 16);
        assert!(buf.push(b"MSG a.very.long.subject.name 1 0").is_err());
    }

    #[test]
    fn test_try_next_leaves_partial_frame_buffered() {
        let mut buf = FrameBuffer::new();
        buf.extend(b"PONG\r\nMSG foo 1 2\r\nh");
        assert_eq!(buf.try_next().unwrap(), Some(Frame::Pong));
        assert_eq!(buf.try_next().unwrap(), None);
        assert_eq!(buf.state_name(), "WaitingForPayload");

        let frames = buf.push(b"i\r\n").unwrap();
        assert_eq!(frames, vec![msg("foo", "1", None, b"hi")]);
    }

    #[test]
    fn test_clear() {
        let mut buf = FrameBuffer::new();
        buf.push(b"MSG foo 1 10\r\nabc").unwrap();
        assert!(!buf.is_empty());
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.state_name(), "WaitingForControlLine");
    }
}
