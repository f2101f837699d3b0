//! Wire format constants and control-line helpers.
//!
//! Every frame starts with a text control line terminated by CRLF:
//!
//! ```text
//! PUB <subject> [reply-to] <#bytes>\r\n<payload>\r\n
//! HPUB <subject> [reply-to] <#header-bytes> <#total-bytes>\r\n<headers><payload>\r\n
//! SUB <subject> [queue-group] <sid>\r\n
//! UNSUB <sid> [max-msgs]\r\n
//! MSG <subject> <sid> [reply-to] <#bytes>\r\n<payload>\r\n
//! HMSG <subject> <sid> [reply-to] <#header-bytes> <#total-bytes>\r\n<headers><payload>\r\n
//! INFO {json}\r\n / CONNECT {json}\r\n
//! PING\r\n / PONG\r\n / +OK\r\n / -ERR '<message>'\r\n
//! ```
//!
//! Payload and header sections are always read by their declared length.

use crate::error::{NatsError, Result};

/// Line terminator.
pub const CRLF: &[u8] = b"\r\n";

/// Version line that opens every header block.
pub const HEADER_VERSION: &str = "NATS/1.0";

/// Default maximum payload accepted by the parser (64 MiB, the server hard limit).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Default maximum control line length accepted by the parser.
///
/// INFO lines carry the cluster's `connect_urls`, so this is generous.
pub const DEFAULT_MAX_CONTROL_LINE: usize = 64 * 1024;

/// Protocol verbs. Matching is case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Info,
    Connect,
    Pub,
    HPub,
    Sub,
    Unsub,
    Msg,
    HMsg,
    Ping,
    Pong,
    Ok,
    Err,
}

impl Verb {
    /// Parse a verb token.
    pub fn parse(token: &str) -> Option<Verb> {
        Some(match token {
            "INFO" => Verb::Info,
            "CONNECT" => Verb::Connect,
            "PUB" => Verb::Pub,
            "HPUB" => Verb::HPub,
            "SUB" => Verb::Sub,
            "UNSUB" => Verb::Unsub,
            "MSG" => Verb::Msg,
            "HMSG" => Verb::HMsg,
            "PING" => Verb::Ping,
            "PONG" => Verb::Pong,
            "+OK" => Verb::Ok,
            "-ERR" => Verb::Err,
            _ => return None,
        })
    }

    /// The verb as written on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Info => "INFO",
            Verb::Connect => "CONNECT",
            Verb::Pub => "PUB",
            Verb::HPub => "HPUB",
            Verb::Sub => "SUB",
            Verb::Unsub => "UNSUB",
            Verb::Msg => "MSG",
            Verb::HMsg => "HMSG",
            Verb::Ping => "PING",
            Verb::Pong => "PONG",
            Verb::Ok => "+OK",
            Verb::Err => "-ERR",
        }
    }
}

/// Split a control line into its verb and the remainder.
///
/// The remainder keeps its internal spacing (INFO/CONNECT JSON, `-ERR` text).
pub fn split_verb(line: &str) -> (&str, &str) {
    let line = line.trim_start();
    match line.find(&[' ', '\t'][..]) {
        Some(pos) => (&line[..pos], line[pos..].trim()),
        None => (line.trim_end(), ""),
    }
}

/// Parse a decimal size or count field.
pub fn parse_size(field: &str, what: &str) -> Result<usize> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NatsError::Parse(format!("invalid {}: {:?}", what, field)));
    }
    field
        .parse::<usize>()
        .map_err(|_| NatsError::Parse(format!("invalid {}: {:?}", what, field)))
}

/// Find the end of the next line, starting the scan at `from`.
///
/// Returns the index of the `\n` byte.
#[inline]
pub fn find_line_end(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&b| b == b'\n')
        .map(|pos| from + pos)
}
