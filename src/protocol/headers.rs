//! Message headers carried by HPUB and HMSG.
//!
//! A header block is a version line, optionally followed by a 3-digit status
//! and a description, then `name: value` lines, then a blank line:
//!
//! ```text
//! NATS/1.0 503\r\n
//! \r\n
//! ```
//!
//! ```text
//! NATS/1.0\r\n
//! Trace-Id: 42\r\n
//! \r\n
//! ```

use bytes::BytesMut;

use super::wire_format::{CRLF, HEADER_VERSION};
use crate::error::{NatsError, Result};

/// Status code the server uses when a request has no responders.
pub const NO_RESPONDERS_STATUS: u16 = 503;

/// Ordered header list with an optional inline status.
///
/// Names may repeat; insertion order is kept on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    status: Option<u16>,
    description: Option<String>,
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a header set carrying an inline status.
    pub fn with_status(code: u16, description: Option<&str>) -> Self {
        Self {
            status: Some(code),
            description: description.map(str::to_owned),
            entries: Vec::new(),
        }
    }

    /// Append a header. Validation happens on publish via [`Headers::validate`].
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.push((name.into(), value.into()));
        self
    }

    /// Builder-style [`Headers::insert`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Remove every value for `name`. Returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| n != name);
        before - self.entries.len()
    }

    /// Iterate over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of header entries (the status line is not counted).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inline status code, e.g. `503`.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Inline status description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Check names and values so the encoded block parses back identically.
    pub fn validate(&self) -> Result<()> {
        if let Some(code) = self.status {
            if !(100..=999).contains(&code) {
                return Err(NatsError::Validation(format!("header status {}", code)));
            }
        }
        if let Some(desc) = &self.description {
            if self.status.is_none()
                || desc.is_empty()
                || desc.contains(is_line_break)
                || desc.trim() != desc
            {
                return Err(NatsError::Validation(format!(
                    "header status description {:?}",
                    desc
                )));
            }
        }
        for (name, value) in &self.entries {
            let name_ok = !name.is_empty()
                && name
                    .bytes()
                    .all(|b| b.is_ascii_graphic() && b != b':');
            if !name_ok {
                return Err(NatsError::Validation(format!("header name {:?}", name)));
            }
            if value.contains(is_line_break) || value.trim() != value {
                return Err(NatsError::Validation(format!(
                    "header value {:?} for {:?}",
                    value, name
                )));
            }
        }
        Ok(())
    }

    /// Encoded length of the header block, terminating blank line included.
    pub fn encoded_len(&self) -> usize {
        let mut len = HEADER_VERSION.len() + CRLF.len();
        if let Some(code) = self.status {
            len += 1 + decimal_len(code as usize);
            if let Some(desc) = &self.description {
                len += 1 + desc.len();
            }
        }
        for (name, value) in &self.entries {
            len += name.len() + 2 + value.len() + CRLF.len();
        }
        len + CRLF.len()
    }

    /// Write the header block, terminating blank line included.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.extend_from_slice(HEADER_VERSION.as_bytes());
        if let Some(code) = self.status {
            dst.extend_from_slice(b" ");
            dst.extend_from_slice(code.to_string().as_bytes());
            if let Some(desc) = &self.description {
                dst.extend_from_slice(b" ");
                dst.extend_from_slice(desc.as_bytes());
            }
        }
        dst.extend_from_slice(CRLF);
        for (name, value) in &self.entries {
            dst.extend_from_slice(name.as_bytes());
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(value.as_bytes());
            dst.extend_from_slice(CRLF);
        }
        dst.extend_from_slice(CRLF);
    }

    /// Decode a header block of exactly the declared header length.
    pub fn decode(block: &[u8]) -> Result<Self> {
        if !block.ends_with(b"\r\n\r\n") {
            return Err(NatsError::Parse(
                "header block not terminated within declared header length".into(),
            ));
        }
        let text = std::str::from_utf8(&block[..block.len() - 4])
            .map_err(|_| NatsError::Parse("header block is not valid UTF-8".into()))?;

        let mut lines = text.split("\r\n");
        let version_line = lines.next().unwrap_or_default();
        let rest = version_line
            .strip_prefix(HEADER_VERSION)
            .ok_or_else(|| NatsError::Parse(format!("bad header version line {:?}", version_line)))?;

        let mut headers = Headers::new();
        let rest = rest.trim();
        if !rest.is_empty() {
            let (code, desc) = match rest.split_once(' ') {
                Some((code, desc)) => (code, Some(desc.trim())),
                None => (rest, None),
            };
            if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
                return Err(NatsError::Parse(format!("bad header status {:?}", code)));
            }
            headers.status = code.parse().ok();
            headers.description = desc.filter(|d| !d.is_empty()).map(str::to_owned);
        }

        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| NatsError::Parse(format!("malformed header line {:?}", line)))?;
            if name.is_empty() {
                return Err(NatsError::Parse(format!("empty header name in {:?}", line)));
            }
            headers
                .entries
                .push((name.to_owned(), value.trim().to_owned()));
        }

        Ok(headers)
    }
}

fn is_line_break(c: char) -> bool {
    c == '\r' || c == '\n'
}

fn decimal_len(mut n: usize) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}
