//! Subject and token validation.
//!
//! Subjects are dot-separated tokens. Publish subjects must be literal;
//! subscription patterns may use `*` (exactly one token) and `>` (one or more
//! trailing tokens). All checks are single-pass character scans and run
//! before any I/O.

use crate::error::{NatsError, Result};

/// Token separator.
pub const SEPARATOR: char = '.';
/// Single-token wildcard.
pub const WILDCARD: char = '*';
/// Full (tail) wildcard.
pub const FULL_WILDCARD: char = '>';

/// Check a single name token (e.g. a queue group or one subject token).
///
/// Returns `false` if the token is empty or contains `.`, `*` or `>`.
#[inline]
pub fn validate(token: &str) -> bool {
    !token.is_empty()
        && !token
            .chars()
            .any(|c| c == SEPARATOR || c == WILDCARD || c == FULL_WILDCARD)
}

/// Validate a queue group name.
///
/// Same rules as [`validate`], and whitespace is rejected because it would
/// split the SUB control line.
pub fn validate_queue_group(name: &str) -> Result<()> {
    if validate(name) && !name.chars().any(char::is_whitespace) {
        Ok(())
    } else {
        Err(NatsError::Validation(format!("queue group {:?}", name)))
    }
}

/// Validate a literal subject used for publishing or as a reply subject.
pub fn validate_subject(subject: &str) -> Result<()> {
    check(subject, false)
}

/// Validate a subscription pattern.
pub fn validate_pattern(subject: &str) -> Result<()> {
    check(subject, true)
}

fn check(subject: &str, wildcards: bool) -> Result<()> {
    let invalid = |reason: &str| {
        Err(NatsError::Validation(format!(
            "subject {:?}: {}",
            subject, reason
        )))
    };

    if subject.is_empty() {
        return invalid("empty");
    }

    let mut token_len = 0usize;
    // Set when the current token is exactly `*` or `>` so far.
    let mut wildcard_token: Option<char> = None;

    for c in subject.chars() {
        match c {
            SEPARATOR => {
                if token_len == 0 {
                    return invalid("empty token");
                }
                if wildcard_token == Some(FULL_WILDCARD) {
                    return invalid("'>' must be the last token");
                }
                token_len = 0;
                wildcard_token = None;
            }
            WILDCARD | FULL_WILDCARD => {
                if !wildcards {
                    return invalid("wildcards are not allowed");
                }
                if token_len != 0 {
                    return invalid("wildcards must be whole tokens");
                }
                token_len = 1;
                wildcard_token = Some(c);
            }
            c if c.is_whitespace() => return invalid("contains whitespace"),
            _ => {
                if wildcard_token.is_some() {
                    return invalid("wildcards must be whole tokens");
                }
                token_len += 1;
            }
        }
    }

    if token_len == 0 {
        return invalid("empty token");
    }
    Ok(())
}

/// Check whether a literal subject matches a subscription pattern.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split(SEPARATOR);
    for token in pattern.split(SEPARATOR) {
        match token {
            ">" => return subject_tokens.next().is_some(),
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    subject_tokens.next().is_none()
}
