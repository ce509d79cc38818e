//! Types that flow through chain processing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};

use crate::config::ListConfig;
use crate::requests::model::ListPolicy;

/// A parsed inbound post.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// From: address, lowercased. Empty when the message has none.
    pub sender: String,
    /// To: and Cc: addresses, lowercased.
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    /// Header fields in order, continuation lines unfolded.
    pub headers: Vec<(String, String)>,
    /// First text body part.
    pub body: String,
    pub raw: Vec<u8>,
}

impl InboundMessage {
    /// Parse raw RFC 5322 bytes. A leading mbox `From ` line is skipped.
    /// Fails on input with no header block.
    pub fn parse(raw: &[u8]) -> Result<Self, String> {
        let raw = strip_mbox_separator(raw);
        let headers = parse_header_block(raw)?;
        if headers.is_empty() {
            return Err("message has no headers".into());
        }
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| "message could not be parsed".to_string())?;

        let sender = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();

        let mut recipients = extract_addresses(parsed.to());
        recipients.extend(extract_addresses(parsed.cc()));

        let subject = parsed
            .subject()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let body = parsed
            .body_text(0)
            .map(|t| t.to_string())
            .unwrap_or_default();

        Ok(Self {
            sender,
            recipients,
            subject,
            headers,
            body,
            raw: raw.to_vec(),
        })
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header, in order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_lowercase()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_lowercase()))
            })
            .collect(),
    }
}

/// Split the header block into unfolded (name, value) pairs.
/// Drop a leading mbox `From sender date` separator line.
fn strip_mbox_separator(raw: &[u8]) -> &[u8] {
    if !raw.starts_with(b"From ") {
        return raw;
    }
    match raw.iter().position(|&b| b == b'\n') {
        Some(end) => &raw[end + 1..],
        None => &[],
    }
}

fn parse_header_block(raw: &[u8]) -> Result<Vec<(String, String)>, String> {
    let text = String::from_utf8_lossy(raw);
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            match headers.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return Err("continuation line before any header".into()),
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("malformed header line: {:?}", truncate(line, 40)))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(format!("malformed header name: {:?}", truncate(name, 40)));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Final outcome recorded by a terminal chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "disposition")]
pub enum Disposition {
    Accepted,
    Held { id: u64 },
    Rejected,
    Discarded,
}

/// Per-message processing state, owned by the caller of `process`.
#[derive(Debug, Clone, Default)]
pub struct MessageMetadata {
    /// Recorded rules that matched, in evaluation order.
    pub rule_hits: Vec<String>,
    /// Recorded rules that did not match, in evaluation order.
    pub rule_misses: Vec<String>,
    /// Human-readable reasons for a hold or rejection.
    pub moderation_reasons: Vec<String>,
    pub disposition: Option<Disposition>,
    pub received_time: Option<DateTime<Utc>>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// What rules may look at for one list: its configuration plus a snapshot
/// of its policy.
#[derive(Debug, Clone)]
pub struct ListContext {
    pub config: Arc<ListConfig>,
    pub policy: ListPolicy,
}

impl ListContext {
    pub fn new(config: ListConfig) -> Self {
        Self {
            config: Arc::new(config),
            policy: ListPolicy::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_message() {
        let raw = b"From: Bob <Bob@Example.com>\r\n\
To: devel@example.com, carol@example.com\r\n\
Cc: dave@example.com\r\n\
Subject: hello\r\n\
X-Folded: first\r\n\
\x20 second\r\n\
\r\n\
body text\r\n";
        let msg = InboundMessage::parse(raw).unwrap();
        assert_eq!(msg.sender, "bob@example.com");
        assert_eq!(
            msg.recipients,
            vec!["devel@example.com", "carol@example.com", "dave@example.com"]
        );
        assert_eq!(msg.subject.as_deref(), Some("hello"));
        assert_eq!(msg.header("x-folded"), Some("first second"));
        assert!(msg.body.contains("body text"));
    }

    #[test]
    fn mbox_separator_is_skipped() {
        let raw = b"From bob@example.com Tue Mar 10 12:00:00 2026\n\
From: bob@example.com\n\
Subject: from an mbox\n\
\n\
hi\n";
        let msg = InboundMessage::parse(raw).unwrap();
        assert_eq!(msg.sender, "bob@example.com");
        assert_eq!(msg.subject.as_deref(), Some("from an mbox"));
        assert_eq!(msg.headers[0].0, "From");
        assert!(msg.raw.starts_with(b"From: "));

        assert!(InboundMessage::parse(b"From bob@example.com Tue Mar 10 12:00:00 2026").is_err());
    }

    #[test]
    fn blank_subject_is_none() {
        let msg = InboundMessage::parse(b"From: a@example.com\nSubject:   \n\nhi\n").unwrap();
        assert!(msg.subject.is_none());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(InboundMessage::parse(b"").is_err());
        assert!(InboundMessage::parse(b"this is not a header\n\nbody").is_err());
        assert!(InboundMessage::parse(b"\n\nbody only").is_err());
    }

    #[test]
    fn repeated_headers_in_order() {
        let msg =
            InboundMessage::parse(b"From: a@example.com\nReceived: one\nReceived: two\n\n").unwrap();
        let values: Vec<&str> = msg.header_values("received").collect();
        assert_eq!(values, vec!["one", "two"]);
    }
}
