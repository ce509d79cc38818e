//! Held request data model: kinds, payloads, decisions, and list policy state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// What a held request is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// A post held for moderator approval.
    HeldMessage,
    /// A subscription awaiting approval.
    Subscription,
    /// An unsubscription awaiting approval.
    Unsubscription,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeldMessage => write!(f, "held_message"),
            Self::Subscription => write!(f, "subscription"),
            Self::Unsubscription => write!(f, "unsubscription"),
        }
    }
}

impl std::str::FromStr for RequestKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "held_message" => Ok(Self::HeldMessage),
            "subscription" => Ok(Self::Subscription),
            "unsubscription" => Ok(Self::Unsubscription),
            _ => Err(format!("Unknown request kind: {}", s)),
        }
    }
}

/// Kind-specific request data.
#[derive(Debug)]
pub enum RequestPayload {
    HeldMessage {
        subject: String,
        /// Why the message was held.
        reason: String,
        /// Reference understood by the content store.
        content_ref: String,
        /// Free-form metadata captured at hold time (may carry `received_time`).
        metadata: serde_json::Map<String, serde_json::Value>,
    },
    Subscription {
        address: String,
        display_name: String,
        password: SecretString,
        digest: bool,
        language: String,
    },
    Unsubscription {
        address: String,
    },
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::HeldMessage { .. } => RequestKind::HeldMessage,
            Self::Subscription { .. } => RequestKind::Subscription,
            Self::Unsubscription { .. } => RequestKind::Unsubscription,
        }
    }
}

/// A pending request awaiting a moderator decision.
#[derive(Debug)]
pub struct HeldRequest {
    /// Unique per list, never reused.
    pub id: u64,
    pub created_at: DateTime<Utc>,
    /// Originating address.
    pub sender: String,
    pub payload: RequestPayload,
}

impl HeldRequest {
    pub fn kind(&self) -> RequestKind {
        self.payload.kind()
    }

    /// Key used when grouping requests by sender: the sender for held
    /// messages, the subject address for (un)subscriptions. Lowercased.
    pub fn group_key(&self) -> String {
        match &self.payload {
            RequestPayload::HeldMessage { .. } => self.sender.to_lowercase(),
            RequestPayload::Subscription { address, .. }
            | RequestPayload::Unsubscription { address } => address.to_lowercase(),
        }
    }

    /// Subject line for held messages.
    pub fn subject(&self) -> Option<&str> {
        match &self.payload {
            RequestPayload::HeldMessage { subject, .. } => Some(subject),
            _ => None,
        }
    }
}

/// A moderator's decision on one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Leave the request pending.
    Defer,
    Approve,
    Reject,
    /// Delete without notifying anyone.
    Discard,
    /// Approve a subscription.
    Subscribe,
    /// Approve an unsubscription.
    Unsubscribe,
}

impl Decision {
    /// Whether this decision can be applied to a request of `kind`.
    pub fn applies_to(self, kind: RequestKind) -> bool {
        match self {
            Self::Defer | Self::Approve | Self::Reject | Self::Discard => true,
            Self::Subscribe => kind == RequestKind::Subscription,
            Self::Unsubscribe => kind == RequestKind::Unsubscription,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Defer => "defer",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Discard => "discard",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for Decision {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "defer" => Ok(Self::Defer),
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "discard" => Ok(Self::Discard),
            "subscribe" => Ok(Self::Subscribe),
            "unsubscribe" => Ok(Self::Unsubscribe),
            _ => Err(format!("Unknown decision: {}", s)),
        }
    }
}

/// Nonmember sender filter lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderFilter {
    Accept,
    Hold,
    Reject,
    Discard,
}

impl SenderFilter {
    /// All filters, in the order they are consulted.
    pub const ALL: [SenderFilter; 4] = [Self::Accept, Self::Hold, Self::Reject, Self::Discard];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Hold => "hold",
            Self::Reject => "reject",
            Self::Discard => "discard",
        }
    }
}

impl std::str::FromStr for SenderFilter {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(Self::Accept),
            "hold" => Ok(Self::Hold),
            "reject" => Ok(Self::Reject),
            "discard" => Ok(Self::Discard),
            _ => Err(format!("Unknown sender filter: {}", s)),
        }
    }
}

/// Side effects requested alongside a decision.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Reason sent to the sender on rejection.
    pub reason: Option<String>,
    /// Keep a copy of an approved message for the site administrator.
    pub preserve: bool,
    /// Forward a copy of an approved message to this address.
    pub forward_to: Option<String>,
    /// Add the sender to the ban list.
    pub ban: bool,
    /// Add the sender to one of the nonmember filter lists.
    pub sender_filter: Option<SenderFilter>,
    /// Clear the sender's member moderation flag.
    pub clear_moderation: bool,
}

/// Result of a successful resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Deferred,
    Approved,
    Rejected,
    Discarded,
}

/// A list member as seen by moderation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub display_name: String,
    /// Posts from moderated members are held.
    pub moderated: bool,
    pub digest: bool,
    pub language: String,
}

impl Member {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            moderated: false,
            digest: false,
            language: "en".into(),
        }
    }
}

/// Autoresponse rate-limit entry for one sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoResponse {
    pub last_response: DateTime<Utc>,
    pub count: u32,
}

/// Per-list policy state mutated by resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPolicy {
    /// Banned addresses; entries starting with `^` are regular expressions.
    pub ban_list: Vec<String>,
    pub accept_these_nonmembers: Vec<String>,
    pub hold_these_nonmembers: Vec<String>,
    pub reject_these_nonmembers: Vec<String>,
    pub discard_these_nonmembers: Vec<String>,
    /// Members keyed by lowercased address.
    pub members: BTreeMap<String, Member>,
    /// Autoresponse tracking keyed by lowercased sender.
    pub autoresponses: BTreeMap<String, AutoResponse>,
}

impl ListPolicy {
    pub fn is_member(&self, address: &str) -> bool {
        self.members.contains_key(&address.to_lowercase())
    }

    pub fn member(&self, address: &str) -> Option<&Member> {
        self.members.get(&address.to_lowercase())
    }

    /// The ban list entry matching `address`, if any.
    pub fn ban_pattern(&self, address: &str) -> Option<String> {
        self.ban_list
            .iter()
            .find(|entry| address_matches(entry, address))
            .cloned()
    }

    pub fn filter_list(&self, filter: SenderFilter) -> &Vec<String> {
        match filter {
            SenderFilter::Accept => &self.accept_these_nonmembers,
            SenderFilter::Hold => &self.hold_these_nonmembers,
            SenderFilter::Reject => &self.reject_these_nonmembers,
            SenderFilter::Discard => &self.discard_these_nonmembers,
        }
    }

    pub fn filter_list_mut(&mut self, filter: SenderFilter) -> &mut Vec<String> {
        match filter {
            SenderFilter::Accept => &mut self.accept_these_nonmembers,
            SenderFilter::Hold => &mut self.hold_these_nonmembers,
            SenderFilter::Reject => &mut self.reject_these_nonmembers,
            SenderFilter::Discard => &mut self.discard_these_nonmembers,
        }
    }

    /// Whether `sender` appears on the given filter list.
    pub fn in_filter(&self, filter: SenderFilter, sender: &str) -> bool {
        self.filter_list(filter)
            .iter()
            .any(|entry| address_matches(entry, sender))
    }
}

/// Match an address against a list entry. Entries starting with `^` are
/// case-insensitive regular expressions; anything else is compared literally,
/// ignoring case. Invalid patterns never match.
pub fn address_matches(entry: &str, address: &str) -> bool {
    if entry.starts_with('^') {
        match Regex::new(&format!("(?i){entry}")) {
            Ok(re) => re.is_match(address),
            Err(e) => {
                warn!(pattern = %entry, error = %e, "Ignoring invalid address pattern");
                false
            }
        }
    } else {
        entry.eq_ignore_ascii_case(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrips_through_strings() {
        for kind in [
            RequestKind::HeldMessage,
            RequestKind::Subscription,
            RequestKind::Unsubscription,
        ] {
            assert_eq!(kind.to_string().parse::<RequestKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<RequestKind>().is_err());
    }

    #[test]
    fn decisions_per_kind() {
        assert!(Decision::Approve.applies_to(RequestKind::HeldMessage));
        assert!(!Decision::Subscribe.applies_to(RequestKind::HeldMessage));
        assert!(Decision::Subscribe.applies_to(RequestKind::Subscription));
        assert!(!Decision::Subscribe.applies_to(RequestKind::Unsubscription));
        assert!(Decision::Unsubscribe.applies_to(RequestKind::Unsubscription));
    }

    #[test]
    fn ban_patterns() {
        let policy = ListPolicy {
            ban_list: vec!["spammer@example.com".into(), r"^.*@spam\.org$".into()],
            ..Default::default()
        };
        assert_eq!(
            policy.ban_pattern("Spammer@Example.com").as_deref(),
            Some("spammer@example.com")
        );
        assert_eq!(
            policy.ban_pattern("anyone@spam.org").as_deref(),
            Some(r"^.*@spam\.org$")
        );
        assert!(policy.ban_pattern("alice@example.com").is_none());
    }

    #[test]
    fn invalid_pattern_never_matches() {
        assert!(!address_matches("^(unclosed", "a@b.c"));
    }

    #[test]
    fn filters_and_members() {
        let mut policy = ListPolicy::default();
        policy
            .filter_list_mut(SenderFilter::Discard)
            .push("noise@example.com".into());
        policy
            .members
            .insert("alice@example.com".into(), Member::new("Alice"));

        assert!(policy.in_filter(SenderFilter::Discard, "NOISE@example.com"));
        assert!(!policy.in_filter(SenderFilter::Accept, "noise@example.com"));
        assert!(policy.is_member("Alice@Example.com"));
        assert_eq!(policy.member("alice@example.com").unwrap().language, "en");
    }

    #[test]
    fn group_key_uses_address_for_subscriptions() {
        let req = HeldRequest {
            id: 1,
            created_at: Utc::now(),
            sender: "Bob@Example.com".into(),
            payload: RequestPayload::Unsubscription {
                address: "Bob@Example.com".into(),
            },
        };
        assert_eq!(req.group_key(), "bob@example.com");
        assert_eq!(req.kind(), RequestKind::Unsubscription);
        assert!(req.subject().is_none());
    }
}
