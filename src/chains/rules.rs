//! Rules: named, side-effect-free predicates over a list, a message, and
//! its processing metadata.

use std::sync::Arc;

use regex::RegexBuilder;
use secrecy::ExposeSecret;
use tracing::warn;

use crate::chains::types::{InboundMessage, ListContext, MessageMetadata};
use crate::config::HeaderMatch;
use crate::requests::model::{SenderFilter, address_matches};

/// A named predicate.
pub trait Rule: Send + Sync {
    /// Unique rule name, recorded in hits and misses.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Whether hits and misses of this rule are recorded.
    fn record(&self) -> bool {
        true
    }

    fn check(&self, list: &ListContext, msg: &InboundMessage, meta: &MessageMetadata) -> bool;
}

type Predicate = dyn Fn(&ListContext, &InboundMessage, &MessageMetadata) -> bool + Send + Sync;

/// A rule backed by a closure.
pub struct FnRule {
    name: String,
    description: String,
    record: bool,
    predicate: Box<Predicate>,
}

impl FnRule {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ListContext, &InboundMessage, &MessageMetadata) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            record: true,
            predicate: Box::new(predicate),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Do not record hits or misses of this rule.
    pub fn unrecorded(mut self) -> Self {
        self.record = false;
        self
    }
}

impl Rule for FnRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn record(&self) -> bool {
        self.record
    }

    fn check(&self, list: &ListContext, msg: &InboundMessage, meta: &MessageMetadata) -> bool {
        (self.predicate)(list, msg, meta)
    }
}

macro_rules! unit_rule {
    ($ty:ident, $name:literal, $desc:literal) => {
        pub struct $ty;

        impl $ty {
            pub const NAME: &'static str = $name;
            pub const DESCRIPTION: &'static str = $desc;
        }
    };
}

unit_rule!(Approved, "approved", "The message carries the moderator password");
unit_rule!(Emergency, "emergency", "The list is in emergency hold");
unit_rule!(Loop, "loop", "The message has already passed through this list");
unit_rule!(Administrivia, "administrivia", "The message looks like a list command");
unit_rule!(ImplicitDest, "implicit-dest", "The list is not an explicit recipient");
unit_rule!(MaxRecipients, "max-recipients", "The message has too many recipients");
unit_rule!(MaxSize, "max-size", "The message is too large");
unit_rule!(NoSubject, "no-subject", "The message has no subject");
unit_rule!(SuspiciousHeader, "suspicious-header", "A header matches a suspicious pattern");
unit_rule!(MemberModeration, "member-moderation", "The sender is a moderated member");
unit_rule!(NonmemberModeration, "nonmember-moderation", "The sender is not a member");
unit_rule!(Any, "any", "Some earlier rule matched");
unit_rule!(Truth, "truth", "Always matches");

/// Case-insensitive regex match; invalid patterns are logged and never match.
fn pattern_matches(pattern: &str, value: &str) -> bool {
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => re.is_match(value),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Ignoring invalid header pattern");
            false
        }
    }
}

impl Rule for Approved {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn description(&self) -> &str {
        Self::DESCRIPTION
    }
    fn check(&self, list: &ListContext, msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        let Some(password) = &list.config.moderator_password else {
            return false;
        };
        let password = password.expose_secret();
        if password.is_empty() {
            return false;
        }
        ["Approved", "Approve"]
            .into_iter()
            .flat_map(|h| msg.header_values(h))
            .any(|value| value == password)
    }
}

impl Rule for Emergency {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn description(&self) -> &str {
        Self::DESCRIPTION
    }
    fn check(&self, list: &ListContext, _msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        list.config.emergency
    }
}

impl Rule for Loop {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn description(&self) -> &str {
        Self::DESCRIPTION
    }
    fn check(&self, list: &ListContext, msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        msg.header_values("X-BeenThere")
            .any(|v| v.eq_ignore_ascii_case(&list.config.posting_address))
    }
}

/// Words that start a list command.
const COMMAND_WORDS: &[&str] = &[
    "confirm",
    "help",
    "info",
    "join",
    "leave",
    "options",
    "password",
    "remove",
    "set",
    "subscribe",
    "unsubscribe",
    "who",
];

/// Body lines inspected for commands.
const COMMAND_SCAN_LINES: usize = 5;

fn looks_like_command(line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(first) = words.next() else {
        return false;
    };
    let first = first.trim_end_matches(':').to_lowercase();
    COMMAND_WORDS.contains(&first.as_str()) && words.count() <= 2
}

impl Rule for Administrivia {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn description(&self) -> &str {
        Self::DESCRIPTION
    }
    fn check(&self, list: &ListContext, msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        if !list.config.administrivia {
            return false;
        }
        if msg.subject.as_deref().is_some_and(looks_like_command) {
            return true;
        }
        msg.body
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(COMMAND_SCAN_LINES)
            .any(looks_like_command)
    }
}

impl Rule for ImplicitDest {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn description(&self) -> &str {
        Self::DESCRIPTION
    }
    fn check(&self, list: &ListContext, msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        let config = &list.config;
        if !config.require_explicit_destination {
            return false;
        }
        !msg.recipients.iter().any(|r| {
            r.eq_ignore_ascii_case(&config.posting_address)
                || config
                    .acceptable_aliases
                    .iter()
                    .any(|alias| address_matches(alias, r))
        })
    }
}

impl Rule for MaxRecipients {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn description(&self) -> &str {
        Self::DESCRIPTION
    }
    fn check(&self, list: &ListContext, msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        let max = list.config.max_num_recipients;
        max > 0 && msg.recipients.len() >= max
    }
}

impl Rule for MaxSize {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn description(&self) -> &str {
        Self::DESCRIPTION
    }
    fn check(&self, list: &ListContext, msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        let max_kb = list.config.max_message_size_kb;
        max_kb > 0 && msg.raw.len() as u64 > max_kb * 1024
    }
}

impl Rule for NoSubject {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn description(&self) -> &str {
        Self::DESCRIPTION
    }
    fn check(&self, _list: &ListContext, msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        msg.subject.is_none()
    }
}

impl Rule for SuspiciousHeader {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn description(&self) -> &str {
        Self::DESCRIPTION
    }
    fn check(&self, list: &ListContext, msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        list.config.bounce_matching_headers.iter().any(|hp| {
            msg.header_values(&hp.header)
                .any(|value| pattern_matches(&hp.pattern, value))
        })
    }
}

impl Rule for MemberModeration {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn description(&self) -> &str {
        Self::DESCRIPTION
    }
    fn check(&self, list: &ListContext, msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        list.policy
            .member(&msg.sender)
            .is_some_and(|member| member.moderated)
    }
}

impl Rule for NonmemberModeration {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn description(&self) -> &str {
        Self::DESCRIPTION
    }
    fn check(&self, list: &ListContext, msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        !list.policy.is_member(&msg.sender)
    }
}

impl Rule for Any {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn description(&self) -> &str {
        Self::DESCRIPTION
    }
    fn record(&self) -> bool {
        false
    }
    fn check(&self, _list: &ListContext, _msg: &InboundMessage, meta: &MessageMetadata) -> bool {
        !meta.rule_hits.is_empty()
    }
}

impl Rule for Truth {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn description(&self) -> &str {
        Self::DESCRIPTION
    }
    fn record(&self) -> bool {
        false
    }
    fn check(&self, _list: &ListContext, _msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        true
    }
}

/// Nonmember sender on one of the list's filter lists.
pub struct NonmemberFilter {
    filter: SenderFilter,
    name: &'static str,
}

impl NonmemberFilter {
    pub fn new(filter: SenderFilter) -> Self {
        let name = match filter {
            SenderFilter::Accept => "accept-these-nonmembers",
            SenderFilter::Hold => "hold-these-nonmembers",
            SenderFilter::Reject => "reject-these-nonmembers",
            SenderFilter::Discard => "discard-these-nonmembers",
        };
        Self { filter, name }
    }
}

impl Rule for NonmemberFilter {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "The nonmember sender is on a filter list"
    }
    fn check(&self, list: &ListContext, msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        !list.policy.is_member(&msg.sender) && list.policy.in_filter(self.filter, &msg.sender)
    }
}

/// One configured header pattern.
pub struct HeaderMatchRule {
    name: String,
    header: String,
    pattern: String,
}

/// Prefix of per-list header match rule names.
pub const HEADER_MATCH_PREFIX: &str = "header-match-";

impl HeaderMatchRule {
    pub fn new(index: usize, spec: &HeaderMatch) -> Self {
        Self {
            name: format!("{HEADER_MATCH_PREFIX}{index}"),
            header: spec.header.clone(),
            pattern: spec.pattern.clone(),
        }
    }
}

impl Rule for HeaderMatchRule {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "A header matches a configured pattern"
    }
    fn check(&self, _list: &ListContext, msg: &InboundMessage, _meta: &MessageMetadata) -> bool {
        msg.header_values(&self.header)
            .any(|value| pattern_matches(&self.pattern, value))
    }
}

/// Every built-in rule except the per-list header matches.
pub fn builtin_rules() -> Vec<Arc<dyn Rule>> {
    let mut rules: Vec<Arc<dyn Rule>> = vec![
        Arc::new(Approved),
        Arc::new(Emergency),
        Arc::new(Loop),
        Arc::new(Administrivia),
        Arc::new(ImplicitDest),
        Arc::new(MaxRecipients),
        Arc::new(MaxSize),
        Arc::new(NoSubject),
        Arc::new(SuspiciousHeader),
        Arc::new(MemberModeration),
        Arc::new(NonmemberModeration),
        Arc::new(Any),
        Arc::new(Truth),
    ];
    for filter in SenderFilter::ALL {
        rules.push(Arc::new(NonmemberFilter::new(filter)));
    }
    rules
}
