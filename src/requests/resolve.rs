//! Resolution protocol: applying moderator decisions to held requests.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::chains::types::InboundMessage;
use crate::error::{ContentError, ModerationError};
use crate::requests::manager::{LockedList, Outbound};
use crate::requests::model::{
    Decision, Member, Outcome, RequestKind, RequestPayload, ResolveOptions,
};

/// Reason sent to the sender when a rejection gives none.
pub const DEFAULT_REJECT_REASON: &str = "[No reason given]";

/// Per-id results of a batch resolution.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub resolved: Vec<(u64, Outcome)>,
    /// Already resolved by someone else.
    pub skipped: Vec<u64>,
    /// Held content was missing; the record was discarded.
    pub lost: Vec<u64>,
    /// Held content was unreadable; the record was discarded.
    pub corrupt: Vec<u64>,
    pub already_members: Vec<String>,
    /// (address, matching ban pattern)
    pub banned: Vec<(String, String)>,
    /// Decision not applicable to the request kind.
    pub invalid: Vec<u64>,
    /// Duplicate (un)subscription requests discarded before resolving.
    pub duplicates: Vec<u64>,
}

impl BatchReport {
    /// Fold one resolution result into the report. Fatal errors are returned.
    fn absorb(
        &mut self,
        id: u64,
        result: Result<Outcome, ModerationError>,
    ) -> Result<(), ModerationError> {
        match result {
            Ok(outcome) => self.resolved.push((id, outcome)),
            Err(ModerationError::NotFound { .. }) | Err(ModerationError::NotAMember { .. }) => {
                self.skipped.push(id)
            }
            Err(ModerationError::LostItem { .. }) => self.lost.push(id),
            Err(ModerationError::CorruptItem { .. }) => self.corrupt.push(id),
            Err(ModerationError::AlreadyMember { address }) => self.already_members.push(address),
            Err(ModerationError::MembershipBanned { address, pattern }) => {
                self.banned.push((address, pattern))
            }
            Err(ModerationError::InvalidDecision { .. }) => self.invalid.push(id),
            Err(fatal) => return Err(fatal),
        }
        Ok(())
    }
}

/// A held message as shown to a moderator.
#[derive(Debug, Clone)]
pub struct HeldMessageView {
    pub id: u64,
    pub sender: String,
    pub subject: String,
    pub reason: String,
    pub received_time: Option<DateTime<Utc>>,
    pub headers: Vec<(String, String)>,
    /// Body text, cut at the configured page limit.
    pub excerpt: String,
    pub truncated: bool,
}

fn truncate_chars(text: &str, limit: usize) -> (String, bool) {
    if limit == 0 {
        return (text.to_string(), false);
    }
    match text.char_indices().nth(limit) {
        Some((idx, _)) => (text[..idx].to_string(), true),
        None => (text.to_string(), false),
    }
}

impl LockedList {
    /// Apply one decision to one request.
    ///
    /// A ban requested in `options` is applied before the decision; sender
    /// filter and moderation-flag changes after it, whatever its result.
    pub async fn resolve(
        &mut self,
        id: u64,
        decision: Decision,
        options: &ResolveOptions,
    ) -> Result<Outcome, ModerationError> {
        let request = self.get(id)?;
        let kind = request.kind();
        if !decision.applies_to(kind) {
            return Err(ModerationError::InvalidDecision { id, decision, kind });
        }
        let address = match &request.payload {
            RequestPayload::HeldMessage { .. } => request.sender.clone(),
            RequestPayload::Subscription { address, .. }
            | RequestPayload::Unsubscription { address } => address.clone(),
        };

        if options.ban {
            self.ban(&address);
        }

        let result = match kind {
            RequestKind::HeldMessage => self.resolve_held_message(id, decision, options).await,
            RequestKind::Subscription => self.resolve_subscription(id, decision, options).await,
            RequestKind::Unsubscription => {
                self.resolve_unsubscription(id, decision, options).await
            }
        };

        if let Some(filter) = options.sender_filter {
            self.add_sender_filter(filter, &address);
        }
        if options.clear_moderation
            && let Err(e) = self.clear_moderation(&address)
        {
            debug!(list = %self.name(), address = %address, error = %e, "Moderation flag not cleared");
        }

        match &result {
            Ok(outcome) => info!(
                list = %self.name(),
                id,
                kind = %kind,
                decision = %decision,
                outcome = ?outcome,
                "Request resolved"
            ),
            Err(e) => warn!(list = %self.name(), id, decision = %decision, error = %e, "Resolution failed"),
        }
        result
    }

    /// Fetch and parse held content. Lost or corrupt content discards the
    /// record.
    async fn fetch_held(&mut self, id: u64) -> Result<InboundMessage, ModerationError> {
        let content_ref = match &self.get(id)?.payload {
            RequestPayload::HeldMessage { content_ref, .. } => content_ref.clone(),
            _ => return Err(ModerationError::NotFound { id }),
        };

        let raw = match self.services.content.fetch(&content_ref).await {
            Ok(raw) => raw,
            Err(ContentError::NotFound { .. }) => {
                warn!(list = %self.name(), id, reference = %content_ref, "Held message lost, discarding");
                self.delete(id);
                return Err(ModerationError::LostItem { id });
            }
            Err(ContentError::Unreadable { reason, .. }) => {
                warn!(list = %self.name(), id, reason = %reason, "Held message unreadable, discarding");
                self.delete(id);
                return Err(ModerationError::CorruptItem { id, reason });
            }
            Err(e) => return Err(e.into()),
        };

        InboundMessage::parse(&raw).map_err(|reason| {
            warn!(list = %self.name(), id, reason = %reason, "Held message corrupt, discarding");
            self.delete(id);
            ModerationError::CorruptItem { id, reason }
        })
    }

    async fn resolve_held_message(
        &mut self,
        id: u64,
        decision: Decision,
        options: &ResolveOptions,
    ) -> Result<Outcome, ModerationError> {
        match decision {
            Decision::Defer => Ok(Outcome::Deferred),
            Decision::Discard => {
                self.delete(id);
                Ok(Outcome::Discarded)
            }
            Decision::Approve => {
                let msg = self.fetch_held(id).await?;
                let content_ref = match &self.get(id)?.payload {
                    RequestPayload::HeldMessage { content_ref, .. } => content_ref.clone(),
                    _ => return Err(ModerationError::NotFound { id }),
                };
                if options.preserve
                    && let Err(e) = self.services.content.preserve(&content_ref).await
                {
                    warn!(list = %self.name(), id, error = %e, "Failed to preserve held message");
                }
                if let Some(recipient) = &options.forward_to {
                    self.queue(Outbound::Forward {
                        to: recipient.clone(),
                        raw: msg.raw.clone(),
                    });
                }
                self.queue(Outbound::Delivery {
                    list: self.config.posting_address.clone(),
                    raw: msg.raw,
                });
                self.delete(id);
                Ok(Outcome::Approved)
            }
            Decision::Reject => {
                let msg = self.fetch_held(id).await?;
                let request = self.delete(id).ok_or(ModerationError::NotFound { id })?;
                let subject = request.subject().unwrap_or("(no subject)").to_string();
                let reason = options
                    .reason
                    .as_deref()
                    .unwrap_or(DEFAULT_REJECT_REASON);
                let recipient = if msg.sender.is_empty() {
                    request.sender
                } else {
                    msg.sender
                };
                let notice = Outbound::Notice {
                    to: recipient,
                    subject: format!("Request to mailing list {} rejected", self.name()),
                    body: format!(
                        "Your request to the {} mailing list\n\n    Posting of your message titled \"{}\"\n\n\
                         has been rejected by the list moderator.  The moderator gave the\n\
                         following reason for rejecting your request:\n\n\"{}\"\n",
                        self.name(),
                        subject,
                        reason
                    ),
                };
                self.queue(notice);
                Ok(Outcome::Rejected)
            }
            Decision::Subscribe | Decision::Unsubscribe => Err(ModerationError::InvalidDecision {
                id,
                decision,
                kind: RequestKind::HeldMessage,
            }),
        }
    }

    fn queue_rejection(&mut self, address: &str, what: &str, options: &ResolveOptions) {
        let reason = options.reason.as_deref().unwrap_or(DEFAULT_REJECT_REASON);
        let notice = Outbound::Notice {
            to: address.to_string(),
            subject: format!("Request to mailing list {} rejected", self.name()),
            body: format!(
                "Your request to the {} mailing list\n\n    {}\n\n\
                 has been rejected by the list moderator.  The moderator gave the\n\
                 following reason for rejecting your request:\n\n\"{}\"\n",
                self.name(),
                what,
                reason
            ),
        };
        self.queue(notice);
    }

    async fn resolve_subscription(
        &mut self,
        id: u64,
        decision: Decision,
        options: &ResolveOptions,
    ) -> Result<Outcome, ModerationError> {
        let (address, display_name, digest, language) = match &self.get(id)?.payload {
            RequestPayload::Subscription {
                address,
                display_name,
                digest,
                language,
                ..
            } => (
                address.clone(),
                display_name.clone(),
                *digest,
                language.clone(),
            ),
            _ => return Err(ModerationError::NotFound { id }),
        };

        match decision {
            Decision::Defer => Ok(Outcome::Deferred),
            Decision::Discard => {
                self.delete(id);
                Ok(Outcome::Discarded)
            }
            Decision::Reject => {
                self.delete(id);
                self.queue_rejection(&address, &format!("Subscription request for {address}"), options);
                Ok(Outcome::Rejected)
            }
            Decision::Approve | Decision::Subscribe => {
                if let Some(pattern) = self.policy().ban_pattern(&address) {
                    return Err(ModerationError::MembershipBanned { address, pattern });
                }
                let member = Member {
                    display_name,
                    moderated: self.config.default_member_moderation,
                    digest,
                    language,
                };
                self.add_member(&address, member)?;
                self.delete(id);
                let welcome = Outbound::Notice {
                    subject: format!("Welcome to the {} mailing list", self.name()),
                    body: format!(
                        "Your subscription to the {} mailing list has been approved.\n\n\
                         To post to this list, send your message to:\n\n    {}\n",
                        self.name(),
                        self.config.posting_address
                    ),
                    to: address,
                };
                self.queue(welcome);
                Ok(Outcome::Approved)
            }
            Decision::Unsubscribe => Err(ModerationError::InvalidDecision {
                id,
                decision,
                kind: RequestKind::Subscription,
            }),
        }
    }

    async fn resolve_unsubscription(
        &mut self,
        id: u64,
        decision: Decision,
        options: &ResolveOptions,
    ) -> Result<Outcome, ModerationError> {
        let address = match &self.get(id)?.payload {
            RequestPayload::Unsubscription { address } => address.clone(),
            _ => return Err(ModerationError::NotFound { id }),
        };

        match decision {
            Decision::Defer => Ok(Outcome::Deferred),
            Decision::Discard => {
                self.delete(id);
                Ok(Outcome::Discarded)
            }
            Decision::Reject => {
                self.delete(id);
                self.queue_rejection(
                    &address,
                    &format!("Unsubscription request for {address}"),
                    options,
                );
                Ok(Outcome::Rejected)
            }
            Decision::Approve | Decision::Unsubscribe => {
                if !self.is_member(&address) {
                    // Already gone; nothing left to approve.
                    info!(list = %self.name(), id, address = %address, "Stale unsubscription discarded");
                    self.delete(id);
                    return Ok(Outcome::Discarded);
                }
                self.remove_member(&address)?;
                self.delete(id);
                let goodbye = Outbound::Notice {
                    subject: format!("You have been unsubscribed from the {} mailing list", self.name()),
                    body: format!(
                        "Your unsubscription from the {} mailing list has been approved.\n",
                        self.name()
                    ),
                    to: address,
                };
                self.queue(goodbye);
                Ok(Outcome::Approved)
            }
            Decision::Subscribe => Err(ModerationError::InvalidDecision {
                id,
                decision,
                kind: RequestKind::Unsubscription,
            }),
        }
    }

    /// Resolve many requests. Per-id failures are recorded in the report;
    /// a fatal error stops the batch and is returned, leaving earlier work
    /// staged for the caller to commit or drop.
    pub async fn resolve_batch(
        &mut self,
        items: &[(u64, Decision, ResolveOptions)],
        discard_deferred: bool,
    ) -> Result<BatchReport, ModerationError> {
        let mut report = BatchReport::default();
        for (id, decision, options) in items {
            let decision = match decision {
                Decision::Defer if discard_deferred => Decision::Discard,
                other => *other,
            };
            let result = self.resolve(*id, decision, options).await;
            report.absorb(*id, result)?;
        }
        Ok(report)
    }

    /// Apply one decision to every pending request of `kind` from `sender`.
    /// For (un)subscriptions, duplicates for the address are discarded first
    /// and only the oldest request is resolved.
    pub async fn resolve_sender(
        &mut self,
        kind: RequestKind,
        sender: &str,
        decision: Decision,
        options: &ResolveOptions,
        discard_deferred: bool,
    ) -> Result<BatchReport, ModerationError> {
        let mut ids = self
            .group_by_sender(kind)
            .remove(&sender.to_lowercase())
            .unwrap_or_default();

        let mut duplicates = Vec::new();
        if kind != RequestKind::HeldMessage && ids.len() > 1 {
            for id in ids.split_off(1) {
                self.delete(id);
                duplicates.push(id);
            }
            info!(list = %self.name(), sender = %sender, discarded = duplicates.len(), "Duplicate requests discarded");
        }

        let items: Vec<(u64, Decision, ResolveOptions)> = ids
            .into_iter()
            .map(|id| (id, decision, options.clone()))
            .collect();
        let mut report = self.resolve_batch(&items, discard_deferred).await?;
        report.duplicates = duplicates;
        Ok(report)
    }

    /// Discard all but the oldest (un)subscription request per address.
    /// Returns the discarded ids. Held messages are never collapsed.
    pub fn collapse_duplicates(&mut self, kind: RequestKind) -> Vec<u64> {
        if kind == RequestKind::HeldMessage {
            return Vec::new();
        }
        let mut discarded = Vec::new();
        for (_, mut ids) in self.group_by_sender(kind) {
            if ids.len() > 1 {
                for id in ids.split_off(1) {
                    self.delete(id);
                    discarded.push(id);
                }
            }
        }
        if !discarded.is_empty() {
            info!(list = %self.name(), kind = %kind, discarded = discarded.len(), "Duplicate requests collapsed");
        }
        discarded
    }

    /// Load a held message for review.
    pub async fn load_message(&mut self, id: u64) -> Result<HeldMessageView, ModerationError> {
        let msg = self.fetch_held(id).await?;
        let request = self.get(id)?;
        let (subject, reason, received_time) = match &request.payload {
            RequestPayload::HeldMessage {
                subject,
                reason,
                metadata,
                ..
            } => (
                subject.clone(),
                reason.clone(),
                metadata
                    .get("received_time")
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
            ),
            _ => return Err(ModerationError::NotFound { id }),
        };
        let (excerpt, truncated) = truncate_chars(&msg.body, self.page_text_limit);

        Ok(HeldMessageView {
            id,
            sender: request.sender.clone(),
            subject,
            reason,
            received_time,
            headers: msg.headers,
            excerpt,
            truncated,
        })
    }
}
