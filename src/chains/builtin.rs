//! Built-in chains: the default moderation pipeline and its terminal
//! dispositions.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::chains::chain::{Chain, LinkIter, StaticChain};
use crate::chains::link::{Link, LinkFunction};
use crate::chains::registry::ChainRegistryBuilder;
use crate::chains::rules::{self, HEADER_MATCH_PREFIX, HeaderMatchRule, NonmemberFilter, Rule};
use crate::chains::types::{Disposition, InboundMessage, ListContext, MessageMetadata};
use crate::error::ChainError;
use crate::requests::manager::ListManager;
use crate::requests::model::{RequestPayload, SenderFilter};
use crate::services::Services;

pub const ACCEPT: &str = "accept";
pub const DISCARD: &str = "discard";
pub const REJECT: &str = "reject";
pub const HOLD: &str = "hold";
pub const BUILT_IN: &str = "built-in";
pub const HEADER_MATCH: &str = "header-match";

/// Human-readable reason for a rule hit, used in hold and reject notices.
pub fn reason_for(rule: &str) -> Option<&'static str> {
    let reason = match rule {
        "emergency" => "Emergency hold on all list traffic",
        "administrivia" => "Message may contain administrivia",
        "implicit-dest" => "Message has implicit destination",
        "max-recipients" => "Message has too many recipients",
        "max-size" => "Message body is too big",
        "no-subject" => "Message has no subject",
        "suspicious-header" => "Message has a suspicious header",
        "member-moderation" => "Post by a moderated member",
        "nonmember-moderation" | "hold-these-nonmembers" => {
            "Post by non-member to a members-only list"
        }
        "reject-these-nonmembers" => "Sender is on the list's reject list",
        name if name.starts_with(HEADER_MATCH_PREFIX) => "Message header matched a filter rule",
        _ => return None,
    };
    Some(reason)
}

/// Reasons derived from rule hits, deduplicated, in hit order.
pub fn reasons_from_hits(hits: &[String]) -> Vec<String> {
    let mut reasons: Vec<String> = Vec::new();
    for reason in hits.iter().filter_map(|hit| reason_for(hit)) {
        if !reasons.iter().any(|r| r == reason) {
            reasons.push(reason.to_string());
        }
    }
    reasons
}

/// Runs one function and stops.
pub struct TerminalChain {
    name: &'static str,
    description: &'static str,
    links: Arc<[Link]>,
}

impl TerminalChain {
    pub fn new(
        name: &'static str,
        description: &'static str,
        function: Arc<dyn LinkFunction>,
    ) -> Self {
        let truth: Arc<dyn Rule> = Arc::new(rules::Truth);
        Self {
            name,
            description,
            links: vec![Link::run(truth.clone(), function), Link::stop(truth)].into(),
        }
    }
}

impl Chain for TerminalChain {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn links(
        &self,
        _list: &ListContext,
        _msg: &InboundMessage,
        _meta: &MessageMetadata,
    ) -> LinkIter {
        let links = self.links.clone();
        Box::new((0..links.len()).map(move |i| links[i].clone()))
    }
}

/// One jump per header pattern configured on the list, built on entry.
pub struct HeaderMatchChain;

impl Chain for HeaderMatchChain {
    fn name(&self) -> &str {
        HEADER_MATCH
    }

    fn description(&self) -> &str {
        "Route messages by the list's header patterns"
    }

    fn links(
        &self,
        list: &ListContext,
        _msg: &InboundMessage,
        _meta: &MessageMetadata,
    ) -> LinkIter {
        let links: Vec<Link> = list
            .config
            .header_matches
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                Link::jump(
                    Arc::new(HeaderMatchRule::new(i, spec)),
                    spec.chain.as_deref().unwrap_or(HOLD),
                )
            })
            .collect();
        Box::new(links.into_iter())
    }
}

fn function_error(function: &str, reason: impl std::fmt::Display) -> ChainError {
    ChainError::Function {
        function: function.to_string(),
        reason: reason.to_string(),
    }
}

/// Delivers the message to the list.
pub struct AcceptFunction {
    services: Services,
}

#[async_trait]
impl LinkFunction for AcceptFunction {
    fn name(&self) -> &str {
        ACCEPT
    }

    async fn run(
        &self,
        list: &ListContext,
        msg: &InboundMessage,
        meta: &mut MessageMetadata,
    ) -> Result<(), ChainError> {
        self.services
            .notifier
            .deliver(&list.config.posting_address, &msg.raw)
            .await;
        meta.disposition = Some(Disposition::Accepted);
        info!(list = %list.name(), sender = %msg.sender, "Message accepted");
        Ok(())
    }
}

/// Drops the message.
pub struct DiscardFunction;

#[async_trait]
impl LinkFunction for DiscardFunction {
    fn name(&self) -> &str {
        DISCARD
    }

    async fn run(
        &self,
        list: &ListContext,
        msg: &InboundMessage,
        meta: &mut MessageMetadata,
    ) -> Result<(), ChainError> {
        meta.disposition = Some(Disposition::Discarded);
        info!(
            list = %list.name(),
            sender = %msg.sender,
            hits = ?meta.rule_hits,
            "Message discarded"
        );
        Ok(())
    }
}

/// Bounces the message back to its sender.
pub struct RejectFunction {
    services: Services,
}

#[async_trait]
impl LinkFunction for RejectFunction {
    fn name(&self) -> &str {
        REJECT
    }

    async fn run(
        &self,
        list: &ListContext,
        msg: &InboundMessage,
        meta: &mut MessageMetadata,
    ) -> Result<(), ChainError> {
        if meta.moderation_reasons.is_empty() {
            meta.moderation_reasons = reasons_from_hits(&meta.rule_hits);
        }
        meta.disposition = Some(Disposition::Rejected);
        info!(list = %list.name(), sender = %msg.sender, "Message rejected");

        if msg.sender.is_empty() {
            warn!(list = %list.name(), "Rejected message has no sender to notify");
            return Ok(());
        }
        let mut body = format!(
            "Your message to the {} mailing list was rejected.\n",
            list.name()
        );
        if !meta.moderation_reasons.is_empty() {
            body.push_str("\nReasons:\n");
            for reason in &meta.moderation_reasons {
                body.push_str(&format!("    {reason}\n"));
            }
        }
        self.services
            .notifier
            .notify(
                &msg.sender,
                &format!("Your message to {} was rejected", list.name()),
                &body,
            )
            .await;
        Ok(())
    }
}

/// Stores the message as a held request and tells the owner (and, within
/// the autoresponse allowance, the sender).
pub struct HoldFunction {
    manager: Arc<ListManager>,
}

impl HoldFunction {
    pub fn new(manager: Arc<ListManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl LinkFunction for HoldFunction {
    fn name(&self) -> &str {
        HOLD
    }

    async fn run(
        &self,
        list: &ListContext,
        msg: &InboundMessage,
        meta: &mut MessageMetadata,
    ) -> Result<(), ChainError> {
        let services = self.manager.services();
        for reason in reasons_from_hits(&meta.rule_hits) {
            if !meta.moderation_reasons.contains(&reason) {
                meta.moderation_reasons.push(reason);
            }
        }
        let reason = if meta.moderation_reasons.is_empty() {
            "N/A".to_string()
        } else {
            meta.moderation_reasons.join("; ")
        };
        let received = *meta
            .received_time
            .get_or_insert_with(|| services.clock.now());
        let subject = msg
            .subject
            .clone()
            .unwrap_or_else(|| "(no subject)".to_string());

        let mut metadata = serde_json::Map::new();
        metadata.insert("received_time".into(), received.to_rfc3339().into());
        metadata.insert(
            "rule_hits".into(),
            serde_json::Value::from(meta.rule_hits.clone()),
        );

        let mut locked = self
            .manager
            .lock(list.name())
            .await
            .map_err(|e| function_error(HOLD, e))?;
        let content_ref = services
            .content
            .store(list.name(), &msg.raw)
            .await
            .map_err(|e| function_error(HOLD, e))?;
        let id = locked.insert(
            &msg.sender,
            RequestPayload::HeldMessage {
                subject: subject.clone(),
                reason: reason.clone(),
                content_ref: content_ref.clone(),
                metadata,
            },
        );
        let respond = locked.config().respond_to_post_requests
            && !msg.sender.is_empty()
            && locked.record_autoresponse(&msg.sender);

        if let Err(e) = locked.commit().await {
            drop(locked);
            if let Err(remove_err) = services.content.remove(&content_ref).await {
                warn!(reference = %content_ref, error = %remove_err, "Failed to clean up held content");
            }
            return Err(function_error(HOLD, e));
        }
        drop(locked);

        meta.disposition = Some(Disposition::Held { id });
        info!(list = %list.name(), id, sender = %msg.sender, reason = %reason, "Message held");

        let config = &list.config;
        services
            .notifier
            .notify(
                &config.owner_address,
                &format!("{} post from {} requires approval", list.name(), msg.sender),
                &format!(
                    "As list administrator, your authorization is requested for the\n\
                     following mailing list posting:\n\n\
                     \x20   List:    {}\n\
                     \x20   From:    {}\n\
                     \x20   Subject: {}\n\
                     \x20   Reason:  {}\n\n\
                     Request id: {}\n",
                    config.posting_address, msg.sender, subject, reason, id
                ),
            )
            .await;

        if respond {
            services
                .notifier
                .notify(
                    &msg.sender,
                    &format!("Your message to {} awaits moderator approval", list.name()),
                    &format!(
                        "Your mail to '{}' with the subject\n\n    {}\n\n\
                         is being held until the list moderator can review it for approval.\n\n\
                         The reason it is being held:\n\n    {}\n",
                        list.name(),
                        subject,
                        reason
                    ),
                )
                .await;
        }
        Ok(())
    }
}

fn builtin_chain() -> StaticChain {
    let mut links = vec![
        Link::jump(Arc::new(rules::Approved), ACCEPT),
        Link::jump(Arc::new(rules::Emergency), HOLD),
        Link::jump(Arc::new(rules::Loop), DISCARD),
        Link::defer(Arc::new(rules::Administrivia)),
        Link::defer(Arc::new(rules::ImplicitDest)),
        Link::defer(Arc::new(rules::MaxRecipients)),
        Link::defer(Arc::new(rules::MaxSize)),
        Link::defer(Arc::new(rules::NoSubject)),
        Link::defer(Arc::new(rules::SuspiciousHeader)),
        Link::jump(Arc::new(rules::Any), HOLD),
        Link::jump(Arc::new(rules::MemberModeration), HOLD),
    ];
    for (filter, target) in [
        (SenderFilter::Accept, ACCEPT),
        (SenderFilter::Hold, HOLD),
        (SenderFilter::Reject, REJECT),
        (SenderFilter::Discard, DISCARD),
    ] {
        links.push(Link::jump(Arc::new(NonmemberFilter::new(filter)), target));
    }
    links.push(Link::jump(Arc::new(rules::NonmemberModeration), HOLD));
    links.push(Link::detour(Arc::new(rules::Truth), HEADER_MATCH));
    links.push(Link::jump(Arc::new(rules::Truth), ACCEPT));

    StaticChain::new(BUILT_IN, "The built-in moderation chain", links)
}

/// Register the built-in chains. Hold stores into `manager`.
pub fn register_builtin_chains(
    builder: &mut ChainRegistryBuilder,
    manager: Arc<ListManager>,
) -> Result<(), ChainError> {
    let services = manager.services().clone();
    builder.register(Arc::new(TerminalChain::new(
        ACCEPT,
        "Accept the message for delivery",
        Arc::new(AcceptFunction {
            services: services.clone(),
        }),
    )))?;
    builder.register(Arc::new(TerminalChain::new(
        DISCARD,
        "Drop the message",
        Arc::new(DiscardFunction),
    )))?;
    builder.register(Arc::new(TerminalChain::new(
        REJECT,
        "Bounce the message to its sender",
        Arc::new(RejectFunction { services }),
    )))?;
    builder.register(Arc::new(TerminalChain::new(
        HOLD,
        "Hold the message for moderator approval",
        Arc::new(HoldFunction::new(manager)),
    )))?;
    builder.register(Arc::new(builtin_chain()))?;
    builder.register(Arc::new(HeaderMatchChain))?;
    Ok(())
}
