//! Chain processing engine.
//!
//! Walks a message through the chain graph with an explicit stack of
//! suspended (chain, link iterator) frames, so deep detour nesting never
//! grows the call stack.

use std::sync::Arc;

use tracing::debug;

use crate::chains::chain::{Chain, LinkIter};
use crate::chains::link::LinkAction;
use crate::chains::registry::ChainRegistry;
use crate::chains::types::{InboundMessage, ListContext, MessageMetadata};
use crate::error::ChainError;

/// Chain every message enters first unless the caller names another.
pub const DEFAULT_START_CHAIN: &str = "built-in";

/// Run `msg` through `start_chain`.
///
/// Hits and misses of recorded rules are written to `meta`; a rule name
/// lands in at most one of the two lists. On error, whatever was gathered
/// before the failure stays in `meta`.
pub async fn process(
    registry: &ChainRegistry,
    list: &ListContext,
    msg: &InboundMessage,
    meta: &mut MessageMetadata,
    start_chain: &str,
) -> Result<(), ChainError> {
    meta.rule_hits.clear();
    meta.rule_misses.clear();

    let mut chain: Arc<dyn Chain> = registry.resolve(start_chain)?;
    debug!(list = %list.name(), chain = %chain.name(), "Entering chain");
    let mut links: LinkIter = chain.links(list, msg, meta);
    let mut stack: Vec<(Arc<dyn Chain>, LinkIter)> = Vec::new();

    loop {
        let Some(link) = links.next() else {
            match stack.pop() {
                Some((suspended, rest)) => {
                    debug!(list = %list.name(), chain = %suspended.name(), "Resuming chain");
                    chain = suspended;
                    links = rest;
                    continue;
                }
                None => break,
            }
        };

        let rule = &link.rule;
        let name = rule.name();
        if !rule.check(list, msg, meta) {
            if rule.record()
                && !meta.rule_hits.iter().any(|n| n == name)
                && !meta.rule_misses.iter().any(|n| n == name)
            {
                meta.rule_misses.push(name.to_string());
            }
            continue;
        }

        if rule.record() {
            meta.rule_misses.retain(|n| n != name);
            if !meta.rule_hits.iter().any(|n| n == name) {
                meta.rule_hits.push(name.to_string());
            }
        }
        debug!(
            list = %list.name(),
            chain = %chain.name(),
            rule = %name,
            action = ?link.action,
            "Rule hit"
        );

        match &link.action {
            LinkAction::Jump(target) => {
                chain = registry.resolve(target)?;
                debug!(list = %list.name(), chain = %chain.name(), "Jumping to chain");
                links = chain.links(list, msg, meta);
            }
            LinkAction::Detour(target) => {
                let next = registry.resolve(target)?;
                debug!(list = %list.name(), chain = %next.name(), "Detouring to chain");
                let next_links = next.links(list, msg, meta);
                let suspended = std::mem::replace(&mut chain, next);
                let rest = std::mem::replace(&mut links, next_links);
                stack.push((suspended, rest));
            }
            LinkAction::Stop => {
                stack.clear();
                break;
            }
            LinkAction::Defer => {}
            LinkAction::Run(function) => {
                function.run(list, msg, meta).await?;
            }
        }
    }

    debug!(
        list = %list.name(),
        hits = ?meta.rule_hits,
        misses = ?meta.rule_misses,
        "Processing complete"
    );
    Ok(())
}
