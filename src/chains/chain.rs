//! Chains: named, ordered sequences of links.

use std::sync::Arc;

use crate::chains::link::Link;
use crate::chains::types::{InboundMessage, ListContext, MessageMetadata};

/// Owned iterator over a chain's links for one traversal.
pub type LinkIter = Box<dyn Iterator<Item = Link> + Send>;

pub trait Chain: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// A fresh link sequence for this list and message. Called each time the
    /// chain is entered.
    fn links(&self, list: &ListContext, msg: &InboundMessage, meta: &MessageMetadata)
    -> LinkIter;
}

/// A chain whose links are fixed at construction.
pub struct StaticChain {
    name: String,
    description: String,
    links: Arc<[Link]>,
}

impl StaticChain {
    pub fn new(name: impl Into<String>, description: impl Into<String>, links: Vec<Link>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            links: links.into(),
        }
    }
}

impl Chain for StaticChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
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
