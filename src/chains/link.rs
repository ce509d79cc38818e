//! Links bind a rule to the action taken when it matches.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::chains::rules::Rule;
use crate::chains::types::{InboundMessage, ListContext, MessageMetadata};
use crate::error::ChainError;

/// Side-effecting function run by a `Run` action.
#[async_trait]
pub trait LinkFunction: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        list: &ListContext,
        msg: &InboundMessage,
        meta: &mut MessageMetadata,
    ) -> Result<(), ChainError>;
}

/// What happens when a link's rule matches.
#[derive(Clone)]
pub enum LinkAction {
    /// Continue in another chain; never returns here.
    Jump(String),
    /// Run another chain, then resume after this link.
    Detour(String),
    /// End processing.
    Stop,
    /// Record the hit and move on.
    Defer,
    /// Run a function, then move on.
    Run(Arc<dyn LinkFunction>),
}

impl fmt::Debug for LinkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jump(chain) => f.debug_tuple("Jump").field(chain).finish(),
            Self::Detour(chain) => f.debug_tuple("Detour").field(chain).finish(),
            Self::Stop => write!(f, "Stop"),
            Self::Defer => write!(f, "Defer"),
            Self::Run(function) => f.debug_tuple("Run").field(&function.name()).finish(),
        }
    }
}

#[derive(Clone)]
pub struct Link {
    pub rule: Arc<dyn Rule>,
    pub action: LinkAction,
}

impl Link {
    pub fn new(rule: Arc<dyn Rule>, action: LinkAction) -> Self {
        Self { rule, action }
    }

    pub fn jump(rule: Arc<dyn Rule>, chain: &str) -> Self {
        Self::new(rule, LinkAction::Jump(chain.to_string()))
    }

    pub fn detour(rule: Arc<dyn Rule>, chain: &str) -> Self {
        Self::new(rule, LinkAction::Detour(chain.to_string()))
    }

    pub fn stop(rule: Arc<dyn Rule>) -> Self {
        Self::new(rule, LinkAction::Stop)
    }

    pub fn defer(rule: Arc<dyn Rule>) -> Self {
        Self::new(rule, LinkAction::Defer)
    }

    pub fn run(rule: Arc<dyn Rule>, function: Arc<dyn LinkFunction>) -> Self {
        Self::new(rule, LinkAction::Run(function))
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("rule", &self.rule.name())
            .field("action", &self.action)
            .finish()
    }
}
