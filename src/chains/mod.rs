//! Rule-chain processing: rules, links, chains, the registry, and the
//! engine that walks a message through them.

pub mod builtin;
pub mod chain;
pub mod link;
pub mod process;
pub mod registry;
pub mod rules;
pub mod types;

pub use chain::{Chain, LinkIter, StaticChain};
pub use link::{Link, LinkAction, LinkFunction};
pub use process::{DEFAULT_START_CHAIN, process};
pub use registry::{ChainRegistry, ChainRegistryBuilder};
pub use rules::{FnRule, Rule};
pub use types::{Disposition, InboundMessage, ListContext, MessageMetadata};
