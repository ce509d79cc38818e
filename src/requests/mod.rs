//! Held requests: the per-list store and the resolution protocol.

pub mod manager;
pub mod model;
pub mod resolve;

#[cfg(test)]
pub(crate) mod test_support;

pub use manager::{ListManager, LockedList};
pub use model::{
    Decision, HeldRequest, ListPolicy, Member, Outcome, RequestKind, RequestPayload,
    ResolveOptions, SenderFilter,
};
pub use resolve::{BatchReport, HeldMessageView};
