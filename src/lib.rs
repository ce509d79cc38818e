//! List moderation: rule chains for inbound posts, a held-request store with
//! moderator resolution, and the periodic eviction sweep.

pub mod chains;
pub mod config;
pub mod error;
pub mod requests;
pub mod services;
pub mod store;
pub mod sweep;

pub use error::{Error, ModerationError, Result};
pub use requests::{ListManager, LockedList};
