//! Error types for list moderation.

use crate::requests::model::{Decision, RequestKind};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Moderation error: {0}")]
    Moderation(#[from] ModerationError),

    #[error("Content error: {0}")]
    Content(#[from] ContentError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration {path}: {reason}")]
    ParseError { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Chain registry and traversal errors. All of these are fatal for the
/// traversal that raised them.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Duplicate chain name: {name}")]
    DuplicateChain { name: String },

    #[error("No chain named {name}")]
    UnknownChain { name: String },

    #[error("A process-wide chain registry is already installed")]
    RegistryInstalled,

    #[error("Link function {function} failed: {reason}")]
    Function { function: String, reason: String },
}

/// Held-content accessor errors.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("Held content {reference} not found")]
    NotFound { reference: String },

    #[error("Held content {reference} is unreadable: {reason}")]
    Unreadable { reference: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the caller of a resolution is expected to treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Someone else already resolved the item. Skip silently.
    Benign,
    /// Held content is lost or corrupt; the record was discarded.
    DataIntegrity,
    /// The decision violates list policy; the record was left in place.
    Policy,
    /// Abort the current operation.
    Fatal,
}

/// Held-item store and resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ModerationError {
    #[error("Request {id} not found")]
    NotFound { id: u64 },

    #[error("{address} is already a member")]
    AlreadyMember { address: String },

    #[error("{address} is banned by pattern {pattern}")]
    MembershipBanned { address: String, pattern: String },

    #[error("{address} is not a member")]
    NotAMember { address: String },

    #[error("Held message {id} was lost")]
    LostItem { id: u64 },

    #[error("Held message {id} is corrupted: {reason}")]
    CorruptItem { id: u64, reason: String },

    #[error("Decision {decision} does not apply to {kind} request {id}")]
    InvalidDecision {
        id: u64,
        decision: Decision,
        kind: RequestKind,
    },

    #[error("No list named {name}")]
    UnknownList { name: String },

    #[error("Could not lock list {list}: {reason}")]
    Lock { list: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Content error: {0}")]
    Content(#[from] ContentError),
}

impl ModerationError {
    /// Classify this error for batch handling.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } | Self::NotAMember { .. } => ErrorClass::Benign,
            Self::LostItem { .. } | Self::CorruptItem { .. } => ErrorClass::DataIntegrity,
            Self::AlreadyMember { .. }
            | Self::MembershipBanned { .. }
            | Self::InvalidDecision { .. } => ErrorClass::Policy,
            Self::UnknownList { .. }
            | Self::Lock { .. }
            | Self::Database(_)
            | Self::Content(_) => ErrorClass::Fatal,
        }
    }

    /// Whether this error must abort the surrounding batch.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
