//! `RequestDatabase` trait: the async persistence interface for held
//! requests and list policy.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::requests::model::{HeldRequest, ListPolicy};

/// Everything persisted for one list, loaded when its lock is taken.
#[derive(Debug, Default)]
pub struct ListState {
    /// Next id to hand out. Ids are never reused.
    pub next_id: u64,
    pub requests: BTreeMap<u64, HeldRequest>,
    pub policy: ListPolicy,
}

/// Staged mutations for one list, written in a single transaction.
#[derive(Debug)]
pub struct ChangeSet<'a> {
    pub next_id: u64,
    pub inserted: Vec<&'a HeldRequest>,
    pub deleted: Vec<u64>,
    /// Full replacement of the policy tables, when policy changed.
    pub policy: Option<&'a ListPolicy>,
}

impl ChangeSet<'_> {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty() && self.policy.is_none()
    }
}

/// Backend-agnostic persistence for held requests.
#[async_trait]
pub trait RequestDatabase: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Load the full state of a list. Unknown lists load empty, with ids
    /// starting at 1.
    async fn load_list(&self, list: &str) -> Result<ListState, DatabaseError>;

    /// Apply staged changes atomically.
    async fn commit_list(&self, list: &str, changes: &ChangeSet<'_>) -> Result<(), DatabaseError>;

    /// Names of lists with persisted state.
    async fn list_names(&self) -> Result<Vec<String>, DatabaseError>;
}
