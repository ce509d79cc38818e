//! Persistence layer: libSQL-backed storage for held requests and list policy.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ChangeSet, ListState, RequestDatabase};
