//! libSQL backend: async `RequestDatabase` implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared; commits are serialized so only one transaction is open at a time.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::requests::model::{
    AutoResponse, HeldRequest, ListPolicy, Member, RequestKind, RequestPayload, SenderFilter,
};
use crate::store::migrations;
use crate::store::traits::{ChangeSet, ListState, RequestDatabase};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn load_requests(
        &self,
        list: &str,
    ) -> Result<BTreeMap<u64, HeldRequest>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, kind, sender, created_at, payload FROM requests
                 WHERE list = ?1 ORDER BY id",
                params![list],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load requests: {e}")))?;

        let mut requests = BTreeMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load requests: {e}")))?
        {
            let request = row_to_request(&row)?;
            requests.insert(request.id, request);
        }
        Ok(requests)
    }

    async fn load_policy(&self, list: &str) -> Result<ListPolicy, DatabaseError> {
        let conn = self.conn();
        let mut policy = ListPolicy::default();

        let mut rows = conn
            .query(
                "SELECT pattern FROM ban_list WHERE list = ?1 ORDER BY position",
                params![list],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load ban list: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load ban list: {e}")))?
        {
            policy.ban_list.push(get_string(&row, 0)?);
        }

        let mut rows = conn
            .query(
                "SELECT filter, pattern FROM sender_filters WHERE list = ?1
                 ORDER BY filter, position",
                params![list],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load sender filters: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load sender filters: {e}")))?
        {
            let filter: SenderFilter = get_string(&row, 0)?
                .parse()
                .map_err(DatabaseError::Serialization)?;
            policy.filter_list_mut(filter).push(get_string(&row, 1)?);
        }

        let mut rows = conn
            .query(
                "SELECT address, display_name, moderated, digest, language FROM members
                 WHERE list = ?1",
                params![list],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load members: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load members: {e}")))?
        {
            policy.members.insert(
                get_string(&row, 0)?,
                Member {
                    display_name: get_string(&row, 1)?,
                    moderated: get_i64(&row, 2)? != 0,
                    digest: get_i64(&row, 3)? != 0,
                    language: get_string(&row, 4)?,
                },
            );
        }

        let mut rows = conn
            .query(
                "SELECT sender, last_response, count FROM autoresponses WHERE list = ?1",
                params![list],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load autoresponses: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load autoresponses: {e}")))?
        {
            policy.autoresponses.insert(
                get_string(&row, 0)?,
                AutoResponse {
                    last_response: parse_datetime(&get_string(&row, 1)?),
                    count: get_i64(&row, 2)?.max(0) as u32,
                },
            );
        }

        Ok(policy)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn get_string(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("read column {idx}: {e}")))
}

fn get_i64(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("read column {idx}: {e}")))
}

/// Request payload as stored in the `payload` column.
///
/// The subscription password is exposed only here, at the persistence
/// boundary.
#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum PayloadRaw {
    HeldMessage {
        subject: String,
        reason: String,
        content_ref: String,
        #[serde(default)]
        metadata: serde_json::Map<String, serde_json::Value>,
    },
    Subscription {
        address: String,
        #[serde(default)]
        display_name: String,
        #[serde(default)]
        password: String,
        #[serde(default)]
        digest: bool,
        #[serde(default = "default_language")]
        language: String,
    },
    Unsubscription {
        address: String,
    },
}

fn default_language() -> String {
    "en".into()
}

impl From<&RequestPayload> for PayloadRaw {
    fn from(payload: &RequestPayload) -> Self {
        match payload {
            RequestPayload::HeldMessage {
                subject,
                reason,
                content_ref,
                metadata,
            } => Self::HeldMessage {
                subject: subject.clone(),
                reason: reason.clone(),
                content_ref: content_ref.clone(),
                metadata: metadata.clone(),
            },
            RequestPayload::Subscription {
                address,
                display_name,
                password,
                digest,
                language,
            } => Self::Subscription {
                address: address.clone(),
                display_name: display_name.clone(),
                password: password.expose_secret().to_string(),
                digest: *digest,
                language: language.clone(),
            },
            RequestPayload::Unsubscription { address } => Self::Unsubscription {
                address: address.clone(),
            },
        }
    }
}

impl From<PayloadRaw> for RequestPayload {
    fn from(raw: PayloadRaw) -> Self {
        match raw {
            PayloadRaw::HeldMessage {
                subject,
                reason,
                content_ref,
                metadata,
            } => Self::HeldMessage {
                subject,
                reason,
                content_ref,
                metadata,
            },
            PayloadRaw::Subscription {
                address,
                display_name,
                password,
                digest,
                language,
            } => Self::Subscription {
                address,
                display_name,
                password: SecretString::from(password),
                digest,
                language,
            },
            PayloadRaw::Unsubscription { address } => Self::Unsubscription { address },
        }
    }
}

fn row_to_request(row: &libsql::Row) -> Result<HeldRequest, DatabaseError> {
    let id = get_i64(row, 0)?;
    let kind_str = get_string(row, 1)?;
    let sender = get_string(row, 2)?;
    let created_str = get_string(row, 3)?;
    let payload_str = get_string(row, 4)?;

    let kind: RequestKind = kind_str.parse().map_err(DatabaseError::Serialization)?;
    let raw: PayloadRaw = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("request {id} payload: {e}")))?;
    let payload = RequestPayload::from(raw);
    if payload.kind() != kind {
        return Err(DatabaseError::Serialization(format!(
            "request {id} is stored as {kind} but its payload is {}",
            payload.kind()
        )));
    }

    Ok(HeldRequest {
        id: id as u64,
        created_at: parse_datetime(&created_str),
        sender,
        payload,
    })
}

async fn write_changes(
    tx: &Transaction,
    list: &str,
    changes: &ChangeSet<'_>,
) -> Result<(), DatabaseError> {
    tx.execute(
        "INSERT INTO lists (name, next_request_id) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET next_request_id = excluded.next_request_id",
        params![list, changes.next_id as i64],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("update list row: {e}")))?;

    for id in &changes.deleted {
        tx.execute(
            "DELETE FROM requests WHERE list = ?1 AND id = ?2",
            params![list, *id as i64],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("delete request {id}: {e}")))?;
    }

    for request in &changes.inserted {
        let payload = serde_json::to_string(&PayloadRaw::from(&request.payload))
            .map_err(|e| DatabaseError::Serialization(format!("request {}: {e}", request.id)))?;
        tx.execute(
            "INSERT INTO requests (list, id, kind, sender, created_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                list,
                request.id as i64,
                request.kind().to_string(),
                request.sender.as_str(),
                request.created_at.to_rfc3339(),
                payload
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert request {}: {e}", request.id)))?;
    }

    if let Some(policy) = changes.policy {
        write_policy(tx, list, policy).await?;
    }
    Ok(())
}

async fn write_policy(tx: &Transaction, list: &str, policy: &ListPolicy) -> Result<(), DatabaseError> {
    for table in ["ban_list", "sender_filters", "members", "autoresponses"] {
        tx.execute(&format!("DELETE FROM {table} WHERE list = ?1"), params![list])
            .await
            .map_err(|e| DatabaseError::Query(format!("clear {table}: {e}")))?;
    }

    for (position, pattern) in policy.ban_list.iter().enumerate() {
        tx.execute(
            "INSERT INTO ban_list (list, position, pattern) VALUES (?1, ?2, ?3)",
            params![list, position as i64, pattern.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert ban entry: {e}")))?;
    }

    for filter in SenderFilter::ALL {
        for (position, pattern) in policy.filter_list(filter).iter().enumerate() {
            tx.execute(
                "INSERT INTO sender_filters (list, filter, position, pattern)
                 VALUES (?1, ?2, ?3, ?4)",
                params![list, filter.as_str(), position as i64, pattern.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert sender filter: {e}")))?;
        }
    }

    for (address, member) in &policy.members {
        tx.execute(
            "INSERT INTO members (list, address, display_name, moderated, digest, language)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                list,
                address.as_str(),
                member.display_name.as_str(),
                member.moderated as i64,
                member.digest as i64,
                member.language.as_str()
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert member {address}: {e}")))?;
    }

    for (sender, entry) in &policy.autoresponses {
        tx.execute(
            "INSERT INTO autoresponses (list, sender, last_response, count)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                list,
                sender.as_str(),
                entry.last_response.to_rfc3339(),
                entry.count as i64
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert autoresponse: {e}")))?;
    }
    Ok(())
}

#[async_trait]
impl RequestDatabase for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn load_list(&self, list: &str) -> Result<ListState, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT next_request_id FROM lists WHERE name = ?1",
                params![list],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load list {list}: {e}")))?;
        let next_id = match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load list {list}: {e}")))?
        {
            Some(row) => get_i64(&row, 0)?.max(1) as u64,
            None => 1,
        };

        let requests = self.load_requests(list).await?;
        let policy = self.load_policy(list).await?;
        debug!(list = %list, next_id, pending = requests.len(), "Loaded list state");

        Ok(ListState {
            next_id,
            requests,
            policy,
        })
    }

    async fn commit_list(&self, list: &str, changes: &ChangeSet<'_>) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin transaction: {e}")))?;

        if let Err(e) = write_changes(&tx, list, changes).await {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(list = %list, error = %rollback_err, "Rollback failed");
            }
            return Err(e);
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit transaction: {e}")))?;

        debug!(
            list = %list,
            inserted = changes.inserted.len(),
            deleted = changes.deleted.len(),
            policy = changes.policy.is_some(),
            "Committed list changes"
        );
        Ok(())
    }

    async fn list_names(&self) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT name FROM lists ORDER BY name", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list names: {e}")))?;

        let mut names = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list names: {e}")))?
        {
            names.push(get_string(&row, 0)?);
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(id: u64, sender: &str) -> HeldRequest {
        let mut metadata = serde_json::Map::new();
        metadata.insert("received_time".into(), serde_json::json!("2026-03-01T10:00:00Z"));
        HeldRequest {
            id,
            created_at: Utc::now(),
            sender: sender.into(),
            payload: RequestPayload::HeldMessage {
                subject: "hello".into(),
                reason: "Post by non-member to a members-only list".into(),
                content_ref: format!("ref-{id}"),
                metadata,
            },
        }
    }

    fn subscription(id: u64, address: &str) -> HeldRequest {
        HeldRequest {
            id,
            created_at: Utc::now(),
            sender: address.into(),
            payload: RequestPayload::Subscription {
                address: address.into(),
                display_name: "Carol".into(),
                password: SecretString::from("hunter2".to_string()),
                digest: true,
                language: "de".into(),
            },
        }
    }

    #[tokio::test]
    async fn unknown_list_loads_empty() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let state = db.load_list("nobody").await.unwrap();
        assert_eq!(state.next_id, 1);
        assert!(state.requests.is_empty());
        assert_eq!(state.policy, ListPolicy::default());
    }

    #[tokio::test]
    async fn commit_then_reload() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let a = held(1, "alice@example.com");
        let b = subscription(2, "carol@example.com");

        db.commit_list(
            "devel",
            &ChangeSet {
                next_id: 3,
                inserted: vec![&a, &b],
                deleted: vec![],
                policy: None,
            },
        )
        .await
        .unwrap();

        let state = db.load_list("devel").await.unwrap();
        assert_eq!(state.next_id, 3);
        assert_eq!(state.requests.len(), 2);
        assert_eq!(state.requests[&1].sender, "alice@example.com");
        match &state.requests[&2].payload {
            RequestPayload::Subscription {
                password,
                digest,
                language,
                ..
            } => {
                assert_eq!(password.expose_secret(), "hunter2");
                assert!(*digest);
                assert_eq!(language, "de");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        match &state.requests[&1].payload {
            RequestPayload::HeldMessage { metadata, .. } => {
                assert!(metadata.contains_key("received_time"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        db.commit_list(
            "devel",
            &ChangeSet {
                next_id: 3,
                inserted: vec![],
                deleted: vec![1],
                policy: None,
            },
        )
        .await
        .unwrap();
        let state = db.load_list("devel").await.unwrap();
        assert_eq!(state.requests.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(db.list_names().await.unwrap(), vec!["devel".to_string()]);
    }

    #[tokio::test]
    async fn policy_roundtrip() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut policy = ListPolicy::default();
        policy.ban_list = vec!["b@example.com".into(), "^.*@spam\\.org$".into()];
        policy
            .filter_list_mut(SenderFilter::Hold)
            .push("h@example.com".into());
        let mut member = Member::new("Alice");
        member.moderated = true;
        policy.members.insert("alice@example.com".into(), member);
        policy.autoresponses.insert(
            "bob@example.com".into(),
            AutoResponse {
                last_response: parse_datetime("2026-03-01T10:00:00Z"),
                count: 2,
            },
        );

        db.commit_list(
            "devel",
            &ChangeSet {
                next_id: 1,
                inserted: vec![],
                deleted: vec![],
                policy: Some(&policy),
            },
        )
        .await
        .unwrap();

        let state = db.load_list("devel").await.unwrap();
        assert_eq!(state.policy, policy);
    }

    #[tokio::test]
    async fn failed_commit_rolls_back() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let a = held(1, "alice@example.com");
        let dup = held(1, "mallory@example.com");

        // Second insert violates the primary key; nothing from this change set lands.
        let result = db
            .commit_list(
                "devel",
                &ChangeSet {
                    next_id: 2,
                    inserted: vec![&a, &dup],
                    deleted: vec![],
                    policy: None,
                },
            )
            .await;
        assert!(result.is_err());

        let state = db.load_list("devel").await.unwrap();
        assert!(state.requests.is_empty());
        assert_eq!(state.next_id, 1);
    }

    #[test]
    fn parses_sqlite_datetimes() {
        let dt = parse_datetime("2026-03-01 10:00:00");
        assert_eq!(dt.to_rfc3339(), "2026-03-01T10:00:00+00:00");
        assert_eq!(parse_datetime("garbage"), DateTime::<Utc>::MIN_UTC);
    }
}
