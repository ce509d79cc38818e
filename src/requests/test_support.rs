//! Shared fixtures for unit tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::ListConfig;
use crate::requests::manager::ListManager;
use crate::services::{FixedClock, MemoryContentStore, RecordingNotifier, Services};
use crate::store::LibSqlBackend;

pub(crate) struct Harness {
    pub manager: ListManager,
    pub clock: Arc<FixedClock>,
    pub content: Arc<MemoryContentStore>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    /// In-memory database, memory content store, recording notifier, and a
    /// clock fixed at 2026-03-10T12:00:00Z.
    pub async fn new(lists: Vec<ListConfig>) -> Self {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let clock = Arc::new(FixedClock::new(
            DateTime::parse_from_rfc3339("2026-03-10T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        ));
        let content = Arc::new(MemoryContentStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let services = Services::new(content.clone(), notifier.clone(), clock.clone());
        Self {
            manager: ListManager::new(db, services, lists, 0),
            clock,
            content,
            notifier,
        }
    }

    pub async fn devel() -> Self {
        Self::new(vec![ListConfig::new("devel", "example.com")]).await
    }
}

pub(crate) const SAMPLE_MESSAGE: &[u8] = b"From: Bob <bob@example.com>\r\n\
To: devel@example.com\r\n\
Subject: hello\r\n\
Message-ID: <1@example.com>\r\n\
\r\n\
Hi all,\r\n\
just saying hello.\r\n";
