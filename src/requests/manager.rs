//! Per-list locking and the staged held-request store.
//!
//! Every read or write of a list's requests goes through a [`LockedList`],
//! obtained from [`ListManager::lock`]. The handle owns the list's async
//! mutex guard and, when a lock directory is configured, an exclusive lock
//! file shared with other processes using the same directory. Both are
//! released on every exit path. Mutations are staged in memory and written
//! in one transaction by [`LockedList::commit`]; dropping the handle without
//! committing throws them away, along with any mail queued by resolutions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::chains::types::ListContext;
use crate::config::ListConfig;
use crate::error::ModerationError;
use crate::requests::model::{
    AutoResponse, HeldRequest, ListPolicy, Member, RequestKind, RequestPayload, SenderFilter,
};
use crate::services::Services;
use crate::store::{ChangeSet, ListState, RequestDatabase};

/// How often a contended lock file is retried.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct ListEntry {
    config: Arc<ListConfig>,
    lock: Arc<Mutex<()>>,
}

/// Owns the configured lists and hands out locked handles to them.
pub struct ListManager {
    db: Arc<dyn RequestDatabase>,
    services: Services,
    lists: HashMap<String, ListEntry>,
    page_text_limit: usize,
    lock_dir: Option<PathBuf>,
}

impl ListManager {
    pub fn new(
        db: Arc<dyn RequestDatabase>,
        services: Services,
        lists: Vec<ListConfig>,
        page_text_limit: usize,
    ) -> Self {
        let lists = lists
            .into_iter()
            .map(|config| {
                (
                    config.name.clone(),
                    ListEntry {
                        config: Arc::new(config),
                        lock: Arc::new(Mutex::new(())),
                    },
                )
            })
            .collect();
        Self {
            db,
            services,
            lists,
            page_text_limit,
            lock_dir: None,
        }
    }

    /// Also take a per-list lock file under `dir`, so that every process
    /// sharing the database and this directory excludes the others.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    fn entry(&self, name: &str) -> Result<&ListEntry, ModerationError> {
        self.lists
            .get(name)
            .ok_or_else(|| ModerationError::UnknownList {
                name: name.to_string(),
            })
    }

    /// Acquire the list's lock and load its current state.
    pub async fn lock(&self, name: &str) -> Result<LockedList, ModerationError> {
        let entry = self.entry(name)?;
        let guard = entry.lock.clone().lock_owned().await;
        let file_lock = match &self.lock_dir {
            Some(dir) => Some(lock_file(dir, name).await?),
            None => None,
        };
        // Loaded only once both locks are held.
        let state = self.db.load_list(name).await?;
        debug!(list = %name, pending = state.requests.len(), "List locked");

        Ok(LockedList {
            _file_lock: file_lock,
            _guard: guard,
            config: entry.config.clone(),
            state,
            inserted: BTreeSet::new(),
            deleted: BTreeSet::new(),
            policy_dirty: false,
            content_removals: Vec::new(),
            outbox: Vec::new(),
            db: self.db.clone(),
            services: self.services.clone(),
            page_text_limit: self.page_text_limit,
        })
    }

    /// Snapshot of a list's configuration and policy for rule evaluation.
    pub async fn context(&self, name: &str) -> Result<ListContext, ModerationError> {
        let locked = self.lock(name).await?;
        Ok(ListContext {
            config: locked.config.clone(),
            policy: locked.state.policy.clone(),
        })
    }

    pub fn config(&self, name: &str) -> Option<Arc<ListConfig>> {
        self.lists.get(name).map(|e| e.config.clone())
    }

    /// Configured list names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lists.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn services(&self) -> &Services {
        &self.services
    }
}

/// Open `{dir}/{list}.lock` and take an exclusive lock on it, waiting while
/// another holder has it. Closing the file releases the lock.
async fn lock_file(dir: &Path, name: &str) -> Result<File, ModerationError> {
    let lock_error = |e: std::io::Error| ModerationError::Lock {
        list: name.to_string(),
        reason: e.to_string(),
    };
    std::fs::create_dir_all(dir).map_err(lock_error)?;
    let path = dir.join(format!("{}.lock", name.replace(['/', '\\'], "_")));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(lock_error)?;

    let mut waiting = false;
    loop {
        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => return Ok(file),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                if !waiting {
                    debug!(list = %name, path = %path.display(), "List locked elsewhere, waiting");
                    waiting = true;
                }
                tokio::time::sleep(LOCK_POLL_INTERVAL).await;
            }
            Err(e) => return Err(lock_error(e)),
        }
    }
}

/// Mail produced by a resolution. Held back until the outcome is committed.
#[derive(Debug)]
pub(crate) enum Outbound {
    Notice {
        to: String,
        subject: String,
        body: String,
    },
    Delivery {
        list: String,
        raw: Vec<u8>,
    },
    Forward {
        to: String,
        raw: Vec<u8>,
    },
}

async fn send_outbound(services: &Services, outbox: Vec<Outbound>) {
    for item in outbox {
        match item {
            Outbound::Notice { to, subject, body } => {
                services.notifier.notify(&to, &subject, &body).await
            }
            Outbound::Delivery { list, raw } => services.notifier.deliver(&list, &raw).await,
            Outbound::Forward { to, raw } => services.notifier.forward(&to, &raw).await,
        }
    }
}

/// Exclusive handle on one list's held requests and policy.
pub struct LockedList {
    _file_lock: Option<File>,
    _guard: OwnedMutexGuard<()>,
    pub(crate) config: Arc<ListConfig>,
    pub(crate) state: ListState,
    inserted: BTreeSet<u64>,
    deleted: BTreeSet<u64>,
    policy_dirty: bool,
    content_removals: Vec<String>,
    outbox: Vec<Outbound>,
    db: Arc<dyn RequestDatabase>,
    pub(crate) services: Services,
    pub(crate) page_text_limit: usize,
}

impl LockedList {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ListConfig {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Add a new request, returning its id.
    pub fn insert(&mut self, sender: &str, payload: RequestPayload) -> u64 {
        let id = self.state.next_id;
        self.state.next_id += 1;
        let kind = payload.kind();
        self.state.requests.insert(
            id,
            HeldRequest {
                id,
                created_at: self.services.clock.now(),
                sender: sender.to_string(),
                payload,
            },
        );
        self.inserted.insert(id);
        debug!(list = %self.config.name, id, kind = %kind, sender = %sender, "Request staged");
        id
    }

    pub fn get(&self, id: u64) -> Result<&HeldRequest, ModerationError> {
        self.state
            .requests
            .get(&id)
            .ok_or(ModerationError::NotFound { id })
    }

    /// Ids of pending requests of `kind`, ascending.
    pub fn list_of_kind(&self, kind: RequestKind) -> Vec<u64> {
        self.state
            .requests
            .values()
            .filter(|r| r.kind() == kind)
            .map(|r| r.id)
            .collect()
    }

    pub fn count_of(&self, kind: RequestKind) -> usize {
        self.state
            .requests
            .values()
            .filter(|r| r.kind() == kind)
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.state.requests.len()
    }

    /// Pending requests of `kind` grouped by sender (or by subject address
    /// for subscriptions and unsubscriptions).
    pub fn group_by_sender(&self, kind: RequestKind) -> BTreeMap<String, Vec<u64>> {
        let mut groups: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for request in self.state.requests.values().filter(|r| r.kind() == kind) {
            groups.entry(request.group_key()).or_default().push(request.id);
        }
        groups
    }

    /// Remove a request from the staged state.
    pub(crate) fn delete(&mut self, id: u64) -> Option<HeldRequest> {
        let request = self.state.requests.remove(&id)?;
        if !self.inserted.remove(&id) {
            self.deleted.insert(id);
        }
        if let RequestPayload::HeldMessage { content_ref, .. } = &request.payload {
            self.content_removals.push(content_ref.clone());
        }
        Some(request)
    }

    pub fn policy(&self) -> &ListPolicy {
        &self.state.policy
    }

    /// Add an address to the ban list. Returns false if it was already there.
    pub fn ban(&mut self, address: &str) -> bool {
        let policy = &mut self.state.policy;
        if policy
            .ban_list
            .iter()
            .any(|entry| entry.eq_ignore_ascii_case(address))
        {
            return false;
        }
        policy.ban_list.push(address.to_lowercase());
        self.policy_dirty = true;
        info!(list = %self.config.name, address = %address, "Address banned");
        true
    }

    /// Append a sender to a nonmember filter list.
    pub fn add_sender_filter(&mut self, filter: SenderFilter, sender: &str) -> bool {
        let entries = self.state.policy.filter_list_mut(filter);
        if entries.iter().any(|entry| entry.eq_ignore_ascii_case(sender)) {
            return false;
        }
        entries.push(sender.to_lowercase());
        self.policy_dirty = true;
        info!(
            list = %self.config.name,
            sender = %sender,
            filter = filter.as_str(),
            "Sender added to filter list"
        );
        true
    }

    /// Clear a member's moderation flag.
    pub fn clear_moderation(&mut self, address: &str) -> Result<(), ModerationError> {
        let member = self
            .state
            .policy
            .members
            .get_mut(&address.to_lowercase())
            .ok_or_else(|| ModerationError::NotAMember {
                address: address.to_string(),
            })?;
        if member.moderated {
            member.moderated = false;
            self.policy_dirty = true;
        }
        Ok(())
    }

    pub fn add_member(&mut self, address: &str, member: Member) -> Result<(), ModerationError> {
        let key = address.to_lowercase();
        if self.state.policy.members.contains_key(&key) {
            return Err(ModerationError::AlreadyMember {
                address: address.to_string(),
            });
        }
        self.state.policy.members.insert(key, member);
        self.policy_dirty = true;
        Ok(())
    }

    pub fn remove_member(&mut self, address: &str) -> Result<Member, ModerationError> {
        let member = self
            .state
            .policy
            .members
            .remove(&address.to_lowercase())
            .ok_or_else(|| ModerationError::NotAMember {
                address: address.to_string(),
            })?;
        self.policy_dirty = true;
        Ok(member)
    }

    pub fn is_member(&self, address: &str) -> bool {
        self.state.policy.is_member(address)
    }

    /// Count an autoresponse to `sender`. Returns false when the sender has
    /// already had the day's allowance.
    pub fn record_autoresponse(&mut self, sender: &str) -> bool {
        let now = self.services.clock.now();
        let today = self.services.clock.midnight(now);
        let max = self.config.max_autoresponses_per_day;

        let entry = self
            .state
            .policy
            .autoresponses
            .entry(sender.to_lowercase())
            .or_insert(AutoResponse {
                last_response: now,
                count: 0,
            });
        if entry.last_response < today {
            entry.count = 0;
        }
        if max > 0 && entry.count >= max {
            debug!(list = %self.config.name, sender = %sender, "Autoresponse limit reached");
            return false;
        }
        entry.count += 1;
        entry.last_response = now;
        self.policy_dirty = true;
        true
    }

    /// Drop autoresponse entries last touched before `midnight`.
    pub fn evict_autoresponses(&mut self, midnight: DateTime<Utc>) -> usize {
        let before = self.state.policy.autoresponses.len();
        self.state
            .policy
            .autoresponses
            .retain(|_, entry| entry.last_response >= midnight);
        let evicted = before - self.state.policy.autoresponses.len();
        if evicted > 0 {
            self.policy_dirty = true;
        }
        evicted
    }

    pub fn has_changes(&self) -> bool {
        !self.inserted.is_empty() || !self.deleted.is_empty() || self.policy_dirty
    }

    /// Queue mail to go out once the current changes are committed.
    pub(crate) fn queue(&mut self, item: Outbound) {
        self.outbox.push(item);
    }

    /// Number of queued, unsent mails.
    pub fn queued_mail(&self) -> usize {
        self.outbox.len()
    }

    /// Write staged changes in one transaction, then remove content of
    /// deleted held messages.
    async fn write_staged(&mut self) -> Result<(), ModerationError> {
        if self.has_changes() {
            let changes = ChangeSet {
                next_id: self.state.next_id,
                inserted: self
                    .inserted
                    .iter()
                    .filter_map(|id| self.state.requests.get(id))
                    .collect(),
                deleted: self.deleted.iter().copied().collect(),
                policy: self.policy_dirty.then_some(&self.state.policy),
            };
            self.db.commit_list(&self.config.name, &changes).await?;

            info!(
                list = %self.config.name,
                inserted = changes.inserted.len(),
                deleted = changes.deleted.len(),
                policy = changes.policy.is_some(),
                "List committed"
            );
            drop(changes);

            self.inserted.clear();
            self.deleted.clear();
            self.policy_dirty = false;
        }

        for reference in std::mem::take(&mut self.content_removals) {
            if let Err(e) = self.services.content.remove(&reference).await {
                warn!(list = %self.config.name, reference = %reference, error = %e, "Failed to remove held content");
            }
        }
        Ok(())
    }

    /// Commit staged changes, then send the mail queued with them. Nothing is
    /// sent if the commit fails. The list stays locked.
    pub async fn commit(&mut self) -> Result<(), ModerationError> {
        self.write_staged().await?;
        let outbox = std::mem::take(&mut self.outbox);
        send_outbound(&self.services, outbox).await;
        Ok(())
    }

    /// Commit staged changes, release the list, then send queued mail.
    pub async fn finish(mut self) -> Result<(), ModerationError> {
        self.write_staged().await?;
        let outbox = std::mem::take(&mut self.outbox);
        let services = self.services.clone();
        debug!(list = %self.config.name, queued = outbox.len(), "List released");
        drop(self);
        send_outbound(&services, outbox).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::test_support::Harness;
    use crate::services::Clock;
    use chrono::Duration;
    use secrecy::SecretString;

    async fn manager_with(lists: Vec<ListConfig>) -> (ListManager, Arc<crate::services::FixedClock>) {
        let harness = Harness::new(lists).await;
        (harness.manager, harness.clock)
    }

    fn unsubscription(address: &str) -> RequestPayload {
        RequestPayload::Unsubscription {
            address: address.into(),
        }
    }

    fn subscription(address: &str) -> RequestPayload {
        RequestPayload::Subscription {
            address: address.into(),
            display_name: String::new(),
            password: SecretString::from("pw".to_string()),
            digest: false,
            language: "en".into(),
        }
    }

    #[tokio::test]
    async fn unknown_list_is_an_error() {
        let (manager, _) = manager_with(vec![]).await;
        assert!(matches!(
            manager.lock("nope").await,
            Err(ModerationError::UnknownList { .. })
        ));
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_never_reused() {
        let (manager, _) = manager_with(vec![ListConfig::new("devel", "example.com")]).await;

        let mut list = manager.lock("devel").await.unwrap();
        let a = list.insert("a@example.com", unsubscription("a@example.com"));
        let b = list.insert("b@example.com", unsubscription("b@example.com"));
        assert_eq!((a, b), (1, 2));
        list.delete(b);
        list.commit().await.unwrap();
        drop(list);

        let mut list = manager.lock("devel").await.unwrap();
        let c = list.insert("c@example.com", unsubscription("c@example.com"));
        assert_eq!(c, 3);
        assert_eq!(list.list_of_kind(RequestKind::Unsubscription), vec![1, 3]);
    }

    #[tokio::test]
    async fn uncommitted_changes_are_invisible() {
        let (manager, _) = manager_with(vec![ListConfig::new("devel", "example.com")]).await;

        {
            let mut list = manager.lock("devel").await.unwrap();
            list.insert("a@example.com", subscription("a@example.com"));
            list.ban("b@example.com");
            // Dropped without commit.
        }

        let list = manager.lock("devel").await.unwrap();
        assert_eq!(list.pending_count(), 0);
        assert!(list.policy().ban_list.is_empty());
    }

    #[tokio::test]
    async fn group_by_sender_partitions_ids() {
        let (manager, _) = manager_with(vec![ListConfig::new("devel", "example.com")]).await;
        let mut list = manager.lock("devel").await.unwrap();
        list.insert("a@example.com", subscription("A@example.com"));
        list.insert("b@example.com", subscription("b@example.com"));
        list.insert("a@example.com", subscription("a@example.com"));
        list.insert("a@example.com", unsubscription("a@example.com"));

        let groups = list.group_by_sender(RequestKind::Subscription);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["a@example.com"], vec![1, 3]);
        assert_eq!(groups["b@example.com"], vec![2]);
        assert_eq!(list.count_of(RequestKind::Subscription), 3);
        assert_eq!(list.count_of(RequestKind::Unsubscription), 1);
    }

    #[tokio::test]
    async fn lock_is_exclusive() {
        let (manager, _) = manager_with(vec![ListConfig::new("devel", "example.com")]).await;
        let manager = Arc::new(manager);

        let held = manager.lock("devel").await.unwrap();
        let contender = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let mut list = manager.lock("devel").await.unwrap();
                list.insert("late@example.com", unsubscription("late@example.com"))
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(held);
        assert_eq!(contender.await.unwrap(), 1);
    }

    async fn shared_manager(db_path: &Path, lock_dir: &Path) -> ListManager {
        let db = Arc::new(crate::store::LibSqlBackend::new_local(db_path).await.unwrap());
        let services = Services::new(
            Arc::new(crate::services::MemoryContentStore::new()),
            Arc::new(crate::services::RecordingNotifier::new()),
            Arc::new(crate::services::SystemClock),
        );
        ListManager::new(db, services, vec![ListConfig::new("devel", "example.com")], 0)
            .with_lock_dir(lock_dir)
    }

    #[tokio::test]
    async fn lock_dir_excludes_other_managers() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("requests.db");
        let lock_dir = dir.path().join("locks");
        let first = shared_manager(&db_path, &lock_dir).await;
        let second = shared_manager(&db_path, &lock_dir).await;

        let mut list = first.lock("devel").await.unwrap();
        let a = list.insert("a@example.com", unsubscription("a@example.com"));
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(200), second.lock("devel")).await;
        assert!(blocked.is_err());
        list.commit().await.unwrap();
        drop(list);

        let mut list = second.lock("devel").await.unwrap();
        assert!(list.get(a).is_ok());
        let b = list.insert("b@example.com", unsubscription("b@example.com"));
        assert_ne!(a, b);
        list.commit().await.unwrap();
        drop(list);

        let list = first.lock("devel").await.unwrap();
        assert_eq!(list.list_of_kind(RequestKind::Unsubscription), vec![a, b]);
    }

    #[tokio::test]
    async fn autoresponse_limit_resets_daily() {
        let mut config = ListConfig::new("devel", "example.com");
        config.max_autoresponses_per_day = 2;
        let (manager, clock) = manager_with(vec![config]).await;

        let mut list = manager.lock("devel").await.unwrap();
        assert!(list.record_autoresponse("bob@example.com"));
        assert!(list.record_autoresponse("bob@example.com"));
        assert!(!list.record_autoresponse("Bob@example.com"));

        clock.advance(Duration::days(1));
        assert!(list.record_autoresponse("bob@example.com"));
        assert_eq!(list.policy().autoresponses["bob@example.com"].count, 1);
    }

    #[tokio::test]
    async fn evict_autoresponses_uses_midnight() {
        let (manager, clock) = manager_with(vec![ListConfig::new("devel", "example.com")]).await;
        let mut list = manager.lock("devel").await.unwrap();
        list.record_autoresponse("old@example.com");
        clock.advance(Duration::days(1));
        list.record_autoresponse("new@example.com");

        let evicted = list.evict_autoresponses(clock.today());
        assert_eq!(evicted, 1);
        assert!(list.policy().autoresponses.contains_key("new@example.com"));
        list.commit().await.unwrap();
    }

    #[tokio::test]
    async fn membership_and_filters_persist() {
        let (manager, _) = manager_with(vec![ListConfig::new("devel", "example.com")]).await;
        {
            let mut list = manager.lock("devel").await.unwrap();
            let mut member = Member::new("Alice");
            member.moderated = true;
            list.add_member("alice@example.com", member).unwrap();
            assert!(matches!(
                list.add_member("ALICE@example.com", Member::new("Alice")),
                Err(ModerationError::AlreadyMember { .. })
            ));
            assert!(list.add_sender_filter(SenderFilter::Hold, "h@example.com"));
            assert!(!list.add_sender_filter(SenderFilter::Hold, "H@example.com"));
            assert!(list.ban("spam@example.com"));
            assert!(!list.ban("spam@example.com"));
            list.commit().await.unwrap();
        }

        let mut list = manager.lock("devel").await.unwrap();
        assert!(list.policy().members["alice@example.com"].moderated);
        list.clear_moderation("alice@example.com").unwrap();
        assert!(!list.policy().members["alice@example.com"].moderated);
        assert!(matches!(
            list.clear_moderation("bob@example.com"),
            Err(ModerationError::NotAMember { .. })
        ));
        assert_eq!(list.policy().hold_these_nonmembers, vec!["h@example.com"]);
        assert_eq!(list.policy().ban_list, vec!["spam@example.com"]);
        list.remove_member("alice@example.com").unwrap();
        assert!(!list.is_member("alice@example.com"));
    }

    #[tokio::test]
    async fn context_snapshots_policy() {
        let (manager, _) = manager_with(vec![ListConfig::new("devel", "example.com")]).await;
        {
            let mut list = manager.lock("devel").await.unwrap();
            list.add_member("alice@example.com", Member::new("Alice"))
                .unwrap();
            list.commit().await.unwrap();
        }
        let ctx = manager.context("devel").await.unwrap();
        assert!(ctx.policy.is_member("alice@example.com"));
        assert_eq!(ctx.config.name, "devel");
        assert_eq!(manager.list_names(), vec!["devel".to_string()]);
    }
}
