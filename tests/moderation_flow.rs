//! End-to-end: hold through the rule chains, resolve, then sweep.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;

use list_moderation::ModerationError;
use list_moderation::chains::builtin::{HOLD, register_builtin_chains};
use list_moderation::chains::{
    ChainRegistry, ChainRegistryBuilder, Disposition, FnRule, InboundMessage, Link,
    MessageMetadata, StaticChain, process,
};
use list_moderation::config::ListConfig;
use list_moderation::requests::{
    Decision, ListManager, Outcome, RequestKind, RequestPayload, ResolveOptions,
};
use list_moderation::services::{
    Clock, FixedClock, MemoryContentStore, RecordingNotifier, Services,
};
use list_moderation::store::LibSqlBackend;
use list_moderation::sweep;

struct Fixture {
    manager: Arc<ListManager>,
    registry: ChainRegistry,
    clock: Arc<FixedClock>,
    content: Arc<MemoryContentStore>,
    notifier: Arc<RecordingNotifier>,
}

async fn fixture(max_days_to_hold: u32) -> Fixture {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let clock = Arc::new(FixedClock::new(
        DateTime::parse_from_rfc3339("2026-03-10T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
    ));
    let content = Arc::new(MemoryContentStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let services = Services::new(content.clone(), notifier.clone(), clock.clone());

    let mut config = ListConfig::new("devel", "example.com");
    config.max_days_to_hold = max_days_to_hold;
    let manager = Arc::new(ListManager::new(db, services, vec![config], 0));

    let mut builder = ChainRegistryBuilder::new();
    register_builtin_chains(&mut builder, manager.clone()).unwrap();
    let spam = Arc::new(FnRule::new("R1", |_, msg: &InboundMessage, _| {
        msg.subject
            .as_deref()
            .is_some_and(|s| s.to_lowercase().contains("spam"))
    }));
    let otherwise = Arc::new(FnRule::new("R2", |_, _, _| true));
    builder
        .register(Arc::new(StaticChain::new(
            "moderate",
            "Stop spam, hold everything else",
            vec![Link::stop(spam), Link::jump(otherwise, HOLD)],
        )))
        .unwrap();

    Fixture {
        manager,
        registry: builder.build(),
        clock,
        content,
        notifier,
    }
}

async fn run(f: &Fixture, raw: &str) -> MessageMetadata {
    let msg = InboundMessage::parse(raw.as_bytes()).unwrap();
    let context = f.manager.context("devel").await.unwrap();
    let mut meta = MessageMetadata::default();
    process(&f.registry, &context, &msg, &mut meta, "moderate")
        .await
        .unwrap();
    meta
}

fn subscription(address: &str) -> RequestPayload {
    RequestPayload::Subscription {
        address: address.to_string(),
        display_name: String::new(),
        password: SecretString::from("secret".to_string()),
        digest: false,
        language: "en".to_string(),
    }
}

#[tokio::test]
async fn spam_stops_and_hello_is_held() {
    let f = fixture(0).await;

    let spam = run(
        &f,
        "From: spammer@example.net\nTo: devel@example.com\nSubject: spam now\n\nbuy\n",
    )
    .await;
    assert_eq!(spam.rule_hits, vec!["R1"]);
    assert_eq!(spam.disposition, None);

    let hello = run(
        &f,
        "From: bob@example.com\nTo: devel@example.com\nSubject: hello\n\nhi\n",
    )
    .await;
    assert_eq!(hello.rule_hits, vec!["R2"]);
    assert_eq!(hello.rule_misses, vec!["R1"]);
    let Some(Disposition::Held { id }) = hello.disposition else {
        panic!("expected a hold, got {:?}", hello.disposition);
    };

    let list = f.manager.lock("devel").await.unwrap();
    assert_eq!(list.list_of_kind(RequestKind::HeldMessage), vec![id]);
    assert_eq!(list.get(id).unwrap().sender, "bob@example.com");
    assert_eq!(f.content.len(), 1);
}

#[tokio::test]
async fn approve_then_resolve_again_is_benign() {
    let f = fixture(0).await;
    let meta = run(
        &f,
        "From: bob@example.com\nTo: devel@example.com\nSubject: hello\n\nhi\n",
    )
    .await;
    let Some(Disposition::Held { id }) = meta.disposition else {
        panic!("expected a hold");
    };

    {
        let mut list = f.manager.lock("devel").await.unwrap();
        let view = list.load_message(id).await.unwrap();
        assert_eq!(view.excerpt.trim_end(), "hi");
        let outcome = list
            .resolve(id, Decision::Approve, &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Approved);
        list.commit().await.unwrap();
    }
    assert_eq!(f.notifier.deliveries(), 1);
    assert!(f.content.is_empty());

    let mut list = f.manager.lock("devel").await.unwrap();
    assert_eq!(list.pending_count(), 0);
    let err = list
        .resolve(id, Decision::Approve, &ResolveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ModerationError::NotFound { .. }));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn duplicate_subscriptions_collapse() {
    let f = fixture(0).await;
    {
        let mut list = f.manager.lock("devel").await.unwrap();
        list.insert("carol@example.com", subscription("carol@example.com"));
        list.insert("carol@example.com", subscription("carol@example.com"));
        list.commit().await.unwrap();
    }

    let mut list = f.manager.lock("devel").await.unwrap();
    let report = list
        .resolve_sender(
            RequestKind::Subscription,
            "carol@example.com",
            Decision::Defer,
            &ResolveOptions::default(),
            false,
        )
        .await
        .unwrap();
    assert_eq!(report.duplicates.len(), 1);
    assert_eq!(report.resolved.len(), 1);
    list.commit().await.unwrap();
    drop(list);

    let list = f.manager.lock("devel").await.unwrap();
    assert_eq!(list.count_of(RequestKind::Subscription), 1);
}

#[tokio::test]
async fn banned_subscription_is_left_pending() {
    let f = fixture(0).await;
    let mut list = f.manager.lock("devel").await.unwrap();
    list.ban("mallory@example.com");
    let id = list.insert("mallory@example.com", subscription("mallory@example.com"));
    list.commit().await.unwrap();

    let err = list
        .resolve(id, Decision::Approve, &ResolveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ModerationError::MembershipBanned { ref pattern, .. } if pattern == "mallory@example.com"
    ));
    list.commit().await.unwrap();
    drop(list);

    let list = f.manager.lock("devel").await.unwrap();
    assert!(list.get(id).is_ok());
    assert!(!list.is_member("mallory@example.com"));
}

#[tokio::test]
async fn lost_content_is_discarded_on_approval() {
    let f = fixture(0).await;
    let meta = run(
        &f,
        "From: bob@example.com\nTo: devel@example.com\nSubject: hello\n\nhi\n",
    )
    .await;
    let Some(Disposition::Held { id }) = meta.disposition else {
        panic!("expected a hold");
    };

    let mut list = f.manager.lock("devel").await.unwrap();
    if let RequestPayload::HeldMessage { content_ref, .. } = &list.get(id).unwrap().payload {
        f.content.lose(content_ref);
    }
    let report = list
        .resolve_batch(&[(id, Decision::Approve, ResolveOptions::default())], false)
        .await
        .unwrap();
    assert_eq!(report.lost, vec![id]);
    list.commit().await.unwrap();
    assert_eq!(list.pending_count(), 0);
    assert_eq!(f.notifier.deliveries(), 0);
}

#[tokio::test]
async fn sweep_discards_only_expired_messages() {
    let f = fixture(7).await;
    let now = f.clock.now();

    let mut ids = Vec::new();
    for age in [8, 6] {
        f.clock.set(now - Duration::days(age));
        let meta = run(
            &f,
            "From: bob@example.com\nTo: devel@example.com\nSubject: hello\n\nhi\n",
        )
        .await;
        let Some(Disposition::Held { id }) = meta.disposition else {
            panic!("expected a hold");
        };
        ids.push(id);
    }
    f.clock.set(now);

    let reports = sweep::check_and_notify(&f.manager).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].discarded, 1);
    assert_eq!(reports[0].remaining, 1);

    let list = f.manager.lock("devel").await.unwrap();
    assert!(list.get(ids[0]).is_err());
    assert!(list.get(ids[1]).is_ok());
    assert_eq!(f.content.len(), 1);

    let owner = &f.manager.config("devel").unwrap().owner_address;
    let summary = f.notifier.notices_to(owner);
    let last = summary.last().unwrap();
    assert_eq!(last.0, "1 devel moderator request(s) waiting");
    assert!(last.1.contains("Subject: hello"));
}
