use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};

use list_moderation::chains::builtin::register_builtin_chains;
use list_moderation::chains::registry::{self, ChainRegistryBuilder};
use list_moderation::chains::{DEFAULT_START_CHAIN, InboundMessage, MessageMetadata, process};
use list_moderation::config::{ListConfig, ModerationConfig};
use list_moderation::error::ErrorClass;
use list_moderation::requests::{Decision, ListManager, RequestKind, ResolveOptions};
use list_moderation::services::{
    FileContentStore, LogNotifier, Notifier, Services, SmtpNotifier, SystemClock,
};
use list_moderation::store::{LibSqlBackend, RequestDatabase};
use list_moderation::sweep;

const USAGE: &str = "usage: list-moderation [sweep | daemon | pending | \
process <list> <file> | resolve <list> <id> <decision> [reason]]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ModerationConfig::from_env();
    let args: Vec<String> = std::env::args().skip(1).collect();

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn RequestDatabase> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );

    // ── Collaborators ────────────────────────────────────────────────────
    let content = Arc::new(
        FileContentStore::new(&config.content_dir)
            .await
            .with_context(|| format!("opening content dir {}", config.content_dir.display()))?,
    );
    let notifier: Arc<dyn Notifier> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpNotifier::new(smtp)?),
        None => {
            tracing::info!("SMTP not configured; notifications will only be logged");
            Arc::new(LogNotifier)
        }
    };
    let services = Services::new(content, notifier, Arc::new(SystemClock));

    // ── Lists ────────────────────────────────────────────────────────────
    let lists = load_lists(&config.lists_dir)?;
    tracing::info!(lists = lists.len(), dir = %config.lists_dir.display(), "Lists loaded");
    let manager = Arc::new(
        ListManager::new(db, services, lists, config.page_text_limit)
            .with_lock_dir(&config.lock_dir),
    );

    match args.first().map(String::as_str) {
        None | Some("sweep") => {
            let reports = sweep::check_and_notify(&manager).await;
            for report in reports {
                println!(
                    "{}: discarded {}, evicted {} autoresponse(s), {} pending",
                    report.list, report.discarded, report.evicted_autoresponses, report.remaining
                );
            }
        }
        Some("daemon") => {
            let handle = sweep::spawn_sweep_task(Arc::clone(&manager), &config.sweep_cron)?;
            tracing::info!(schedule = %config.sweep_cron, "Sweep daemon started");
            tokio::signal::ctrl_c().await?;
            handle.abort();
            tracing::info!("Sweep daemon stopped");
        }
        Some("pending") => {
            for name in manager.list_names() {
                let list = manager.lock(&name).await?;
                println!(
                    "{}: {} held message(s), {} subscription(s), {} unsubscription(s)",
                    name,
                    list.count_of(RequestKind::HeldMessage),
                    list.count_of(RequestKind::Subscription),
                    list.count_of(RequestKind::Unsubscription)
                );
            }
        }
        Some("process") => {
            let [_, list_name, path] = args.as_slice() else {
                bail!(USAGE);
            };
            process_file(Arc::clone(&manager), list_name, Path::new(path)).await?;
        }
        Some("resolve") => {
            let (list_name, id, decision, reason) = match args.as_slice() {
                [_, list, id, decision] => (list, id, decision, None),
                [_, list, id, decision, reason] => (list, id, decision, Some(reason.clone())),
                _ => bail!(USAGE),
            };
            let id: u64 = id.parse().context("request id must be a number")?;
            let decision: Decision = decision.parse().map_err(anyhow::Error::msg)?;
            let options = ResolveOptions {
                reason,
                ..Default::default()
            };

            println!("{}", resolve_one(&manager, list_name, id, decision, &options).await?);
        }
        Some(_) => bail!(USAGE),
    }

    Ok(())
}

fn load_lists(dir: &Path) -> anyhow::Result<Vec<ListConfig>> {
    if !dir.exists() {
        tracing::warn!(dir = %dir.display(), "List config directory missing; no lists configured");
        return Ok(Vec::new());
    }
    Ok(ListConfig::load_dir(dir)?)
}

/// Apply one moderator decision and describe the result. A request someone
/// else already resolved is reported, not treated as a failure.
async fn resolve_one(
    manager: &ListManager,
    list_name: &str,
    id: u64,
    decision: Decision,
    options: &ResolveOptions,
) -> anyhow::Result<String> {
    let mut list = manager.lock(list_name).await?;
    let outcome = list.resolve(id, decision, options).await;
    // Lost or corrupt items were discarded; keep that even on error.
    list.finish().await?;
    match outcome {
        Ok(outcome) => Ok(format!("{list_name}: request {id} -> {outcome:?}")),
        Err(e) if e.class() == ErrorClass::Benign => {
            Ok(format!("{list_name}: request {id} already resolved ({e})"))
        }
        Err(e) => Err(e.into()),
    }
}

async fn process_file(manager: Arc<ListManager>, list_name: &str, path: &Path) -> anyhow::Result<()> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let msg = InboundMessage::parse(&raw).map_err(anyhow::Error::msg)?;
    let context = manager.context(list_name).await?;

    let mut builder = ChainRegistryBuilder::new();
    register_builtin_chains(&mut builder, Arc::clone(&manager))?;
    let registry = registry::install(builder.build())?;

    let mut meta = MessageMetadata::default();
    process(&registry, &context, &msg, &mut meta, DEFAULT_START_CHAIN).await?;

    println!(
        "{}: {:?} (hits: {}; misses: {})",
        list_name,
        meta.disposition,
        meta.rule_hits.join(", "),
        meta.rule_misses.join(", ")
    );
    if !meta.moderation_reasons.is_empty() {
        println!("  reasons: {}", meta.moderation_reasons.join("; "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use list_moderation::requests::RequestPayload;
    use list_moderation::services::{MemoryContentStore, RecordingNotifier};

    async fn manager() -> ListManager {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let services = Services::new(
            Arc::new(MemoryContentStore::new()),
            Arc::new(RecordingNotifier::new()),
            Arc::new(SystemClock),
        );
        ListManager::new(db, services, vec![ListConfig::new("devel", "example.com")], 0)
    }

    #[tokio::test]
    async fn resolving_a_resolved_request_succeeds() {
        let manager = manager().await;
        let id = {
            let mut list = manager.lock("devel").await.unwrap();
            let id = list.insert(
                "dave@example.com",
                RequestPayload::Unsubscription {
                    address: "dave@example.com".into(),
                },
            );
            list.commit().await.unwrap();
            id
        };
        let options = ResolveOptions::default();

        let first = resolve_one(&manager, "devel", id, Decision::Discard, &options)
            .await
            .unwrap();
        assert!(first.ends_with("-> Discarded"));
        let again = resolve_one(&manager, "devel", id, Decision::Discard, &options)
            .await
            .unwrap();
        assert!(again.contains("already resolved"));
    }

    #[tokio::test]
    async fn unknown_list_still_fails() {
        let manager = manager().await;
        assert!(
            resolve_one(&manager, "nope", 1, Decision::Discard, &ResolveOptions::default())
                .await
                .is_err()
        );
    }
}
