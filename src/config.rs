//! Configuration types.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Default cron schedule for the eviction sweep (08:00 every day).
pub const DEFAULT_SWEEP_CRON: &str = "0 0 8 * * *";

/// Process-level configuration, built from environment variables.
#[derive(Debug)]
pub struct ModerationConfig {
    /// libSQL database file holding requests and list policy.
    pub db_path: PathBuf,
    /// Directory where held message content is stored.
    pub content_dir: PathBuf,
    /// Directory of per-list JSON configuration files.
    pub lists_dir: PathBuf,
    /// Directory of per-list lock files shared by every process on the database.
    pub lock_dir: PathBuf,
    /// Maximum characters of body excerpt shown for a held message (0 = all).
    pub page_text_limit: usize,
    /// Cron expression for the sweep daemon.
    pub sweep_cron: String,
    /// Outbound SMTP; notifications are only logged when unset.
    pub smtp: Option<SmtpConfig>,
}

/// SMTP settings for the notifier.
#[derive(Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/list-moderation.db"),
            content_dir: PathBuf::from("./data/held"),
            lists_dir: PathBuf::from("./data/lists"),
            lock_dir: PathBuf::from("./data/locks"),
            page_text_limit: 4096,
            sweep_cron: DEFAULT_SWEEP_CRON.to_string(),
            smtp: None,
        }
    }
}

impl ModerationConfig {
    /// Build config from environment variables, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let db_path = std::env::var("LIST_MODERATION_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let content_dir = std::env::var("LIST_MODERATION_CONTENT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.content_dir);
        let lists_dir = std::env::var("LIST_MODERATION_LISTS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.lists_dir);
        let lock_dir = std::env::var("LIST_MODERATION_LOCK_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.lock_dir);
        let page_text_limit: usize = std::env::var("LIST_MODERATION_PAGE_TEXT_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.page_text_limit);
        let sweep_cron =
            std::env::var("LIST_MODERATION_SWEEP_CRON").unwrap_or(defaults.sweep_cron);

        Self {
            db_path,
            content_dir,
            lists_dir,
            lock_dir,
            page_text_limit,
            sweep_cron,
            smtp: SmtpConfig::from_env(),
        }
    }
}

impl SmtpConfig {
    /// Returns `None` if `LIST_MODERATION_SMTP_HOST` is not set.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("LIST_MODERATION_SMTP_HOST").ok()?;

        let port: u16 = std::env::var("LIST_MODERATION_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("LIST_MODERATION_SMTP_USERNAME").unwrap_or_default();
        let password = std::env::var("LIST_MODERATION_SMTP_PASSWORD").unwrap_or_default();
        let from_address =
            std::env::var("LIST_MODERATION_SMTP_FROM").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password: SecretString::from(password),
            from_address,
        })
    }
}

/// A header name plus a regular expression matched against its values.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderPattern {
    pub header: String,
    pub pattern: String,
}

/// A header pattern that routes matching messages to a chain.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderMatch {
    pub header: String,
    pub pattern: String,
    /// Chain to jump to on a match; `hold` when omitted.
    #[serde(default)]
    pub chain: Option<String>,
}

/// Per-list moderation settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ListConfig {
    /// Short list name, e.g. `mylist`.
    pub name: String,
    /// Address people post to, e.g. `mylist@example.com`.
    pub posting_address: String,
    /// Where moderator notifications go.
    pub owner_address: String,
    /// Password accepted in an `Approved:` header.
    pub moderator_password: Option<SecretString>,
    /// Held messages older than this many days are discarded (0 = never).
    pub max_days_to_hold: u32,
    /// Autoresponses sent to one sender per day (0 = unlimited).
    pub max_autoresponses_per_day: u32,
    /// Tell posters their message is awaiting approval.
    pub respond_to_post_requests: bool,
    /// Hold every post.
    pub emergency: bool,
    /// Maximum message size in KiB (0 = unlimited).
    pub max_message_size_kb: u64,
    /// Hold posts with at least this many recipients (0 = unlimited).
    pub max_num_recipients: usize,
    /// Hold posts that do not name the list explicitly.
    pub require_explicit_destination: bool,
    /// Other addresses that count as the list; `^` marks a regex.
    pub acceptable_aliases: Vec<String>,
    /// Held when any of these header patterns match.
    pub bounce_matching_headers: Vec<HeaderPattern>,
    /// Header patterns routing posts to other chains.
    pub header_matches: Vec<HeaderMatch>,
    /// Hold posts that look like subscribe/unsubscribe commands.
    pub administrivia: bool,
    /// Moderation flag given to newly approved members.
    pub default_member_moderation: bool,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            posting_address: String::new(),
            owner_address: String::new(),
            moderator_password: None,
            max_days_to_hold: 0,
            max_autoresponses_per_day: 10,
            respond_to_post_requests: true,
            emergency: false,
            max_message_size_kb: 40,
            max_num_recipients: 10,
            require_explicit_destination: true,
            acceptable_aliases: Vec::new(),
            bounce_matching_headers: Vec::new(),
            header_matches: Vec::new(),
            administrivia: true,
            default_member_moderation: false,
        }
    }
}

impl ListConfig {
    /// Config for `name@domain` with default settings.
    pub fn new(name: &str, domain: &str) -> Self {
        Self {
            name: name.to_string(),
            posting_address: format!("{name}@{domain}"),
            owner_address: format!("{name}-owner@{domain}"),
            ..Self::default()
        }
    }

    /// Load a list config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ListConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load every `*.json` list config in a directory, sorted by file name.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>, ConfigError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut lists: Vec<Self> = Vec::with_capacity(paths.len());
        for path in paths {
            let config = Self::from_file(&path)?;
            if lists.iter().any(|l| l.name == config.name) {
                return Err(ConfigError::InvalidValue {
                    key: "name".into(),
                    message: format!("list {} is configured twice", config.name),
                });
            }
            lists.push(config);
        }
        Ok(lists)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "name".into(),
                message: "list name must not be empty".into(),
            });
        }
        if !self.posting_address.contains('@') {
            return Err(ConfigError::InvalidValue {
                key: "posting_address".into(),
                message: format!("{:?} is not an address", self.posting_address),
            });
        }
        Ok(())
    }
}
