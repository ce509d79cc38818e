//! Held message content accessor.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ContentError;

/// Storage for the raw bytes of held messages.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store a message for `list`, returning an opaque reference.
    async fn store(&self, list: &str, raw: &[u8]) -> Result<String, ContentError>;

    /// Fetch the bytes behind a reference.
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, ContentError>;

    /// Remove stored content. Missing content is not an error.
    async fn remove(&self, reference: &str) -> Result<(), ContentError>;

    /// Keep a copy for the site administrator.
    async fn preserve(&self, reference: &str) -> Result<(), ContentError>;
}

/// One file per held message under a root directory. Preserved copies go to
/// `spam/` underneath it.
pub struct FileContentStore {
    root: PathBuf,
}

impl FileContentStore {
    pub async fn new(root: &Path) -> Result<Self, ContentError> {
        tokio::fs::create_dir_all(root).await?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, reference: &str) -> Result<PathBuf, ContentError> {
        if reference.is_empty()
            || reference.contains('/')
            || reference.contains('\\')
            || reference.starts_with('.')
        {
            return Err(ContentError::Unreadable {
                reference: reference.to_string(),
                reason: "invalid reference".into(),
            });
        }
        Ok(self.root.join(reference))
    }
}

#[async_trait]
impl ContentStore for FileContentStore {
    async fn store(&self, list: &str, raw: &[u8]) -> Result<String, ContentError> {
        let safe_list: String = list
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let reference = format!("heldmsg-{safe_list}-{}.eml", Uuid::new_v4());
        tokio::fs::write(self.path_for(&reference)?, raw).await?;
        debug!(reference = %reference, bytes = raw.len(), "Stored held content");
        Ok(reference)
    }

    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, ContentError> {
        let path = self.path_for(reference)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ContentError::NotFound {
                reference: reference.to_string(),
            }),
            Err(e) => Err(ContentError::Unreadable {
                reference: reference.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn remove(&self, reference: &str) -> Result<(), ContentError> {
        let path = self.path_for(reference)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn preserve(&self, reference: &str) -> Result<(), ContentError> {
        let src = self.path_for(reference)?;
        let spam_dir = self.root.join("spam");
        tokio::fs::create_dir_all(&spam_dir).await?;
        match tokio::fs::copy(&src, spam_dir.join(reference)).await {
            Ok(_) => {
                info!(reference = %reference, "Preserved held message");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ContentError::NotFound {
                reference: reference.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory content store, for tests and dry runs.
#[derive(Default)]
pub struct MemoryContentStore {
    items: Mutex<HashMap<String, Vec<u8>>>,
    preserved: Mutex<HashSet<String>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the bytes behind a reference.
    pub fn replace(&self, reference: &str, raw: &[u8]) {
        if let Ok(mut items) = self.items.lock() {
            items.insert(reference.to_string(), raw.to_vec());
        }
    }

    /// Drop content without going through `remove`.
    pub fn lose(&self, reference: &str) {
        if let Ok(mut items) = self.items.lock() {
            items.remove(reference);
        }
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.items
            .lock()
            .map(|items| items.contains_key(reference))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_preserved(&self, reference: &str) -> bool {
        self.preserved
            .lock()
            .map(|p| p.contains(reference))
            .unwrap_or(false)
    }

    fn poisoned(reference: &str) -> ContentError {
        ContentError::Unreadable {
            reference: reference.to_string(),
            reason: "content store lock poisoned".into(),
        }
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn store(&self, list: &str, raw: &[u8]) -> Result<String, ContentError> {
        let reference = format!("heldmsg-{list}-{}", Uuid::new_v4());
        self.items
            .lock()
            .map_err(|_| Self::poisoned(&reference))?
            .insert(reference.clone(), raw.to_vec());
        Ok(reference)
    }

    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, ContentError> {
        self.items
            .lock()
            .map_err(|_| Self::poisoned(reference))?
            .get(reference)
            .cloned()
            .ok_or_else(|| ContentError::NotFound {
                reference: reference.to_string(),
            })
    }

    async fn remove(&self, reference: &str) -> Result<(), ContentError> {
        self.items
            .lock()
            .map_err(|_| Self::poisoned(reference))?
            .remove(reference);
        Ok(())
    }

    async fn preserve(&self, reference: &str) -> Result<(), ContentError> {
        if !self.contains(reference) {
            return Err(ContentError::NotFound {
                reference: reference.to_string(),
            });
        }
        self.preserved
            .lock()
            .map_err(|_| Self::poisoned(reference))?
            .insert(reference.to_string());
        Ok(())
    }
}
