//! External collaborators: held content storage, outbound mail, and time.

pub mod clock;
pub mod content;
pub mod notifier;

use std::sync::Arc;

pub use clock::{Clock, FixedClock, SystemClock};
pub use content::{ContentStore, FileContentStore, MemoryContentStore};
pub use notifier::{LogNotifier, Notifier, RecordingNotifier, Sent, SmtpNotifier};

/// Shared handles to the collaborators, passed to the list manager and the
/// terminal chains.
#[derive(Clone)]
pub struct Services {
    pub content: Arc<dyn ContentStore>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    pub fn new(
        content: Arc<dyn ContentStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            content,
            notifier,
            clock,
        }
    }
}
