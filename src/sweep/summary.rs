//! Owner notification listing what is still waiting for a moderator.

use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::requests::manager::LockedList;
use crate::requests::model::{RequestKind, RequestPayload};

/// A rendered summary notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub subject: String,
    pub body: String,
}

fn ctime(at: DateTime<Utc>) -> String {
    at.format("%a %b %e %H:%M:%S %Y").to_string()
}

/// Build the owner summary for a list. Returns `None` when nothing is
/// pending and nothing expired.
pub fn pending_summary(list: &LockedList, expired: usize) -> Option<Summary> {
    let count = list.pending_count();
    if count == 0 && expired == 0 {
        return None;
    }

    let subject = if count > 0 {
        format!("{} {} moderator request(s) waiting", count, list.name())
    } else {
        format!("{} moderator request check result", list.name())
    };

    let mut body = String::new();
    if expired > 0 {
        let _ = write!(
            body,
            "Notice: {expired} old request(s) automatically expired.\n\n"
        );
    }

    let subscriptions = list.list_of_kind(RequestKind::Subscription);
    if !subscriptions.is_empty() {
        body.push_str("Pending subscriptions:\n");
        for id in subscriptions {
            let Ok(request) = list.get(id) else { continue };
            if let RequestPayload::Subscription {
                address,
                display_name,
                ..
            } = &request.payload
            {
                let _ = writeln!(
                    body,
                    "    {} ({}) {}",
                    address,
                    display_name,
                    ctime(request.created_at)
                );
            }
        }
        body.push('\n');
    }

    let unsubscriptions = list.list_of_kind(RequestKind::Unsubscription);
    if !unsubscriptions.is_empty() {
        body.push_str("Pending unsubscriptions:\n");
        for id in unsubscriptions {
            let Ok(request) = list.get(id) else { continue };
            if let RequestPayload::Unsubscription { address } = &request.payload {
                let _ = writeln!(body, "    {} {}", address, ctime(request.created_at));
            }
        }
        body.push('\n');
    }

    let posts = list.list_of_kind(RequestKind::HeldMessage);
    if !posts.is_empty() {
        body.push_str("Pending posts:\n");
        for id in posts {
            let Ok(request) = list.get(id) else { continue };
            if let RequestPayload::HeldMessage {
                subject, reason, ..
            } = &request.payload
            {
                let _ = write!(
                    body,
                    "From: {} on {}\nSubject: {}\nCause: {}\n\n",
                    request.sender,
                    ctime(request.created_at),
                    subject,
                    reason
                );
            }
        }
    }

    Some(Summary { subject, body })
}
