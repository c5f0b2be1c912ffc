//! Mention notifications.
//!
//! Delivery (email, in-app) belongs to the portal; the collaboration core only
//! hands each mention to a [`NotificationSink`] and moves on.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ids::{CommentId, ManuscriptId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionNotification {
    pub manuscript_id: ManuscriptId,
    pub comment_id: CommentId,
    /// Who was mentioned.
    pub recipient: UserId,
    pub author_id: UserId,
    pub author_name: String,
    /// Text of the comment or reply carrying the mention.
    pub excerpt: String,
    pub created_at: DateTime<Utc>,
}

/// Receiver of mention events. Must not block; failures are the sink's problem.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: MentionNotification);
}

/// Writes every mention to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, n: MentionNotification) {
        log::info!(
            "Mention: {} mentioned {} on comment {} in {}",
            n.author_id,
            n.recipient,
            n.comment_id,
            n.manuscript_id
        );
    }
}

/// Keeps notifications in memory. Handy for tests and tooling.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<MentionNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<MentionNotification> {
        self.sent.lock().clone()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, notification: MentionNotification) {
        self.sent.lock().push(notification);
    }
}

/// Excerpts are cut to this many chars.
const EXCERPT_CHARS: usize = 140;

pub(crate) fn excerpt(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        assert_eq!(excerpt("short"), "short");
        let long = "é".repeat(200);
        let cut = excerpt(&long);
        assert_eq!(cut.chars().count(), EXCERPT_CHARS + 1);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn test_recording_notifier() {
        let sink = RecordingNotifier::new();
        sink.notify(MentionNotification {
            manuscript_id: ManuscriptId::new("ms"),
            comment_id: CommentId::new(),
            recipient: UserId::new("bob"),
            author_id: UserId::new("alice"),
            author_name: "Alice".into(),
            excerpt: "@bob see here".into(),
            created_at: Utc::now(),
        });
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(sink.sent()[0].recipient.as_str(), "bob");
    }
}
