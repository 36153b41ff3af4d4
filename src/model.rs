use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Position in the remote feed. Cursors are totally ordered; the feed's
/// chronological keys are monotonically increasing integers.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Cursor(pub i64);

impl Cursor {
    /// The start of the feed.
    pub const START: Cursor = Cursor(0);

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn is_start(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Cursor {
    fn from(value: i64) -> Self {
        Cursor(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    RevisionCreated,
    RevisionUpdated,
    RevisionAccepted,
    RevisionCommented,
    RevisionCommentPinged,
    RevisionRequestedChanges,
    RevisionRequestedReview,
    RevisionMetadataEdited,
    RevisionAbandoned,
    RevisionReclaimed,
    RevisionLanded,
    RevisionClosed,
    /// Anything this build does not know how to render.
    Unknown(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "revision-created" => EventKind::RevisionCreated,
            "revision-updated" => EventKind::RevisionUpdated,
            "revision-accepted" => EventKind::RevisionAccepted,
            "revision-commented" => EventKind::RevisionCommented,
            "revision-comment-pinged" => EventKind::RevisionCommentPinged,
            "revision-requested-changes" => EventKind::RevisionRequestedChanges,
            "revision-requested-review" => EventKind::RevisionRequestedReview,
            "revision-metadata-edited" => EventKind::RevisionMetadataEdited,
            "revision-abandoned" => EventKind::RevisionAbandoned,
            "revision-reclaimed" => EventKind::RevisionReclaimed,
            "revision-landed" => EventKind::RevisionLanded,
            "revision-closed" => EventKind::RevisionClosed,
            other => EventKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::RevisionCreated => "revision-created",
            EventKind::RevisionUpdated => "revision-updated",
            EventKind::RevisionAccepted => "revision-accepted",
            EventKind::RevisionCommented => "revision-commented",
            EventKind::RevisionCommentPinged => "revision-comment-pinged",
            EventKind::RevisionRequestedChanges => "revision-requested-changes",
            EventKind::RevisionRequestedReview => "revision-requested-review",
            EventKind::RevisionMetadataEdited => "revision-metadata-edited",
            EventKind::RevisionAbandoned => "revision-abandoned",
            EventKind::RevisionReclaimed => "revision-reclaimed",
            EventKind::RevisionLanded => "revision-landed",
            EventKind::RevisionClosed => "revision-closed",
            EventKind::Unknown(raw) => raw.as_str(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventKind::Unknown(_))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One feed entry. The envelope is parsed eagerly by the feed source; the
/// kind-specific context stays as JSON and is typed by the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub cursor: Cursor,
    pub kind: EventKind,
    pub timestamp: i64,
    pub is_secure: bool,
    pub context: Option<Value>,
    pub minimal_context: Option<Value>,
}

/// Output of the renderer for one (event, recipient) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub key: Uuid,
    pub event_id: String,
    pub cursor: Cursor,
    pub template: String,
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub timestamp: i64,
}

impl RenderedMessage {
    /// Deterministic key: the same event rendered for the same recipient and
    /// template always yields the same key, across restarts.
    pub fn message_key(event_id: &str, recipient: &str, template: &str) -> Uuid {
        let name = format!("{event_id}\u{1f}{recipient}\u{1f}{template}");
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.timestamp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Persisted pipeline state: one row per deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelinePosition {
    pub last_cursor: Cursor,
    pub updated_at: DateTime<Utc>,
}
