//! Typed views over the kind-specific event context sent by the feed.
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

use crate::error::RenderError;
use crate::model::EventKind;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub timezone_offset: i32,
    #[serde(default)]
    pub is_actor: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewerStatus {
    Accepted,
    RequestedChanges,
    Blocking,
    Unreviewed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reviewer {
    pub name: String,
    #[serde(default)]
    pub is_actionable: bool,
    pub status: ReviewerStatus,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExistenceChange {
    Added,
    Removed,
    NoChange,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEditedReviewer {
    pub name: String,
    #[serde(default)]
    pub is_actionable: bool,
    pub status: ReviewerStatus,
    pub metadata_change: ExistenceChange,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bug {
    pub bug_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

/// Secure revisions omit `name`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub revision_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub link: String,
    #[serde(default)]
    pub bug: Option<Bug>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentMessage {
    pub as_text: String,
    pub as_html: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineComment {
    pub file_context: String,
    pub link: String,
    pub message: CommentMessage,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileChange {
    Added,
    Removed,
    Modified,
}

impl FileChange {
    pub fn as_str(self) -> &'static str {
        match self {
            FileChange::Added => "added",
            FileChange::Removed => "removed",
            FileChange::Modified => "modified",
        }
    }
}

impl fmt::Display for FileChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AffectedFile {
    pub path: String,
    pub change: FileChange,
}

/// Body shared by accepted / commented / requested-changes / landed / closed.
/// Secure variants carry `commentCount` instead of comment text.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionBody {
    #[serde(default)]
    pub main_comment_message: Option<CommentMessage>,
    #[serde(default)]
    pub inline_comments: Vec<InlineComment>,
    #[serde(default)]
    pub comment_count: Option<u32>,
    #[serde(default)]
    pub transaction_link: Option<String>,
    #[serde(default)]
    pub lando_link: Option<String>,
    #[serde(default)]
    pub is_ready_to_land: bool,
    #[serde(default)]
    pub author: Option<Recipient>,
    pub reviewers: Vec<Recipient>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

/// Body for events addressed to reviewer groups: created / updated /
/// requested-review / reclaimed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequestBody {
    #[serde(default)]
    pub main_comment_message: Option<CommentMessage>,
    #[serde(default)]
    pub inline_comments: Vec<InlineComment>,
    #[serde(default)]
    pub comment_count: Option<u32>,
    #[serde(default)]
    pub transaction_link: Option<String>,
    #[serde(default)]
    pub new_changes_link: Option<String>,
    #[serde(default)]
    pub is_ready_to_land: bool,
    #[serde(default)]
    pub affected_files: Vec<AffectedFile>,
    pub reviewers: Vec<Reviewer>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingedBody {
    pub recipient: Recipient,
    #[serde(default)]
    pub pinged_main_comment_message: Option<CommentMessage>,
    #[serde(default)]
    pub pinged_inline_comments: Vec<InlineComment>,
    #[serde(default)]
    pub transaction_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEditedBody {
    #[serde(default)]
    pub is_ready_to_land: bool,
    #[serde(default)]
    pub is_title_changed: bool,
    #[serde(default)]
    pub is_bug_changed: bool,
    #[serde(default)]
    pub author: Option<Recipient>,
    pub reviewers: Vec<MetadataEditedReviewer>,
    #[serde(default)]
    pub subscribers: Vec<Recipient>,
}

#[derive(Debug, Clone)]
pub enum EventBody {
    Discussion(DiscussionBody),
    ReviewRequest(ReviewRequestBody),
    Pinged(PingedBody),
    MetadataEdited(MetadataEditedBody),
}

impl EventBody {
    pub fn parse(kind: &EventKind, raw: &Value) -> Result<Self, RenderError> {
        let body = match kind {
            EventKind::RevisionAccepted
            | EventKind::RevisionCommented
            | EventKind::RevisionRequestedChanges
            | EventKind::RevisionLanded
            | EventKind::RevisionClosed
            | EventKind::RevisionAbandoned => {
                EventBody::Discussion(DiscussionBody::deserialize(raw)?)
            }
            EventKind::RevisionCreated
            | EventKind::RevisionUpdated
            | EventKind::RevisionRequestedReview
            | EventKind::RevisionReclaimed => {
                EventBody::ReviewRequest(ReviewRequestBody::deserialize(raw)?)
            }
            EventKind::RevisionCommentPinged => EventBody::Pinged(PingedBody::deserialize(raw)?),
            EventKind::RevisionMetadataEdited => {
                EventBody::MetadataEdited(MetadataEditedBody::deserialize(raw)?)
            }
            EventKind::Unknown(_) => return Err(RenderError::NoContext),
        };
        Ok(body)
    }

    pub fn main_comment(&self) -> Option<&CommentMessage> {
        match self {
            EventBody::Discussion(b) => b.main_comment_message.as_ref(),
            EventBody::ReviewRequest(b) => b.main_comment_message.as_ref(),
            EventBody::Pinged(b) => b.pinged_main_comment_message.as_ref(),
            EventBody::MetadataEdited(_) => None,
        }
    }

    pub fn inline_comments(&self) -> &[InlineComment] {
        match self {
            EventBody::Discussion(b) => &b.inline_comments,
            EventBody::ReviewRequest(b) => &b.inline_comments,
            EventBody::Pinged(b) => &b.pinged_inline_comments,
            EventBody::MetadataEdited(_) => &[],
        }
    }

    /// Link shown as the call to action.
    pub fn link(&self) -> Option<&str> {
        match self {
            EventBody::Discussion(b) => b.transaction_link.as_deref(),
            EventBody::ReviewRequest(b) => b
                .new_changes_link
                .as_deref()
                .or(b.transaction_link.as_deref()),
            EventBody::Pinged(b) => b.transaction_link.as_deref(),
            EventBody::MetadataEdited(_) => None,
        }
    }

    pub fn affected_files(&self) -> &[AffectedFile] {
        match self {
            EventBody::ReviewRequest(b) => &b.affected_files,
            _ => &[],
        }
    }
}

/// `context` of a full event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullContext {
    pub actor_name: String,
    pub revision: Revision,
    pub body: Value,
}

/// `minimalContext`: enough to tell recipients that something happened.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimalContext {
    pub revision: Revision,
    pub recipients: Vec<Recipient>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn review_request_body_parses_reviewer_groups() {
        let raw = json!({
            "affectedFiles": [{ "path": "src/lib.rs", "change": "modified" }],
            "reviewers": [{
                "name": "group",
                "isActionable": true,
                "status": "blocking",
                "recipients": [{ "email": "r@mail", "username": "r", "timezoneOffset": -25200, "isActor": false }],
            }],
        });
        let body = EventBody::parse(&EventKind::RevisionCreated, &raw).unwrap();
        match body {
            EventBody::ReviewRequest(b) => {
                assert_eq!(b.reviewers[0].status, ReviewerStatus::Blocking);
                assert_eq!(b.affected_files[0].change, FileChange::Modified);
                assert!(b.subscribers.is_empty());
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn discussion_body_requires_reviewers() {
        let err = EventBody::parse(&EventKind::RevisionCommented, &json!({ "author": null }));
        assert!(matches!(err, Err(RenderError::Context(_))));
    }

    #[test]
    fn secure_revision_has_no_name() {
        let rev: Revision = serde_json::from_value(json!({
            "revisionId": 1,
            "link": "link",
            "bug": { "bugId": 7, "link": "bug-link" },
        }))
        .unwrap();
        assert!(rev.name.is_none());
        assert_eq!(rev.bug.unwrap().bug_id, 7);
    }
}
