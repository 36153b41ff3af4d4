//! Event renderer: decides who hears about an event and renders one message
//! per recipient. Pure apart from logging.
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::RenderError;
use crate::model::{Event, EventKind, RenderedMessage};

pub mod events;
pub mod templates;

use events::{
    EventBody, ExistenceChange, FullContext, MinimalContext, Recipient, Reviewer, Revision,
};
pub use templates::{BuiltinTemplates, RenderedBody, TemplateEngine, TemplateParams};
use templates::{MINIMAL_TEMPLATE, PUBLIC_PREFIX, SECURE_PREFIX};

/// A rendering problem that cost one recipient (or the whole event) its mail.
#[derive(Debug)]
pub struct RenderFault {
    pub recipient: Option<String>,
    pub error: RenderError,
}

#[derive(Debug, Default)]
pub struct Rendered {
    pub messages: Vec<RenderedMessage>,
    pub faults: Vec<RenderFault>,
}

#[derive(Debug, Clone)]
struct Target {
    template: &'static str,
    recipient: Recipient,
    reviewer_name: Option<String>,
    reviewer_is_actionable: bool,
}

/// Recipients for one event, in targeting order. Each address is targeted
/// once (first template wins) and the actor is never mailed.
#[derive(Debug, Default)]
struct MailBatch {
    targets: Vec<Target>,
}

impl MailBatch {
    fn target(&mut self, recipient: Option<&Recipient>, template: &'static str) {
        self.push(recipient, template, None);
    }

    fn target_many(&mut self, recipients: &[Recipient], template: &'static str) {
        for recipient in recipients {
            self.push(Some(recipient), template, None);
        }
    }

    fn target_reviewer(&mut self, recipients: &[Recipient], template: &'static str, name: &str, is_actionable: bool) {
        for recipient in recipients {
            self.push(Some(recipient), template, Some((name, is_actionable)));
        }
    }

    fn target_reviewers(&mut self, reviewers: &[Reviewer], template: &'static str) {
        for reviewer in reviewers {
            self.target_reviewer(&reviewer.recipients, template, &reviewer.name, reviewer.is_actionable);
        }
    }

    fn push(&mut self, recipient: Option<&Recipient>, template: &'static str, reviewer: Option<(&str, bool)>) {
        let Some(recipient) = recipient else {
            return;
        };
        if recipient.is_actor || self.targets.iter().any(|t| t.recipient.email == recipient.email) {
            return;
        }
        self.targets.push(Target {
            template,
            recipient: recipient.clone(),
            reviewer_name: reviewer.map(|(name, _)| name.to_string()),
            reviewer_is_actionable: reviewer.is_some_and(|(_, actionable)| actionable),
        });
    }
}

/// Legacy feeds reported closes as "landed" with a transaction link.
fn effective_kind(kind: &EventKind, body: &serde_json::Value) -> EventKind {
    if *kind == EventKind::RevisionLanded && body.get("transactionLink").is_some() {
        EventKind::RevisionClosed
    } else {
        kind.clone()
    }
}

fn select_targets(kind: &EventKind, body: &EventBody) -> MailBatch {
    let mut batch = MailBatch::default();
    match (kind, body) {
        (EventKind::RevisionAccepted, EventBody::Discussion(b)) => {
            batch.target(b.author.as_ref(), "accepted-as-author");
            batch.target_many(&b.reviewers, "accepted");
            batch.target_many(&b.subscribers, "accepted");
        }
        (EventKind::RevisionRequestedChanges, EventBody::Discussion(b)) => {
            batch.target(b.author.as_ref(), "requested-changes-as-author");
            batch.target_many(&b.reviewers, "requested-changes");
            batch.target_many(&b.subscribers, "requested-changes");
        }
        (EventKind::RevisionCommented, EventBody::Discussion(b)) => {
            batch.target(b.author.as_ref(), "commented");
            batch.target_many(&b.reviewers, "commented");
            batch.target_many(&b.subscribers, "commented");
        }
        (EventKind::RevisionLanded, EventBody::Discussion(b)) => {
            batch.target(b.author.as_ref(), "landed");
            batch.target_many(&b.reviewers, "landed");
            batch.target_many(&b.subscribers, "landed");
        }
        (EventKind::RevisionClosed, EventBody::Discussion(b)) => {
            batch.target(b.author.as_ref(), "closed");
            batch.target_many(&b.reviewers, "closed");
            batch.target_many(&b.subscribers, "closed");
        }
        (EventKind::RevisionAbandoned, EventBody::Discussion(b)) => {
            batch.target_many(&b.reviewers, "abandoned");
            batch.target_many(&b.subscribers, "abandoned");
        }
        (EventKind::RevisionCreated, EventBody::ReviewRequest(b)) => {
            batch.target_reviewers(&b.reviewers, "created-as-reviewer");
            batch.target_many(&b.subscribers, "created");
        }
        (EventKind::RevisionUpdated, EventBody::ReviewRequest(b)) => {
            batch.target_reviewers(&b.reviewers, "updated-as-reviewer");
            batch.target_many(&b.subscribers, "updated");
        }
        (EventKind::RevisionRequestedReview, EventBody::ReviewRequest(b)) => {
            batch.target_reviewers(&b.reviewers, "requested-review-as-reviewer");
            batch.target_many(&b.subscribers, "requested-review");
        }
        (EventKind::RevisionReclaimed, EventBody::ReviewRequest(b)) => {
            batch.target_reviewers(&b.reviewers, "reclaimed-as-reviewer");
            batch.target_many(&b.subscribers, "reclaimed");
        }
        (EventKind::RevisionCommentPinged, EventBody::Pinged(b)) => {
            batch.target(Some(&b.recipient), "pinged");
        }
        (EventKind::RevisionMetadataEdited, EventBody::MetadataEdited(b)) => {
            batch.target(b.author.as_ref(), "edited-metadata");
            for reviewer in &b.reviewers {
                let template = match reviewer.metadata_change {
                    ExistenceChange::Added => "added-as-reviewer",
                    ExistenceChange::Removed => "removed-as-reviewer",
                    ExistenceChange::NoChange => "edited-metadata-as-reviewer",
                };
                batch.target_reviewer(&reviewer.recipients, template, &reviewer.name, reviewer.is_actionable);
            }
            batch.target_many(&b.subscribers, "edited-metadata");
        }
        _ => {}
    }
    batch
}

fn subject(revision: &Revision, is_secure: bool) -> String {
    match (is_secure, &revision.bug, &revision.name) {
        // Titles of secure revisions can leak the issue; show the bug instead.
        (true, Some(bug), _) => format!("D{}: (secure bug {})", revision.revision_id, bug.bug_id),
        (true, None, _) => format!("D{}: (secure)", revision.revision_id),
        (false, _, Some(name)) => format!("D{}: {name}", revision.revision_id),
        (false, _, None) => format!("D{}", revision.revision_id),
    }
}

fn base_params(revision: &Revision, is_secure: bool) -> TemplateParams {
    TemplateParams {
        is_secure,
        revision_id: revision.revision_id,
        revision_name: revision.name.clone(),
        revision_link: revision.link.clone(),
        bug_id: revision.bug.as_ref().map(|b| b.bug_id),
        bug_link: revision.bug.as_ref().and_then(|b| b.link.clone()),
        ..Default::default()
    }
}

pub struct Renderer {
    templates: Arc<dyn TemplateEngine>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer").finish_non_exhaustive()
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(Arc::new(BuiltinTemplates))
    }
}

impl Renderer {
    pub fn new(templates: Arc<dyn TemplateEngine>) -> Self {
        Self { templates }
    }

    /// Render every message an event triggers. Unknown kinds render nothing.
    /// A failure for one recipient is recorded and the others still render.
    pub fn render(&self, event: &Event) -> Rendered {
        if !event.kind.is_known() {
            debug!(kind = %event.kind, cursor = %event.cursor, "skipping unsupported event kind");
            return Rendered::default();
        }

        let full = match event.context.as_ref() {
            Some(context) => self.render_full(event, context),
            None => Err(RenderError::NoContext),
        };
        let full_err = match full {
            Ok(rendered) => return rendered,
            Err(err) => err,
        };

        match event.minimal_context.as_ref() {
            Some(minimal) => {
                warn!(
                    cursor = %event.cursor,
                    kind = %event.kind,
                    error = %full_err,
                    "full context unusable; falling back to minimal context"
                );
                self.render_minimal(event, minimal).unwrap_or_else(|err| Rendered {
                    messages: Vec::new(),
                    faults: vec![RenderFault {
                        recipient: None,
                        error: err,
                    }],
                })
            }
            None => Rendered {
                messages: Vec::new(),
                faults: vec![RenderFault {
                    recipient: None,
                    error: full_err,
                }],
            },
        }
    }

    fn render_full(&self, event: &Event, raw: &serde_json::Value) -> Result<Rendered, RenderError> {
        let context = FullContext::deserialize(raw)?;
        let kind = effective_kind(&event.kind, &context.body);
        let body = EventBody::parse(&kind, &context.body)?;
        let batch = select_targets(&kind, &body);

        let prefix = if event.is_secure { SECURE_PREFIX } else { PUBLIC_PREFIX };
        let subject = subject(&context.revision, event.is_secure);
        let mut shared = base_params(&context.revision, event.is_secure);
        shared.actor_name = context.actor_name.clone();
        shared.main_comment_text = body.main_comment().map(|c| c.as_text.clone());
        shared.main_comment_html = body.main_comment().map(|c| c.as_html.clone());
        shared.inline_comment_count = body.inline_comments().len();
        shared.affected_files = body
            .affected_files()
            .iter()
            .map(|f| format!("{}: {}", f.change, f.path))
            .collect();
        shared.link = body.link().map(str::to_string);

        let mut rendered = Rendered::default();
        for target in batch.targets {
            let template = format!("{prefix}{}", target.template);
            let mut params = shared.clone();
            params.recipient_username = target.recipient.username.clone();
            params.recipient_timezone_offset = target.recipient.timezone_offset;
            params.reviewer_name = target.reviewer_name;
            params.reviewer_is_actionable = target.reviewer_is_actionable;
            self.push_message(event, &mut rendered, template, &target.recipient, &subject, &params);
        }
        Ok(rendered)
    }

    fn render_minimal(&self, event: &Event, raw: &serde_json::Value) -> Result<Rendered, RenderError> {
        let context = MinimalContext::deserialize(raw)?;
        let subject = format!("D{}", context.revision.revision_id);
        let shared = base_params(&context.revision, event.is_secure);

        let mut rendered = Rendered::default();
        let mut seen: Vec<&str> = Vec::new();
        for recipient in context.recipients.iter().filter(|r| !r.is_actor) {
            if seen.contains(&recipient.email.as_str()) {
                continue;
            }
            seen.push(recipient.email.as_str());
            let mut params = shared.clone();
            params.recipient_username = recipient.username.clone();
            params.recipient_timezone_offset = recipient.timezone_offset;
            self.push_message(event, &mut rendered, MINIMAL_TEMPLATE.to_string(), recipient, &subject, &params);
        }
        Ok(rendered)
    }

    fn push_message(
        &self,
        event: &Event,
        rendered: &mut Rendered,
        template: String,
        recipient: &Recipient,
        subject: &str,
        params: &TemplateParams,
    ) {
        match self.templates.render(&template, params) {
            Ok(body) => rendered.messages.push(RenderedMessage {
                key: RenderedMessage::message_key(&event.id, &recipient.email, &template),
                event_id: event.id.clone(),
                cursor: event.cursor,
                template,
                recipient: recipient.email.clone(),
                subject: subject.to_string(),
                html_body: body.html,
                text_body: body.text,
                timestamp: event.timestamp,
            }),
            Err(error) => {
                warn!(
                    cursor = %event.cursor,
                    recipient = %recipient.email,
                    %template,
                    %error,
                    "failed to render message for recipient"
                );
                rendered.faults.push(RenderFault {
                    recipient: Some(recipient.email.clone()),
                    error,
                });
            }
        }
    }
}
