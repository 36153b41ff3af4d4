//! Template seam. The renderer decides who gets which template; an engine
//! turns a template name plus parameters into HTML and text bodies.
use crate::error::RenderError;

pub const PUBLIC_PREFIX: &str = "public/";
pub const SECURE_PREFIX: &str = "secure/";
pub const MINIMAL_TEMPLATE: &str = "minimal";

/// Everything a template may reference.
#[derive(Debug, Clone, Default)]
pub struct TemplateParams {
    pub is_secure: bool,
    pub actor_name: String,
    pub recipient_username: String,
    pub recipient_timezone_offset: i32,
    pub revision_id: i64,
    pub revision_name: Option<String>,
    pub revision_link: String,
    pub bug_id: Option<i64>,
    pub bug_link: Option<String>,
    pub reviewer_name: Option<String>,
    pub reviewer_is_actionable: bool,
    pub main_comment_text: Option<String>,
    pub main_comment_html: Option<String>,
    pub inline_comment_count: usize,
    pub affected_files: Vec<String>,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedBody {
    pub html: String,
    pub text: String,
}

pub trait TemplateEngine: Send + Sync {
    fn render(&self, template: &str, params: &TemplateParams) -> Result<RenderedBody, RenderError>;
}

/// Plain built-in templates: one summary sentence per template plus the
/// comment, file list and links.
#[derive(Debug, Clone, Default)]
pub struct BuiltinTemplates;

fn summary(name: &str, p: &TemplateParams) -> Option<String> {
    let actor = &p.actor_name;
    let as_reviewer = |verb: &str| match (&p.reviewer_name, p.reviewer_is_actionable) {
        (Some(group), true) => format!("{actor} {verb} and is waiting on {group}'s review."),
        (Some(group), false) => format!("{actor} {verb}; {group} is a reviewer."),
        (None, _) => format!("{actor} {verb}."),
    };
    let line = match name {
        "created" => format!("{actor} created this revision."),
        "created-as-reviewer" => as_reviewer("created this revision"),
        "updated" => format!("{actor} updated this revision."),
        "updated-as-reviewer" => as_reviewer("updated this revision"),
        "requested-review" => format!("{actor} requested review of this revision."),
        "requested-review-as-reviewer" => as_reviewer("requested your review"),
        "reclaimed" => format!("{actor} reclaimed this revision."),
        "reclaimed-as-reviewer" => as_reviewer("reclaimed this revision"),
        "accepted" => format!("{actor} accepted this revision."),
        "accepted-as-author" => format!("{actor} accepted your revision."),
        "commented" => format!("{actor} commented on this revision."),
        "requested-changes" => format!("{actor} requested changes to this revision."),
        "requested-changes-as-author" => format!("{actor} requested changes to your revision."),
        "landed" => format!("{actor} landed this revision."),
        "closed" => format!("{actor} closed this revision."),
        "abandoned" => format!("{actor} abandoned this revision."),
        "pinged" => format!("{actor} mentioned you in a comment."),
        "edited-metadata" => format!("{actor} edited the details of this revision."),
        "edited-metadata-as-reviewer" => as_reviewer("edited the details of this revision"),
        "added-as-reviewer" => as_reviewer("added you as a reviewer"),
        "removed-as-reviewer" => format!("{actor} removed you as a reviewer."),
        MINIMAL_TEMPLATE => "An (unknown) action occurred on this revision.".to_string(),
        _ => return None,
    };
    Some(line)
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

impl TemplateEngine for BuiltinTemplates {
    fn render(&self, template: &str, p: &TemplateParams) -> Result<RenderedBody, RenderError> {
        let name = template
            .strip_prefix(PUBLIC_PREFIX)
            .or_else(|| template.strip_prefix(SECURE_PREFIX))
            .unwrap_or(template);
        let line = summary(name, p).ok_or_else(|| RenderError::MissingTemplate(template.to_string()))?;

        let mut text = format!("Hi {},\n\n{line}\n", p.recipient_username);
        let mut html = format!(
            "<p>Hi {},</p>\n<p class=\"event-summary\">{}</p>\n",
            escape_html(&p.recipient_username),
            escape_html(&line)
        );

        // Comment text never appears in secure mail.
        if !p.is_secure {
            if let Some(comment) = &p.main_comment_text {
                text.push_str(&format!("\n{comment}\n"));
            }
            if let Some(comment) = &p.main_comment_html {
                html.push_str(&format!("<div class=\"event-content\">{comment}</div>\n"));
            }
        }
        if p.inline_comment_count > 0 {
            let plural = if p.inline_comment_count == 1 { "" } else { "s" };
            let note = format!("{} inline comment{plural}.", p.inline_comment_count);
            text.push_str(&format!("\n{note}\n"));
            html.push_str(&format!("<p>{note}</p>\n"));
        }
        if !p.affected_files.is_empty() {
            text.push_str("\nFiles:\n");
            html.push_str("<ul class=\"affected-files\">\n");
            for file in &p.affected_files {
                text.push_str(&format!("  {file}\n"));
                html.push_str(&format!("<li>{}</li>\n", escape_html(file)));
            }
            html.push_str("</ul>\n");
        }
        if let Some(link) = &p.link {
            text.push_str(&format!("\nView: {link}\n"));
            html.push_str(&format!("<p><a href=\"{0}\">{0}</a></p>\n", escape_html(link)));
        }

        let title = match (&p.revision_name, p.is_secure) {
            (Some(name), false) => format!("D{}: {name}", p.revision_id),
            _ => format!("D{}", p.revision_id),
        };
        text.push_str(&format!("\n--\n{title}\n{}\n", p.revision_link));
        html.push_str(&format!(
            "<p class=\"revision\"><a href=\"{}\">{}</a></p>\n",
            escape_html(&p.revision_link),
            escape_html(&title)
        ));
        if let (Some(bug_id), Some(bug_link)) = (p.bug_id, &p.bug_link) {
            text.push_str(&format!("Bug {bug_id}: {bug_link}\n"));
            html.push_str(&format!(
                "<p class=\"bug\"><a href=\"{}\">Bug {bug_id}</a></p>\n",
                escape_html(bug_link)
            ));
        }

        Ok(RenderedBody { html, text })
    }
}
