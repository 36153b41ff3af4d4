//! Error taxonomy shared by the pipeline stages.
use crate::model::Cursor;
use thiserror::Error;

/// Failures fetching from the feed. Both variants are retried on the next tick.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("feed source unavailable: {0}")]
    Unavailable(String),
    #[error("feed source returned malformed data: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("position store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    /// Another writer already moved the cursor to or past the one being saved.
    #[error("stale cursor write: stored {stored}, attempted {attempted}")]
    StaleWrite { stored: Cursor, attempted: Cursor },
    #[error("position store already initialized at cursor {0}")]
    AlreadyInitialized(Cursor),
    /// No position has been recorded; `prepare` has not been run.
    #[error("position store not prepared; run `feed-mailer prepare` first")]
    NotInitialized,
    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Failure delivering a single rendered message.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("temporary delivery failure: {0}")]
    Temporary(String),
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Temporary(_))
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid event context: {0}")]
    Context(#[from] serde_json::Error),
    #[error("event has no usable context")]
    NoContext,
    #[error("template {0} not found")]
    MissingTemplate(String),
    #[error("template {template} failed: {reason}")]
    Template { template: String, reason: String },
}

/// Errors that escape a tick. Everything else is folded into the tick report.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    StaleWrite(StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_variant() {
        assert!(DeliveryError::Temporary("timeout".into()).is_retryable());
        assert!(!DeliveryError::Permanent("bad address".into()).is_retryable());
    }

    #[test]
    fn stale_write_message_names_both_cursors() {
        let err = StoreError::StaleWrite {
            stored: Cursor(103),
            attempted: Cursor(102),
        };
        let msg = err.to_string();
        assert!(msg.contains("103") && msg.contains("102"));
    }
}
