use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::info;

use super::{parse_feed_result, FeedSource};
use crate::error::SourceError;
use crate::model::{Cursor, Event};

/// Serves a canned batch exactly once per process, then nothing.
/// The requested cursor and limit are ignored.
#[derive(Debug)]
pub struct ReplayFeedSource {
    pending: Mutex<Option<Vec<Event>>>,
}

impl ReplayFeedSource {
    pub fn from_payload(payload: &Value) -> Result<Self, SourceError> {
        let events = parse_feed_result(payload, Cursor(i64::MIN), u32::MAX)?;
        Ok(Self {
            pending: Mutex::new(Some(events)),
        })
    }

    pub async fn from_file(path: &Path) -> Result<Self, SourceError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            SourceError::Unavailable(format!("failed to read {}: {e}", path.display()))
        })?;
        let payload: Value =
            serde_json::from_str(&text).map_err(|e| SourceError::Malformed(e.to_string()))?;
        let source = Self::from_payload(&payload)?;
        info!(path = %path.display(), "loaded replay feed");
        Ok(source)
    }
}

#[async_trait]
impl FeedSource for ReplayFeedSource {
    async fn fetch(&self, _after: Cursor, _limit: u32) -> Result<Vec<Event>, SourceError> {
        Ok(self.pending.lock().await.take().unwrap_or_default())
    }

    async fn fetch_feed_end(&self) -> Result<Cursor, SourceError> {
        Ok(Cursor::START)
    }
}
