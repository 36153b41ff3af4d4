#![allow(dead_code)]

use async_trait::async_trait;
use feed_mailer::db::{self, PositionStore};
use feed_mailer::error::{DeliveryError, SourceError};
use feed_mailer::mail::Mailer;
use feed_mailer::model::{Cursor, Event, EventKind, RenderedMessage};
use feed_mailer::pipeline::{Pipeline, PipelineSettings};
use feed_mailer::render::Renderer;
use feed_mailer::source::FeedSource;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub async fn setup_pool() -> db::Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

fn recipient(name: &str) -> Value {
    json!({ "email": format!("{name}@mail.test"), "username": name, "timezoneOffset": 0, "isActor": false })
}

/// A `revision-commented` event whose reviewers are `reviewers`, in order.
pub fn commented(key: i64, reviewers: &[&str]) -> Event {
    let reviewers: Vec<Value> = reviewers.iter().map(|r| recipient(r)).collect();
    Event {
        id: key.to_string(),
        cursor: Cursor(key),
        kind: EventKind::RevisionCommented,
        timestamp: 1_700_000_000 + key,
        is_secure: false,
        context: Some(json!({
            "actorName": "actor",
            "revision": { "revisionId": 42, "name": "Speed up the thing", "link": "https://tracker.test/D42" },
            "body": {
                "mainCommentMessage": { "asText": "looks good", "asHtml": "<p>looks good</p>" },
                "transactionLink": format!("https://tracker.test/D42#{key}"),
                "reviewers": reviewers,
            },
        })),
        minimal_context: None,
    }
}

pub fn unknown(key: i64) -> Event {
    Event {
        id: key.to_string(),
        cursor: Cursor(key),
        kind: EventKind::parse("task-created"),
        timestamp: 1_700_000_000 + key,
        is_secure: false,
        context: Some(json!({ "task": 1 })),
        minimal_context: None,
    }
}

/// Returns the same events on every fetch, honoring `after` and `limit`.
#[derive(Clone, Default)]
pub struct StaticSource {
    events: Arc<Mutex<Vec<Event>>>,
    fetches: Arc<Mutex<Vec<Cursor>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl StaticSource {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events: Arc::new(Mutex::new(events)),
            ..Default::default()
        }
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().await = unavailable;
    }

    pub async fn fetches(&self) -> Vec<Cursor> {
        self.fetches.lock().await.clone()
    }
}

#[async_trait]
impl FeedSource for StaticSource {
    async fn fetch(&self, after: Cursor, limit: u32) -> Result<Vec<Event>, SourceError> {
        self.fetches.lock().await.push(after);
        if *self.unavailable.lock().await {
            return Err(SourceError::Unavailable("connection refused".into()));
        }
        Ok(self
            .events
            .lock()
            .await
            .iter()
            .filter(|e| e.cursor > after)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn fetch_feed_end(&self) -> Result<Cursor, SourceError> {
        Ok(self
            .events
            .lock()
            .await
            .last()
            .map_or(Cursor::START, |e| e.cursor))
    }
}

/// Records every delivery attempt; fails the ones it was told to.
#[derive(Clone, Default)]
pub struct RecordingMailer {
    attempts: Arc<Mutex<Vec<(Cursor, String)>>>,
    failures: Arc<Mutex<HashMap<(Cursor, String), bool>>>,
}

impl RecordingMailer {
    /// Make deliveries of event `cursor` to `name@mail.test` fail.
    pub async fn fail(&self, cursor: i64, name: &str, retryable: bool) {
        self.failures
            .lock()
            .await
            .insert((Cursor(cursor), format!("{name}@mail.test")), retryable);
    }

    pub async fn heal(&self) {
        self.failures.lock().await.clear();
    }

    pub async fn attempts(&self) -> Vec<(Cursor, String)> {
        self.attempts.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn deliver(&self, message: &RenderedMessage) -> Result<(), DeliveryError> {
        self.attempts
            .lock()
            .await
            .push((message.cursor, message.recipient.clone()));
        match self
            .failures
            .lock()
            .await
            .get(&(message.cursor, message.recipient.clone()))
        {
            Some(true) => Err(DeliveryError::Temporary("451 mailbox busy".into())),
            Some(false) => Err(DeliveryError::Permanent("550 no such user".into())),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

pub fn pipeline(
    source: &StaticSource,
    mailer: &RecordingMailer,
    store: Arc<dyn PositionStore>,
) -> Pipeline {
    Pipeline::new(
        Arc::new(source.clone()),
        Renderer::default(),
        Arc::new(mailer.clone()),
        store,
        PipelineSettings::default(),
    )
}
