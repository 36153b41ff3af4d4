//! Feed sources: where events come from.
//!
//! Both variants share the feed's JSON result format, parsed by
//! [`parse_feed_result`]. Only the event envelope is validated here; the
//! kind-specific context is left for the renderer so that one odd event
//! cannot poison a whole batch.
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::future::Future;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::model::{Cursor, Event, EventKind};

pub mod remote;
pub mod replay;

pub use remote::RemoteFeedSource;
pub use replay::ReplayFeedSource;

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Up to `limit` events strictly after `after`, ascending by cursor.
    /// An empty vector means there is nothing new.
    async fn fetch(&self, after: Cursor, limit: u32) -> Result<Vec<Event>, SourceError>;

    /// Current end of the feed, used to seed a fresh installation.
    async fn fetch_feed_end(&self) -> Result<Cursor, SourceError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedResult {
    data: FeedData,
    #[serde(default)]
    cursor: Option<FeedCursor>,
}

/// Paging frontier: the last story the feed looked at, whether or not it
/// produced an event.
#[derive(Debug, Deserialize)]
struct FeedCursor {
    #[serde(default, deserialize_with = "de_opt_key")]
    after: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedData {
    #[serde(default)]
    story_errors: u64,
    events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    #[serde(deserialize_with = "de_key")]
    key: i64,
    #[serde(default)]
    id: Option<String>,
    event_kind: String,
    timestamp: i64,
    #[serde(default)]
    is_secure: bool,
    #[serde(default)]
    context: Option<Value>,
    #[serde(default)]
    minimal_context: Option<Value>,
}

/// Chronological keys exceed 2^53 on large installs and are sometimes sent as strings.
fn de_key<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Key {
        Num(i64),
        Str(String),
    }
    match Key::deserialize(deserializer)? {
        Key::Num(n) => Ok(n),
        Key::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn de_opt_key<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => de_key(value).map(Some).map_err(serde::de::Error::custom),
    }
}

impl From<RawEvent> for Event {
    fn from(raw: RawEvent) -> Self {
        Event {
            id: raw.id.unwrap_or_else(|| raw.key.to_string()),
            cursor: Cursor(raw.key),
            kind: EventKind::parse(&raw.event_kind),
            timestamp: raw.timestamp,
            is_secure: raw.is_secure,
            context: raw.context.filter(|c| !c.is_null()),
            minimal_context: raw.minimal_context.filter(|c| !c.is_null()),
        }
    }
}

/// One page of the feed: events plus the story frontier the feed reached.
#[derive(Debug, Default)]
pub struct FeedPage {
    pub events: Vec<Event>,
    pub frontier: Option<Cursor>,
}

/// Parse a feed result into events strictly after `after`, ascending, at most `limit`.
/// Any envelope that fails to parse discards the entire batch.
pub fn parse_feed_result(payload: &Value, after: Cursor, limit: u32) -> Result<Vec<Event>, SourceError> {
    parse_feed_page(payload, after, limit).map(|page| page.events)
}

/// Like [`parse_feed_result`], also keeping the `cursor.after` frontier.
pub fn parse_feed_page(payload: &Value, after: Cursor, limit: u32) -> Result<FeedPage, SourceError> {
    let result = FeedResult::deserialize(payload)
        .map_err(|e| SourceError::Malformed(e.to_string()))?;
    if result.data.story_errors > 0 {
        warn!(
            story_errors = result.data.story_errors,
            "feed reported errors while building events"
        );
    }

    let mut events: Vec<Event> = result.data.events.into_iter().map(Event::from).collect();
    events.sort_by_key(|e| e.cursor);

    let before = events.len();
    events.retain(|e| e.cursor > after);
    if events.len() != before {
        warn!(
            dropped = before - events.len(),
            after = %after,
            "feed returned events at or before the requested cursor"
        );
    }
    events.dedup_by_key(|e| e.cursor);
    events.truncate(limit as usize);

    let frontier = result.cursor.and_then(|c| c.after).map(Cursor);
    Ok(FeedPage { events, frontier })
}

/// Upper bound on consecutive event-less pages followed in one fetch.
pub const MAX_EMPTY_PAGES: usize = 16;

/// Query pages starting at `after` until one yields events.
///
/// The feed's limit counts stories, not events, so a window of stories that
/// produce no mail comes back empty with a frontier past `after`. Paging
/// resumes from that frontier, at most [`MAX_EMPTY_PAGES`] times, and stops
/// early when the frontier does not move.
pub async fn fetch_past_empty_pages<F, Fut>(
    after: Cursor,
    limit: u32,
    mut query: F,
) -> Result<Vec<Event>, SourceError>
where
    F: FnMut(Cursor) -> Fut,
    Fut: Future<Output = Result<Value, SourceError>>,
{
    let mut from = after;
    for _ in 0..MAX_EMPTY_PAGES {
        let payload = query(from).await?;
        let page = parse_feed_page(&payload, from, limit)?;
        if !page.events.is_empty() {
            return Ok(page.events);
        }
        match page.frontier {
            Some(next) if next > from => {
                debug!(from = %from, frontier = %next, "empty page, following feed frontier");
                from = next;
            }
            _ => return Ok(Vec::new()),
        }
    }
    warn!(
        after = %after,
        reached = %from,
        pages = MAX_EMPTY_PAGES,
        "no events within the page budget; resuming next tick"
    );
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(key: Value, kind: &str) -> Value {
        json!({
            "key": key,
            "eventKind": kind,
            "timestamp": 1_600_000_000,
            "isSecure": false,
            "context": null,
            "minimalContext": null,
        })
    }

    #[test]
    fn parses_and_orders_events() {
        let payload = json!({
            "data": {
                "storyErrors": 0,
                "events": [event(json!(103), "revision-updated"), event(json!("101"), "revision-created")],
            },
            "cursor": { "after": 103 },
        });
        let events = parse_feed_result(&payload, Cursor(100), 10).unwrap();
        let cursors: Vec<_> = events.iter().map(|e| e.cursor).collect();
        assert_eq!(cursors, vec![Cursor(101), Cursor(103)]);
        assert_eq!(events[0].id, "101");
        assert_eq!(events[0].kind, EventKind::RevisionCreated);
        assert!(events[0].context.is_none());
    }

    #[test]
    fn drops_events_not_after_cursor_and_applies_limit() {
        let payload = json!({
            "data": {
                "events": [
                    event(json!(99), "revision-created"),
                    event(json!(101), "revision-created"),
                    event(json!(102), "revision-created"),
                    event(json!(103), "revision-created"),
                ],
            },
        });
        let events = parse_feed_result(&payload, Cursor(100), 2).unwrap();
        let cursors: Vec<_> = events.iter().map(|e| e.cursor).collect();
        assert_eq!(cursors, vec![Cursor(101), Cursor(102)]);
    }

    #[test]
    fn unknown_kinds_survive_parsing() {
        let payload = json!({ "data": { "events": [event(json!(5), "task-moved")] } });
        let events = parse_feed_result(&payload, Cursor::START, 10).unwrap();
        assert_eq!(events[0].kind, EventKind::Unknown("task-moved".into()));
    }

    #[test]
    fn malformed_envelope_discards_batch() {
        let payload = json!({
            "data": {
                "events": [event(json!(101), "revision-created"), { "key": 102 }],
            },
        });
        let err = parse_feed_result(&payload, Cursor(100), 10).unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));

        let err = parse_feed_result(&json!({ "nope": true }), Cursor(100), 10).unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[test]
    fn page_keeps_frontier_as_number_or_string() {
        let page = parse_feed_page(
            &json!({ "data": { "events": [] }, "cursor": { "after": "104" } }),
            Cursor(100),
            3,
        )
        .unwrap();
        assert!(page.events.is_empty());
        assert_eq!(page.frontier, Some(Cursor(104)));

        let page = parse_feed_page(
            &json!({ "data": { "events": [] }, "cursor": { "after": null } }),
            Cursor(100),
            3,
        )
        .unwrap();
        assert_eq!(page.frontier, None);
    }

    /// Stories 101..=103 produce nothing; 104 produces one event.
    fn story_window(from: Cursor, limit: u32) -> Value {
        let last = from.value() + limit as i64;
        let events: Vec<Value> = (from.value() + 1..=last)
            .filter(|key| *key == 104)
            .map(|key| event(json!(key), "revision-created"))
            .collect();
        json!({ "data": { "events": events }, "cursor": { "after": last } })
    }

    #[tokio::test]
    async fn empty_story_window_pages_forward_from_frontier() {
        let mut asked = Vec::new();
        let events = fetch_past_empty_pages(Cursor(100), 3, |from| {
            asked.push(from);
            async move { Ok(story_window(from, 3)) }
        })
        .await
        .unwrap();

        assert_eq!(asked, vec![Cursor(100), Cursor(103)]);
        let cursors: Vec<_> = events.iter().map(|e| e.cursor).collect();
        assert_eq!(cursors, vec![Cursor(104)]);
    }

    #[tokio::test]
    async fn stalled_frontier_stops_paging() {
        let mut calls = 0;
        let events = fetch_past_empty_pages(Cursor(100), 3, |_| {
            calls += 1;
            async { Ok(json!({ "data": { "events": [] }, "cursor": { "after": 100 } })) }
        })
        .await
        .unwrap();
        assert!(events.is_empty());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn paging_is_bounded() {
        let mut calls = 0;
        let events = fetch_past_empty_pages(Cursor(0), 10, |from| {
            calls += 1;
            let next = from.value() + 10;
            async move { Ok(json!({ "data": { "events": [] }, "cursor": { "after": next } })) }
        })
        .await
        .unwrap();
        assert!(events.is_empty());
        assert_eq!(calls, MAX_EMPTY_PAGES);
    }
}
