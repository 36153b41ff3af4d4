use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{fetch_past_empty_pages, FeedSource};
use crate::error::SourceError;
use crate::model::{Cursor, Event};

const QUERY_ENDPOINT: &str = "feed.for_email.query";
const STATUS_ENDPOINT: &str = "feed.for_email.status";

/// Fetches events from the tracking service's conduit API.
#[derive(Clone)]
pub struct RemoteFeedSource {
    http: Client,
    api_base: String,
    token: String,
}

impl fmt::Debug for RemoteFeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFeedSource")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ConduitResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_info: Option<String>,
}

impl RemoteFeedSource {
    pub fn new(host: &str, token: String, timeout: Duration) -> Result<Self, SourceError> {
        let http = Client::builder()
            .user_agent(concat!("feed-mailer/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_base: format!("{}/api", host.trim_end_matches('/')),
            token,
        })
    }

    /// POST so the token stays out of the URL.
    pub fn build_request(&self, endpoint: &str, params: Map<String, Value>) -> Result<reqwest::Request, SourceError> {
        let mut body = Map::new();
        body.insert("__conduit__".into(), json!({ "token": self.token }));
        body.extend(params);
        let encoded = Value::Object(body).to_string();
        self.http
            .post(format!("{}/{}", self.api_base, endpoint))
            .form(&[("params", encoded)])
            .build()
            .map_err(|e| SourceError::Unavailable(format!("failed to build request: {e}")))
    }

    async fn call(&self, endpoint: &str, params: Map<String, Value>) -> Result<Value, SourceError> {
        let request = self.build_request(endpoint, params)?;
        debug!(url = %request.url(), "calling feed API");

        let res = self.http.execute(request).await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Unavailable(format!("{endpoint} timed out"))
            } else {
                SourceError::Unavailable(format!("could not reach feed API: {e}"))
            }
        })?;

        let status = res.status();
        if status != StatusCode::OK {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "feed API returned non-success status");
            return Err(SourceError::Unavailable(format!(
                "{endpoint} returned {status}: {body}"
            )));
        }

        let text = res
            .text()
            .await
            .map_err(|e| SourceError::Unavailable(format!("failed to read feed response: {e}")))?;
        unwrap_conduit(&text)
    }

    async fn query_page(&self, after: Cursor, limit: u32) -> Result<Value, SourceError> {
        let mut params = Map::new();
        params.insert("storyLimit".into(), json!(limit));
        if !after.is_start() {
            params.insert("after".into(), json!(after.value()));
        }
        decode_result(self.call(QUERY_ENDPOINT, params).await?)
    }
}

/// Strip the conduit envelope, surfacing API-level errors.
pub fn unwrap_conduit(text: &str) -> Result<Value, SourceError> {
    let envelope: ConduitResponse =
        serde_json::from_str(text).map_err(|e| SourceError::Malformed(e.to_string()))?;
    if let Some(code) = envelope.error_code {
        return Err(SourceError::Unavailable(format!(
            "feed API error {code}: {}",
            envelope.error_info.unwrap_or_default()
        )));
    }
    Ok(envelope.result)
}

/// The query endpoint double-encodes its result as a JSON string.
fn decode_result(result: Value) -> Result<Value, SourceError> {
    match result {
        Value::String(inner) => {
            serde_json::from_str(&inner).map_err(|e| SourceError::Malformed(e.to_string()))
        }
        other => Ok(other),
    }
}

#[async_trait]
impl FeedSource for RemoteFeedSource {
    #[instrument(skip_all, fields(after = %after, limit = limit))]
    async fn fetch(&self, after: Cursor, limit: u32) -> Result<Vec<Event>, SourceError> {
        fetch_past_empty_pages(after, limit, |from| self.query_page(from, limit)).await
    }

    #[instrument(skip_all)]
    async fn fetch_feed_end(&self) -> Result<Cursor, SourceError> {
        let result = self.call(STATUS_ENDPOINT, Map::new()).await?;
        let key = match &result {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        key.map(Cursor)
            .ok_or_else(|| SourceError::Malformed(format!("unexpected feed end {result}")))
    }
}
