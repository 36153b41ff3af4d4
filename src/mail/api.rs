use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{build_outgoing, Mailer, Sender};
use crate::error::DeliveryError;
use crate::model::RenderedMessage;

/// Sends through a vendor HTTP API that accepts raw MIME, authenticated with
/// an access key pair.
#[derive(Clone)]
pub struct ApiMailer {
    http: Client,
    endpoint: Url,
    key_id: String,
    secret: String,
    sender: Sender,
}

impl fmt::Debug for ApiMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiMailer")
            .field("endpoint", &self.endpoint)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendRawRequest<'a> {
    pub source: String,
    pub destinations: Vec<String>,
    pub raw_message: RawMessage<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawMessage<'a> {
    pub data: &'a str,
}

impl ApiMailer {
    pub fn new(
        endpoint: &str,
        key_id: String,
        secret: String,
        timeout: Duration,
        sender: Sender,
    ) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        let http = Client::builder()
            .user_agent(concat!("feed-mailer/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            key_id,
            secret,
            sender,
        })
    }

    pub fn build_request(&self, message: &RenderedMessage) -> Result<reqwest::Request, DeliveryError> {
        let outgoing = build_outgoing(message, &self.sender)?;
        let data = String::from_utf8_lossy(&outgoing.mime);
        let body = SendRawRequest {
            source: self.sender.from.email.to_string(),
            destinations: vec![outgoing.destination.to_string()],
            raw_message: RawMessage { data: &data },
        };
        self.http
            .post(self.endpoint.clone())
            .basic_auth(&self.key_id, Some(&self.secret))
            .json(&body)
            .build()
            .map_err(|e| DeliveryError::Permanent(format!("failed to build request: {e}")))
    }
}

/// Throttling and server faults may clear up; other client errors will not.
pub fn classify_status(status: StatusCode, body: &str) -> Option<DeliveryError> {
    if status.is_success() {
        return None;
    }
    let reason = format!("mail API returned {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Some(DeliveryError::Temporary(reason))
    } else {
        Some(DeliveryError::Permanent(reason))
    }
}

#[async_trait]
impl Mailer for ApiMailer {
    #[instrument(skip_all, fields(to = %message.recipient, template = %message.template))]
    async fn deliver(&self, message: &RenderedMessage) -> Result<(), DeliveryError> {
        let request = self.build_request(message)?;
        debug!(url = %request.url(), "sending via mail API");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| DeliveryError::Temporary(format!("could not reach mail API: {e}")))?;
        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let body = res.text().await.unwrap_or_default();
        warn!(%status, "mail API rejected message");
        match classify_status(status, &body) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "api"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::tests::message;

    fn mailer() -> ApiMailer {
        let sender = Sender::new("from@mail.test", None).unwrap();
        ApiMailer::new(
            "http://127.0.0.1:9/send",
            "key".into(),
            "secret".into(),
            Duration::from_secs(2),
            sender,
        )
        .unwrap()
    }

    #[test]
    fn build_request_authenticates_and_carries_raw_mime() {
        let request = mailer().build_request(&message("to@mail.test")).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert!(request
            .headers()
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .unwrap()
            .starts_with("Basic "));
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["Source"], "from@mail.test");
        assert_eq!(json["Destinations"][0], "to@mail.test");
        assert!(json["RawMessage"]["Data"]
            .as_str()
            .unwrap()
            .contains("phabricator subject"));
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::OK, "").is_none());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "")
            .unwrap()
            .is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "")
            .unwrap()
            .is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "bad address")
            .unwrap()
            .is_retryable());
    }

    #[test]
    fn debug_output_hides_secret() {
        let rendered = format!("{:?}", mailer());
        assert!(!rendered.contains("secret"));
    }

    #[tokio::test]
    async fn unreachable_api_is_retryable() {
        let err = mailer().deliver(&message("to@mail.test")).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
