use async_trait::async_trait;
use lettre::transport::smtp::Error as SmtpError;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{build_outgoing, Mailer, Sender};
use crate::error::DeliveryError;
use crate::model::RenderedMessage;

/// Sends over plain SMTP. Connections are pooled by the transport and may be
/// dropped and re-established at any time.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Sender,
}

impl fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("from", &self.sender.from.to_string())
            .finish_non_exhaustive()
    }
}

impl SmtpMailer {
    pub fn new(host: &str, port: u16, timeout: Duration, sender: Sender) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .timeout(Some(timeout))
            .build();
        Self { transport, sender }
    }
}

/// 5xx replies are permanent; 4xx, timeouts and connection trouble are not.
pub fn classify(err: SmtpError) -> DeliveryError {
    if err.is_permanent() {
        DeliveryError::Permanent(err.to_string())
    } else {
        DeliveryError::Temporary(err.to_string())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    #[instrument(skip_all, fields(to = %message.recipient, template = %message.template))]
    async fn deliver(&self, message: &RenderedMessage) -> Result<(), DeliveryError> {
        let outgoing = build_outgoing(message, &self.sender)?;
        debug!(subject = %message.subject, "sending via SMTP");
        self.transport
            .send_raw(&outgoing.envelope, &outgoing.mime)
            .await
            .map_err(classify)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::tests::message;

    #[tokio::test]
    async fn unreachable_server_is_retryable() {
        let sender = Sender::new("from@mail.test", None).unwrap();
        let mailer = SmtpMailer::new("127.0.0.1", 9, Duration::from_secs(2), sender);
        let err = mailer.deliver(&message("to@mail.test")).await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }

    #[tokio::test]
    async fn bad_recipient_fails_before_connecting() {
        let sender = Sender::new("from@mail.test", None).unwrap();
        let mailer = SmtpMailer::new("127.0.0.1", 9, Duration::from_secs(2), sender);
        let err = mailer.deliver(&message("broken")).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
