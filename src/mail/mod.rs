//! Delivery backends. Exactly one is chosen from configuration at startup.
use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::message::{Mailbox, MultiPart};
use lettre::{Address, Message};
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::{Backend, Config};
use crate::error::DeliveryError;
use crate::model::RenderedMessage;

pub mod api;
pub mod fs;
pub mod smtp;

pub use api::ApiMailer;
pub use fs::FsMailer;
pub use smtp::SmtpMailer;

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Hand one message off for sending.
    async fn deliver(&self, message: &RenderedMessage) -> Result<(), DeliveryError>;

    fn name(&self) -> &'static str;
}

/// Sender identity plus the optional debug redirect shared by the network backends.
#[derive(Debug, Clone)]
pub struct Sender {
    pub from: Mailbox,
    pub send_to: Option<Address>,
}

impl Sender {
    pub fn new(from_address: &str, send_to: Option<&str>) -> Result<Self> {
        let from = from_address
            .parse::<Mailbox>()
            .with_context(|| format!("invalid email.from_address {from_address:?}"))?;
        let send_to = send_to
            .map(|addr| addr.parse::<Address>())
            .transpose()
            .context("invalid email.send_to")?;
        Ok(Self { from, send_to })
    }
}

/// A message ready for the wire: envelope plus the MIME bytes.
#[derive(Debug)]
pub struct Outgoing {
    pub envelope: Envelope,
    pub destination: Address,
    pub mime: Vec<u8>,
}

/// Build the `multipart/alternative` MIME message. A recipient that does not
/// parse as an address can never be delivered, so that is a permanent failure.
pub fn build_outgoing(message: &RenderedMessage, sender: &Sender) -> Result<Outgoing, DeliveryError> {
    let to = message
        .recipient
        .parse::<Mailbox>()
        .map_err(|e| DeliveryError::Permanent(format!("invalid recipient {:?}: {e}", message.recipient)))?;

    let subject = match &sender.send_to {
        Some(_) => format!("|{}| {}", message.recipient, message.subject),
        None => message.subject.clone(),
    };
    let mime = Message::builder()
        .from(sender.from.clone())
        .to(to.clone())
        .subject(subject)
        .date(SystemTime::from(message.sent_at()))
        .multipart(MultiPart::alternative_plain_html(
            message.text_body.clone(),
            message.html_body.clone(),
        ))
        .map_err(|e| DeliveryError::Permanent(format!("failed to build message: {e}")))?
        .formatted();

    let destination = sender.send_to.clone().unwrap_or(to.email);
    let envelope = Envelope::new(Some(sender.from.email.clone()), vec![destination.clone()])
        .map_err(|e| DeliveryError::Permanent(format!("invalid envelope: {e}")))?;
    Ok(Outgoing {
        envelope,
        destination,
        mime,
    })
}

/// Construct the configured backend.
pub async fn from_config(cfg: &Config) -> Result<Arc<dyn Mailer>> {
    let sender = Sender::new(&cfg.email.from_address, cfg.email.send_to.as_deref())?;
    let mailer: Arc<dyn Mailer> = match &cfg.email.backend {
        Backend::Smtp(smtp) => Arc::new(SmtpMailer::new(
            &smtp.host,
            smtp.port,
            cfg.delivery_timeout(),
            sender,
        )),
        Backend::Api(api) => Arc::new(ApiMailer::new(
            &api.endpoint,
            api.key_id.clone(),
            api.secret.clone(),
            cfg.delivery_timeout(),
            sender,
        )?),
        Backend::Fs(fs_backend) => Arc::new(FsMailer::create(&fs_backend.output_path, sender).await?),
    };
    Ok(mailer)
}
