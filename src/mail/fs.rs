use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{debug, instrument};

use super::{build_outgoing, Mailer, Sender};
use crate::error::DeliveryError;
use crate::model::RenderedMessage;

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9@._+-]").expect("valid filename regex"));

/// Writes each message to disk as `.eml`, `.html` and `.text` files. Meant for
/// local development and template iteration.
#[derive(Debug)]
pub struct FsMailer {
    output_path: PathBuf,
    sender: Sender,
    index: AtomicU64,
}

impl FsMailer {
    pub async fn create(output_path: &Path, sender: Sender) -> std::io::Result<Self> {
        for sub in ["eml", "html", "text"] {
            fs::create_dir_all(output_path.join(sub)).await?;
        }
        // The debug redirect only applies to network backends.
        let sender = Sender {
            send_to: None,
            ..sender
        };
        Ok(Self {
            output_path: output_path.to_path_buf(),
            sender,
            index: AtomicU64::new(0),
        })
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}

fn file_stem(index: u64, recipient: &str) -> String {
    format!("{index}-to-{}", UNSAFE_FILENAME_CHARS.replace_all(recipient, "_"))
}

#[async_trait]
impl Mailer for FsMailer {
    #[instrument(skip_all, fields(to = %message.recipient))]
    async fn deliver(&self, message: &RenderedMessage) -> Result<(), DeliveryError> {
        let outgoing = build_outgoing(message, &self.sender)?;
        let index = self.index.fetch_add(1, Ordering::SeqCst);
        let stem = file_stem(index, &message.recipient);

        let writes = [
            (self.output_path.join("eml").join(format!("{stem}.eml")), outgoing.mime.as_slice()),
            (self.output_path.join("html").join(format!("{stem}.html")), message.html_body.as_bytes()),
            (self.output_path.join("text").join(format!("{stem}.text")), message.text_body.as_bytes()),
        ];
        for (path, contents) in writes {
            fs::write(&path, contents).await.map_err(|e| {
                DeliveryError::Temporary(format!("failed to write {}: {e}", path.display()))
            })?;
        }
        debug!(%stem, output = %self.output_path.display(), "recorded message");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fs"
    }
}
