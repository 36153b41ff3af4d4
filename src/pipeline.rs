//! One tick: load cursor, fetch a batch, render, deliver, persist.
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::db::PositionStore;
use crate::error::{DeliveryError, PipelineError, SourceError, StoreError};
use crate::mail::Mailer;
use crate::model::{Cursor, Event, RenderedMessage};
use crate::render::Renderer;
use crate::source::FeedSource;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_limit: u32,
    pub fetch_timeout: Duration,
    pub delivery_timeout: Duration,
    pub delivery_concurrency: usize,
    pub temporary_error_retries: u32,
    pub retry_delay: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_limit: 100,
            fetch_timeout: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(30),
            delivery_concurrency: 1,
            temporary_error_retries: 0,
            retry_delay: Duration::from_secs(30),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            batch_limit: cfg.feed.batch_limit,
            fetch_timeout: cfg.request_timeout(),
            delivery_timeout: cfg.delivery_timeout(),
            delivery_concurrency: cfg.email.delivery_concurrency.max(1),
            temporary_error_retries: cfg.email.temporary_error_retries,
            retry_delay: cfg.retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Every event processed; also an empty batch.
    Success,
    /// Batch processed, but some messages failed permanently or did not render.
    Partial,
    /// Stopped early on a retryable failure.
    Aborted,
}

impl TickOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TickOutcome::Success => "success",
            TickOutcome::Partial => "partial",
            TickOutcome::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum AbortReason {
    Source(SourceError),
    Store(StoreError),
    Delivery { cursor: Cursor, error: DeliveryError },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Source(err) => write!(f, "{err}"),
            AbortReason::Store(err) => write!(f, "{err}"),
            AbortReason::Delivery { cursor, error } => write!(f, "event {cursor}: {error}"),
        }
    }
}

#[derive(Debug)]
pub struct TickReport {
    pub outcome: TickOutcome,
    pub from_cursor: Cursor,
    /// Cursor persisted at the end of the tick.
    pub to_cursor: Cursor,
    pub events: usize,
    pub delivered: usize,
    pub permanent_failures: usize,
    pub render_faults: usize,
    pub abort: Option<AbortReason>,
}

impl TickReport {
    fn new(from: Cursor) -> Self {
        Self {
            outcome: TickOutcome::Success,
            from_cursor: from,
            to_cursor: from,
            events: 0,
            delivered: 0,
            permanent_failures: 0,
            render_faults: 0,
            abort: None,
        }
    }

    fn aborted(mut self, reason: AbortReason) -> Self {
        self.outcome = TickOutcome::Aborted;
        self.abort = Some(reason);
        self
    }
}

#[derive(Debug, Default)]
struct EventDelivery {
    delivered: usize,
    permanent_failures: usize,
    retryable: Option<DeliveryError>,
}

pub struct Pipeline {
    source: Arc<dyn FeedSource>,
    renderer: Renderer,
    mailer: Arc<dyn Mailer>,
    store: Arc<dyn PositionStore>,
    settings: PipelineSettings,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("mailer", &self.mailer.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn FeedSource>,
        renderer: Renderer,
        mailer: Arc<dyn Mailer>,
        store: Arc<dyn PositionStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            renderer,
            mailer,
            store,
            settings,
        }
    }

    /// Run one tick. Only a stale cursor write escapes as an error; every
    /// other failure is folded into the report.
    #[instrument(skip_all)]
    pub async fn tick(&self) -> Result<TickReport, PipelineError> {
        let report = self.run_tick().await?;
        log_report(&report);
        Ok(report)
    }

    async fn run_tick(&self) -> Result<TickReport, PipelineError> {
        let from = match self.store.load().await {
            Ok(cursor) => cursor,
            Err(err) => return store_failure(TickReport::new(Cursor::START), err),
        };
        let mut report = TickReport::new(from);

        let events = match self.fetch(from).await {
            Ok(events) => events,
            Err(err) => return Ok(report.aborted(AbortReason::Source(err))),
        };
        if events.is_empty() {
            debug!(cursor = %from, "no new events");
            return Ok(report);
        }

        let mut processed: Option<Cursor> = None;
        for event in &events {
            if event.cursor <= from {
                continue;
            }
            report.events += 1;
            let rendered = self.renderer.render(event);
            for fault in &rendered.faults {
                warn!(
                    cursor = %event.cursor,
                    kind = %event.kind,
                    recipient = fault.recipient.as_deref().unwrap_or("-"),
                    error = %fault.error,
                    "failed to render message"
                );
            }
            report.render_faults += rendered.faults.len();

            let outcome = self.deliver_event(event, &rendered.messages).await;
            report.delivered += outcome.delivered;
            report.permanent_failures += outcome.permanent_failures;

            if let Some(error) = outcome.retryable {
                // Everything before this event is done; this one and the rest
                // are retried on the next tick.
                if let Some(done) = processed {
                    if let Err(err) = self.store.save(done).await {
                        return store_failure(report, err);
                    }
                    report.to_cursor = done;
                }
                return Ok(report.aborted(AbortReason::Delivery {
                    cursor: event.cursor,
                    error,
                }));
            }
            processed = Some(event.cursor);
        }

        if let Some(highest) = processed {
            if let Err(err) = self.store.save(highest).await {
                return store_failure(report, err);
            }
            report.to_cursor = highest;
        }
        if report.permanent_failures > 0 || report.render_faults > 0 {
            report.outcome = TickOutcome::Partial;
        }
        Ok(report)
    }

    async fn fetch(&self, after: Cursor) -> Result<Vec<Event>, SourceError> {
        match timeout(
            self.settings.fetch_timeout,
            self.source.fetch(after, self.settings.batch_limit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SourceError::Unavailable(format!(
                "fetch timed out after {:?}",
                self.settings.fetch_timeout
            ))),
        }
    }

    /// Deliver all messages of one event with bounded concurrency. Stops at
    /// the first retryable failure; in-flight deliveries are abandoned.
    async fn deliver_event(&self, event: &Event, messages: &[RenderedMessage]) -> EventDelivery {
        let mut outcome = EventDelivery::default();
        let mut results = stream::iter(messages)
            .map(|message| async move { (message, self.deliver_one(message).await) })
            .buffer_unordered(self.settings.delivery_concurrency.max(1));

        while let Some((message, result)) = results.next().await {
            match result {
                Ok(()) => outcome.delivered += 1,
                Err(err) if err.is_retryable() => {
                    warn!(
                        cursor = %event.cursor,
                        to = %message.recipient,
                        error = %err,
                        "retryable delivery failure; aborting tick"
                    );
                    outcome.retryable = Some(err);
                    break;
                }
                Err(err) => {
                    warn!(
                        cursor = %event.cursor,
                        to = %message.recipient,
                        template = %message.template,
                        error = %err,
                        "permanent delivery failure; skipping message"
                    );
                    outcome.permanent_failures += 1;
                }
            }
        }
        outcome
    }

    async fn deliver_one(&self, message: &RenderedMessage) -> Result<(), DeliveryError> {
        let mut attempt = 0;
        loop {
            let result = match timeout(self.settings.delivery_timeout, self.mailer.deliver(message)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Temporary(format!(
                    "delivery timed out after {:?}",
                    self.settings.delivery_timeout
                ))),
            };
            match result {
                Err(err) if err.is_retryable() && attempt < self.settings.temporary_error_retries => {
                    attempt += 1;
                    debug!(to = %message.recipient, attempt, error = %err, "retrying delivery");
                    sleep(self.settings.retry_delay).await;
                }
                other => return other,
            }
        }
    }
}

fn store_failure(report: TickReport, err: StoreError) -> Result<TickReport, PipelineError> {
    match err {
        StoreError::StaleWrite { .. } => Err(PipelineError::StaleWrite(err)),
        other => Ok(report.aborted(AbortReason::Store(other))),
    }
}

fn log_report(report: &TickReport) {
    match &report.abort {
        None => info!(
            from_cursor = %report.from_cursor,
            to_cursor = %report.to_cursor,
            events = report.events,
            delivered = report.delivered,
            permanent_failures = report.permanent_failures,
            render_faults = report.render_faults,
            outcome = %report.outcome,
            "tick finished"
        ),
        Some(reason) => warn!(
            from_cursor = %report.from_cursor,
            to_cursor = %report.to_cursor,
            events = report.events,
            delivered = report.delivered,
            permanent_failures = report.permanent_failures,
            render_faults = report.render_faults,
            outcome = %report.outcome,
            reason = %reason,
            "tick finished"
        ),
    }
}
