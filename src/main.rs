use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use feed_mailer::config::{self, Config, LogFormat};
use feed_mailer::db::{self, MemoryPositionStore, PositionStore, SqlitePositionStore};
use feed_mailer::mail;
use feed_mailer::model::Cursor;
use feed_mailer::pipeline::{Pipeline, PipelineSettings};
use feed_mailer::render::Renderer;
use feed_mailer::source::{FeedSource, RemoteFeedSource, ReplayFeedSource};
use feed_mailer::worker::{RunMode, Worker};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file (falls back to config.yaml)
    #[arg(long, global = true, env = "FEED_MAILER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the schema and record the feed position to start from.
    Prepare {
        /// Start after this cursor instead of the current end of the feed
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..))]
        cursor: Option<i64>,
    },
    /// Apply pending schema migrations.
    Migrate,
    /// Poll the feed and send notifications.
    Service {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(args.config.as_deref()).context("failed to load configuration")?;
    init_tracing(cfg.app.log_format);
    cfg.ensure_dirs()?;

    match args.command {
        Command::Prepare { cursor } => prepare(&cfg, cursor).await,
        Command::Migrate => migrate(&cfg).await,
        Command::Service { once } => service(&cfg, once).await,
    }
}

async fn open_pool(cfg: &Config) -> Result<db::Pool> {
    let url = cfg.database_url();
    db::init_pool(&url)
        .await
        .with_context(|| format!("failed to open position store at {url}"))
}

async fn migrate(cfg: &Config) -> Result<()> {
    let pool = open_pool(cfg).await?;
    let position = db::migrate_prepared(&pool)
        .await
        .context("refusing to migrate")?;
    info!(cursor = %position.last_cursor, "migrations applied");
    Ok(())
}

async fn prepare(cfg: &Config, cursor: Option<i64>) -> Result<()> {
    let pool = open_pool(cfg).await?;
    db::run_migrations(&pool).await?;
    if let Some(position) = db::fetch_position(&pool).await? {
        bail!(
            "already prepared at cursor {}; delete the position to start over",
            position.last_cursor
        );
    }

    let start = match cursor {
        Some(cursor) => Cursor(cursor),
        None => build_source(cfg)
            .await?
            .fetch_feed_end()
            .await
            .context("failed to read the current end of the feed")?,
    };
    db::insert_position(&pool, start).await?;
    info!(cursor = %start, "position store prepared");
    Ok(())
}

async fn build_source(cfg: &Config) -> Result<Arc<dyn FeedSource>> {
    let source: Arc<dyn FeedSource> = match &cfg.feed.replay_file {
        Some(path) => {
            warn!(path = %path.display(), "replaying events from file");
            Arc::new(ReplayFeedSource::from_file(path).await?)
        }
        None => Arc::new(RemoteFeedSource::new(
            cfg.feed_host(),
            cfg.feed.token.clone(),
            cfg.request_timeout(),
        )?),
    };
    Ok(source)
}

async fn build_store(cfg: &Config) -> Result<Arc<dyn PositionStore>> {
    // Diagnostic runs never touch the durable cursor.
    if let Some(key) = cfg.feed.since_key {
        warn!(cursor = key, "running from a fixed cursor with a non-durable store");
        return Ok(Arc::new(MemoryPositionStore::new(Cursor(key))));
    }
    if cfg.feed.replay_file.is_some() {
        return Ok(Arc::new(MemoryPositionStore::new(cfg.start_cursor())));
    }

    let pool = open_pool(cfg).await?;
    // A durable run never starts from the configured seed; `prepare` records it.
    db::require_position(&pool).await?;
    let store = SqlitePositionStore::new(pool, cfg.start_cursor());
    let cursor = store.load().await.context("position store unreachable")?;
    info!(%cursor, "loaded feed position");
    Ok(Arc::new(store))
}

async fn service(cfg: &Config, once: bool) -> Result<()> {
    let source = build_source(cfg).await?;
    let store = build_store(cfg).await?;
    let mailer = mail::from_config(cfg).await?;
    info!(backend = mailer.name(), "delivery backend ready");

    let pipeline = Pipeline::new(
        source,
        Renderer::default(),
        mailer,
        store,
        PipelineSettings::from_config(cfg),
    );
    let mode = if once || cfg.is_run_once() {
        RunMode::Once
    } else {
        RunMode::Continuous {
            poll_interval: cfg.poll_interval(),
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let mut worker = Worker::new(mode);
    match worker.run(&pipeline, shutdown).await {
        Ok(summary) => {
            info!(ticks = summary.ticks, "service finished");
            Ok(())
        }
        Err(err) => {
            error!(%err, "another writer moved the feed position; stopping");
            Err(err.into())
        }
    }
}

async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    token.cancel();
}
