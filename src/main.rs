use anyhow::Context;
use clap::Parser;
use goldbot::api::DerivFeed;
use goldbot::db::{MemoryStore, PostgresStore, Store};
use goldbot::execution::{
    spawn_position_tracker, FeedManager, MonitorSupervisor, PositionManager, SignalPipeline,
    TickBroadcaster,
};
use goldbot::indicators::IndicatorEngine;
use goldbot::notify::{LogNotifier, Notifier, TelegramNotifier};
use goldbot::risk::RiskGate;
use goldbot::strategy::SignalEngine;
use goldbot::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Parser)]
#[command(
    name = "goldbot",
    version,
    about = "Real-time XAUUSD signal and position engine"
)]
struct Cli {
    /// Path to the TOML config file (optional)
    #[arg(long, default_value = "goldbot.toml")]
    config: PathBuf,

    /// Use the in-memory store and log-only notifications
    #[arg(long)]
    dry_run: bool,

    /// Skip the live feed and run on simulated ticks
    #[arg(long)]
    simulate: bool,

    /// Log filter, e.g. "debug" or "goldbot=debug,goldbot::api=trace"
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref());

    let mut settings =
        Settings::load(Some(cli.config.as_path())).context("Failed to load settings")?;
    settings.dry_run |= cli.dry_run;
    settings.feed.simulate |= cli.simulate;
    settings.validate().context("Invalid settings")?;

    tracing::info!("🚀 GoldBot starting");
    tracing::info!("  Instrument: {}", settings.instrument.ticker);
    tracing::info!("  Users: {:?}", settings.users);
    tracing::info!("  Dry run: {}", settings.dry_run);
    tracing::info!(
        "  Feed: {}",
        if settings.feed.simulate { "SIMULATED" } else { settings.feed.ws_url.as_str() }
    );

    let store = build_store(&settings).await?;
    let notifier = build_notifier(&settings)?;

    // ========================================================================
    // Pipeline wiring
    // ========================================================================

    let broadcaster = Arc::new(TickBroadcaster::new(settings.broadcaster.clone()));
    let feed = Arc::new(
        FeedManager::new(settings.feed.clone(), &settings.aggregator, broadcaster.clone())
            .with_adapter(Arc::new(DerivFeed::new(&settings.feed)))
            .with_alerts(notifier.clone(), settings.users.clone()),
    );

    let risk = Arc::new(RiskGate::new(settings.risk.clone(), store.clone()));
    let positions = PositionManager::start(
        settings.positions.clone(),
        settings.instrument.clone(),
        risk.calendar(),
        store.clone(),
        notifier.clone(),
    );
    positions
        .restore()
        .await
        .context("Failed to restore active positions")?;

    let pipeline = Arc::new(SignalPipeline::new(
        settings.monitor.clone(),
        settings.instrument.clone(),
        feed.clone(),
        IndicatorEngine::new(settings.indicators.clone()),
        SignalEngine::new(settings.signals.clone(), settings.instrument.clone()),
        risk,
        positions.clone(),
        store,
        notifier,
    ));
    let supervisor = MonitorSupervisor::new(pipeline, broadcaster.clone());

    // ========================================================================
    // Tasks
    // ========================================================================

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut feed_task = {
        let feed = feed.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { feed.run(shutdown).await })
    };
    let tracker_task =
        spawn_position_tracker(positions.clone(), broadcaster.clone(), shutdown_rx.clone());
    let status_task = spawn_status_logger(
        feed.clone(),
        positions.clone(),
        Duration::from_secs(settings.status_interval_secs.max(1)),
        shutdown_rx,
    );

    for user in &settings.users {
        supervisor.start(*user);
    }

    tracing::info!("✅ All tasks spawned. Press Ctrl+C to stop...");

    let feed_exited = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
            false
        }
        result = &mut feed_task => {
            tracing::error!("Feed task exited unexpectedly: {:?}", result);
            true
        }
    };

    // ========================================================================
    // Shutdown
    // ========================================================================

    let timeout = Duration::from_secs(settings.shutdown_timeout_secs);
    let _ = shutdown_tx.send(true);
    supervisor.stop_all(timeout).await;

    let drained = tokio::time::timeout(timeout, async {
        if !feed_exited {
            let _ = feed_task.await;
        }
        let _ = tracker_task.await;
        let _ = status_task.await;
        positions.flush().await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Shutdown timed out after {:?}", timeout);
    }

    tracing::info!("👋 GoldBot stopped");
    Ok(())
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("goldbot=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_store(settings: &Settings) -> anyhow::Result<Arc<dyn Store>> {
    if settings.dry_run {
        tracing::info!("Dry run: using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let url = settings
        .database
        .url
        .as_deref()
        .context("DATABASE_URL not set")?;
    let store = PostgresStore::new(url, settings.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(Arc::new(store))
}

fn build_notifier(settings: &Settings) -> anyhow::Result<Arc<dyn Notifier>> {
    if settings.dry_run {
        return Ok(Arc::new(LogNotifier));
    }

    let token = settings
        .notify
        .telegram_token
        .clone()
        .context("TELEGRAM_BOT_TOKEN not set")?;
    let notifier = TelegramNotifier::new(token, &settings.notify)
        .context("Failed to build Telegram client")?;
    Ok(Arc::new(notifier))
}

// ============================================================================
// Status
// ============================================================================

fn spawn_status_logger(
    feed: Arc<FeedManager>,
    positions: Arc<PositionManager>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let status = feed.status_report(positions.active_count());
                    tracing::info!(
                        feed_connected = status.feed_connected,
                        simulator_active = status.simulator_active,
                        active_positions = status.active_position_count,
                        reconnect_attempts = status.reconnect_attempts,
                        subscribers = status.subscriber_count,
                        dropped_ticks = status.dropped_ticks,
                        "📊 Status"
                    );
                }
            }
        }
    })
}
