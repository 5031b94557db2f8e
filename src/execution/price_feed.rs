use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::broadcaster::{BroadcastReport, TickBroadcaster};
use super::simulator::{SimulatorConfig, TickSimulator};
use super::tick_aggregator::{AggregatorConfig, TickAggregator};
use crate::error::{BotError, Result};
use crate::models::{Candle, StatusReport, Tick, Timeframe, UserId};
use crate::notify::{notify_all, Event, Notifier};

/// Upstream price source
#[async_trait]
pub trait FeedAdapter: Send + Sync {
    /// Open a live tick stream; the channel closes when the connection drops
    async fn subscribe(&self, symbol: &str) -> Result<mpsc::Receiver<Tick>>;

    /// Historical bars, oldest first
    async fn backfill(&self, _timeframe: Timeframe, _count: usize) -> Result<Vec<Candle>> {
        Ok(Vec::new())
    }
}

/// Feed connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedConfig {
    pub symbol: String,
    pub ws_url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub read_timeout_secs: u64,
    pub live_retry_interval_secs: u64, // 0 keeps simulation for the process lifetime
    pub simulate: bool,                // Skip the live feed entirely
    pub simulator: SimulatorConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbol: "frxXAUUSD".to_string(),
            ws_url: "wss://ws.derivws.com/websockets/v3?app_id=1089".to_string(),
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 3000,
            connect_timeout_secs: 10,
            ping_interval_secs: 20,
            read_timeout_secs: 60,
            live_retry_interval_secs: 0,
            simulate: false,
            simulator: SimulatorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Connecting,
    Connected,
    Reconnecting,
    Simulating,
}

#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    Disconnected,
    Shutdown,
}

/// Owns the upstream connection and fans ticks out to aggregators and subscribers
pub struct FeedManager {
    config: FeedConfig,
    adapter: Option<Arc<dyn FeedAdapter>>,
    aggregators: HashMap<Timeframe, RwLock<TickAggregator>>,
    backfill_count: usize,
    broadcaster: Arc<TickBroadcaster>,
    notifier: Option<Arc<dyn Notifier>>,
    alert_recipients: Vec<UserId>,
    state: RwLock<FeedState>,
    reconnect_attempts: AtomicU32,
    last_tick: RwLock<Option<Tick>>,
}

impl FeedManager {
    pub fn new(
        config: FeedConfig,
        aggregator_config: &AggregatorConfig,
        broadcaster: Arc<TickBroadcaster>,
    ) -> Self {
        let aggregators = aggregator_config
            .timeframes
            .iter()
            .map(|tf| {
                (
                    *tf,
                    RwLock::new(TickAggregator::new(*tf, aggregator_config.capacity)),
                )
            })
            .collect();

        Self {
            config,
            adapter: None,
            aggregators,
            backfill_count: aggregator_config.backfill_count,
            broadcaster,
            notifier: None,
            alert_recipients: Vec::new(),
            state: RwLock::new(FeedState::Connecting),
            reconnect_attempts: AtomicU32::new(0),
            last_tick: RwLock::new(None),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn FeedAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Recipients of feed degraded/restored alerts
    pub fn with_alerts(mut self, notifier: Arc<dyn Notifier>, recipients: Vec<UserId>) -> Self {
        self.notifier = Some(notifier);
        self.alert_recipients = recipients;
        self
    }

    pub fn state(&self) -> FeedState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn last_tick(&self) -> Option<Tick> {
        *self.last_tick.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn broadcaster(&self) -> &Arc<TickBroadcaster> {
        &self.broadcaster
    }

    /// Candle snapshot for one timeframe, oldest first (empty if not aggregated)
    pub fn candles(&self, timeframe: Timeframe, limit: usize) -> Vec<Candle> {
        self.aggregators
            .get(&timeframe)
            .map(|agg| {
                agg.read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_candles(limit)
            })
            .unwrap_or_default()
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.aggregators
            .values()
            .map(|agg| agg.read().unwrap_or_else(PoisonError::into_inner).dropped_ticks())
            .sum()
    }

    pub fn status_report(&self, active_position_count: usize) -> StatusReport {
        let state = self.state();
        StatusReport {
            feed_connected: state == FeedState::Connected,
            simulator_active: state == FeedState::Simulating,
            active_position_count,
            reconnect_attempts: self.reconnect_attempts(),
            subscriber_count: self.broadcaster.subscriber_count(),
            dropped_ticks: self.dropped_ticks(),
        }
    }

    /// Feed one tick through every aggregator and the broadcaster
    pub async fn process_tick(&self, tick: Tick) -> BroadcastReport {
        *self.last_tick.write().unwrap_or_else(PoisonError::into_inner) = Some(tick);

        for aggregator in self.aggregators.values() {
            aggregator
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .add_tick(tick.bid, tick.ask, tick.timestamp);
        }

        self.broadcaster.broadcast(tick).await
    }

    /// Run until `shutdown` flips
    ///
    /// Reconnects with a fixed delay; once attempts exceed the configured
    /// maximum, switches to simulated ticks.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let adapter = match (&self.adapter, self.config.simulate) {
            (Some(adapter), false) => adapter.clone(),
            _ => {
                tracing::info!("Live feed disabled, starting simulator");
                self.simulate(None, &mut shutdown).await;
                return;
            }
        };

        let mut restored: Option<mpsc::Receiver<Tick>> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected = match restored.take() {
                Some(rx) => Ok(rx),
                None => {
                    self.set_state(if self.reconnect_attempts() == 0 {
                        FeedState::Connecting
                    } else {
                        FeedState::Reconnecting
                    });
                    tokio::select! {
                        result = self.connect(adapter.as_ref()) => result,
                        _ = shutdown.changed() => break,
                    }
                }
            };

            match connected {
                Ok(rx) => {
                    self.on_connected(adapter.as_ref()).await;
                    if self.stream(rx, &mut shutdown).await == StreamEnd::Shutdown {
                        break;
                    }
                    tracing::warn!("Live feed disconnected");
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = self.reconnect_attempts() + 1,
                        "Feed connection failed: {}",
                        e
                    );
                }
            }

            let attempts = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempts > self.config.max_reconnect_attempts {
                match self.simulate(Some(adapter.as_ref()), &mut shutdown).await {
                    Some(rx) => {
                        self.alert(Event::FeedRestored).await;
                        restored = Some(rx);
                        continue;
                    }
                    None => break,
                }
            }

            tracing::info!(
                "Reconnecting in {}ms (attempt {}/{})",
                self.config.reconnect_delay_ms,
                attempts,
                self.config.max_reconnect_attempts
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.config.reconnect_delay_ms)) => {}
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("Feed manager stopped");
    }

    async fn connect(&self, adapter: &dyn FeedAdapter) -> Result<mpsc::Receiver<Tick>> {
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        tokio::time::timeout(timeout, adapter.subscribe(&self.config.symbol))
            .await
            .map_err(|_| BotError::Feed(format!("connect timed out after {:?}", timeout)))?
    }

    async fn on_connected(&self, adapter: &dyn FeedAdapter) {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(FeedState::Connected);
        tracing::info!("Connected to live feed for {}", self.config.symbol);

        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        for (timeframe, aggregator) in &self.aggregators {
            let has_data = !aggregator
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty();
            if has_data || self.backfill_count == 0 {
                continue;
            }

            match tokio::time::timeout(timeout, adapter.backfill(*timeframe, self.backfill_count)).await {
                Ok(Ok(candles)) => {
                    let seeded = aggregator
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .seed(candles);
                    tracing::info!("Backfilled {} {} candles", seeded, timeframe);
                }
                Ok(Err(e)) => tracing::warn!("Backfill for {} failed: {}", timeframe, e),
                Err(_) => tracing::warn!("Backfill for {} timed out", timeframe),
            }
        }
    }

    async fn stream(
        &self,
        mut rx: mpsc::Receiver<Tick>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        loop {
            tokio::select! {
                tick = rx.recv() => match tick {
                    Some(tick) => {
                        self.process_tick(tick).await;
                    }
                    None => return StreamEnd::Disconnected,
                },
                _ = shutdown.changed() => return StreamEnd::Shutdown,
            }
        }
    }

    /// Generate synthetic ticks until shutdown, or until a live retry succeeds
    async fn simulate(
        &self,
        adapter: Option<&dyn FeedAdapter>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<mpsc::Receiver<Tick>> {
        if *shutdown.borrow() {
            return None;
        }

        self.set_state(FeedState::Simulating);
        let attempts = self.reconnect_attempts();
        tracing::error!(
            attempts,
            "Live feed unavailable, switching to SIMULATED ticks. All signals are now simulation-driven"
        );
        self.alert(Event::FeedDegraded { attempts }).await;

        let mut simulator = TickSimulator::new(self.config.simulator.clone());
        self.process_tick(simulator.seed_tick(Utc::now())).await;

        let mut ticks = tokio::time::interval(Duration::from_millis(
            self.config.simulator.tick_interval_ms.max(1),
        ));
        ticks.tick().await;

        let retry_secs = self.config.live_retry_interval_secs;
        let can_retry = retry_secs > 0 && adapter.is_some();
        let mut retry = tokio::time::interval(Duration::from_secs(retry_secs.max(1)));
        retry.tick().await;

        // In-flight live connection attempt; ticks keep flowing while it runs
        let mut live_attempt: Option<BoxFuture<'_, Result<mpsc::Receiver<Tick>>>> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return None,
                _ = ticks.tick() => {
                    self.process_tick(simulator.next_tick(Utc::now())).await;
                }
                _ = retry.tick(), if can_retry && live_attempt.is_none() => {
                    if let Some(adapter) = adapter {
                        live_attempt = Some(Box::pin(self.connect(adapter)));
                    }
                }
                result = async {
                    match live_attempt.as_mut() {
                        Some(attempt) => attempt.await,
                        None => std::future::pending().await,
                    }
                }, if live_attempt.is_some() => {
                    live_attempt = None;
                    match result {
                        Ok(rx) => {
                            tracing::warn!("Live feed reachable again, leaving simulation");
                            return Some(rx);
                        }
                        Err(e) => tracing::debug!("Live retry failed: {}", e),
                    }
                }
            }
        }
    }

    async fn alert(&self, event: Event) {
        if let Some(notifier) = &self.notifier {
            notify_all(notifier.as_ref(), &self.alert_recipients, &event).await;
        }
    }

    fn set_state(&self, state: FeedState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }
}
