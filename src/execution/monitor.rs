use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::broadcaster::TickBroadcaster;
use super::position_manager::{Position, PositionManager};
use super::price_feed::FeedManager;
use crate::db::Store;
use crate::error::{BotError, Result};
use crate::indicators::IndicatorEngine;
use crate::models::{
    Direction, Instrument, Signal, SignalLog, SignalSource, Tick, Timeframe, Trade, TradeStatus,
    UserId,
};
use crate::notify::{ChartRenderer, Event, ImageRef, Notifier};
use crate::risk::{calculate_pnl, RiskGate, RiskTrip};
use crate::strategy::{SignalEngine, SignalRejection};

pub const POSITION_TRACKER: &str = "position-tracker";

/// Per-user evaluation loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub timeframe: Timeframe,
    pub source: SignalSource,
    pub candle_window: usize,
    pub evaluation_interval_secs: u64, // Minimum gap between evaluations
    pub error_backoff_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeframe: Timeframe::M1,
            source: SignalSource::Auto,
            candle_window: 100,
            evaluation_interval_secs: 30,
            error_backoff_secs: 60,
        }
    }
}

/// Outcome of one evaluation cycle
#[derive(Debug, Clone)]
pub enum Evaluation {
    NotReady { have: usize, need: usize },
    NoSignal,
    Rejected { direction: Direction, trip: RiskTrip },
    Invalid { direction: Direction, rejection: SignalRejection },
    Opened { trade: Box<Trade>, position: Box<Position> },
}

/// candles -> indicators -> signal -> risk gate -> trade + position
pub struct SignalPipeline {
    config: MonitorConfig,
    instrument: Instrument,
    feed: Arc<FeedManager>,
    indicators: IndicatorEngine,
    signals: SignalEngine,
    risk: Arc<RiskGate>,
    positions: Arc<PositionManager>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    charts: Option<Arc<dyn ChartRenderer>>,
    user_locks: DashMap<UserId, Arc<tokio::sync::Mutex<()>>>,
}

impl SignalPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MonitorConfig,
        instrument: Instrument,
        feed: Arc<FeedManager>,
        indicators: IndicatorEngine,
        signals: SignalEngine,
        risk: Arc<RiskGate>,
        positions: Arc<PositionManager>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            instrument,
            feed,
            indicators,
            signals,
            risk,
            positions,
            store,
            notifier,
            charts: None,
            user_locks: DashMap::new(),
        }
    }

    pub fn with_chart_renderer(mut self, charts: Arc<dyn ChartRenderer>) -> Self {
        self.charts = Some(charts);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub async fn evaluate(&self, user: UserId) -> Result<Evaluation> {
        self.evaluate_at(user, self.config.source, Utc::now()).await
    }

    /// Run one full evaluation cycle for `user` over the latest candles
    pub async fn evaluate_at(
        &self,
        user: UserId,
        source: SignalSource,
        at: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let candles = self
            .feed
            .candles(self.config.timeframe, self.config.candle_window);

        let indicators = match self.indicators.compute(&candles) {
            Ok(indicators) => indicators,
            Err(BotError::InsufficientData { have, need }) => {
                tracing::debug!(user, "Waiting for candles: {}/{}", have, need);
                return Ok(Evaluation::NotReady { have, need });
            }
            Err(e) => return Err(e),
        };

        let Some(signal) = self
            .signals
            .detect(&indicators, source, self.config.timeframe)
        else {
            return Ok(Evaluation::NoSignal);
        };

        let spread = self.feed.last_tick().map(|t| t.spread()).unwrap_or(0.0);
        self.process_signal(user, signal, spread, at).await
    }

    /// Gate, validate and (if accepted) open a trade for a detected signal
    ///
    /// Serialized per user so two near-simultaneous signals cannot both pass
    /// the risk gate.
    pub async fn process_signal(
        &self,
        user: UserId,
        signal: Signal,
        spread: f64,
        at: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        if let Err(trip) = self.risk.can_trade_at(user, signal.direction, at).await {
            let reason = trip.to_string();
            tracing::info!(user, "Trade rejected: {}", reason);
            self.log_signal(user, &signal, at, Some(reason.clone())).await;

            // Cooldown trips repeat every cycle in auto mode; keep them in the log
            let quiet = matches!(trip, RiskTrip::Cooldown { .. }) && signal.source == SignalSource::Auto;
            if !quiet {
                self.send(
                    user,
                    &Event::SignalRejected {
                        direction: signal.direction,
                        reason,
                    },
                    None,
                )
                .await;
            }
            return Ok(Evaluation::Rejected {
                direction: signal.direction,
                trip,
            });
        }

        if let Err(rejection) = self.signals.validate(&signal, spread) {
            let reason = rejection.to_string();
            tracing::debug!(user, "Signal validation failed: {}", reason);
            self.log_signal(user, &signal, at, Some(reason.clone())).await;

            if signal.source == SignalSource::Manual {
                self.send(
                    user,
                    &Event::SignalRejected {
                        direction: signal.direction,
                        reason,
                    },
                    None,
                )
                .await;
            }
            return Ok(Evaluation::Invalid {
                direction: signal.direction,
                rejection,
            });
        }

        let trade = Trade {
            id: Uuid::new_v4(),
            user,
            ticker: self.instrument.ticker.clone(),
            direction: signal.direction,
            source: signal.source,
            timeframe: signal.timeframe,
            entry_price: signal.entry,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            lot_size: signal.lot_size,
            spread,
            estimated_pnl: calculate_pnl(
                signal.direction,
                signal.entry,
                signal.take_profit,
                signal.lot_size,
                self.instrument.pip_value,
            ),
            status: TradeStatus::Open,
            result: None,
            actual_pnl: None,
            exit_price: None,
            signal_time: at,
            close_time: None,
        };

        self.store.insert_trade(&trade).await?;
        self.risk.record_at(user, at);
        self.log_signal(user, &signal, at, None).await;

        let position = self.positions.add_at(&trade, at).await?;

        let image = self.render_chart(&signal).await;
        self.send(
            user,
            &Event::SignalOpened {
                trade_id: trade.id,
                signal: Box::new(signal),
            },
            image.as_ref(),
        )
        .await;

        Ok(Evaluation::Opened {
            trade: Box::new(trade),
            position: Box::new(position),
        })
    }

    async fn log_signal(
        &self,
        user: UserId,
        signal: &Signal,
        at: DateTime<Utc>,
        rejection_reason: Option<String>,
    ) {
        let indicators = serde_json::to_string(&signal.indicators).unwrap_or_default();
        let log = SignalLog {
            user,
            ticker: self.instrument.ticker.clone(),
            direction: signal.direction,
            source: signal.source,
            entry_price: signal.entry,
            indicators,
            accepted: rejection_reason.is_none(),
            rejection_reason,
            timestamp: at,
        };
        if let Err(e) = self.store.log_signal(&log).await {
            tracing::warn!(user, "Failed to log signal: {}", e);
        }
    }

    async fn render_chart(&self, signal: &Signal) -> Option<ImageRef> {
        let charts = self.charts.as_ref()?;
        let candles = self
            .feed
            .candles(self.config.timeframe, self.config.candle_window);
        match charts.render(&candles, Some(signal)).await {
            Ok(image) => Some(image),
            Err(e) => {
                tracing::warn!("Chart rendering failed: {}", e);
                None
            }
        }
    }

    async fn send(&self, user: UserId, event: &Event, image: Option<&ImageRef>) {
        if let Err(e) = self.notifier.notify(user, event, image).await {
            tracing::warn!(user, "Failed to send {} notification: {}", event.kind(), e);
        }
    }

    fn user_lock(&self, user: UserId) -> Arc<tokio::sync::Mutex<()>> {
        self.user_locks.entry(user).or_default().clone()
    }
}

/// Unsubscribes from the broadcaster when dropped, however the task ends
struct SubscriptionGuard {
    broadcaster: Arc<TickBroadcaster>,
    name: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(&self.name);
    }
}

struct Session {
    name: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Starts and stops one supervised monitoring task per user
pub struct MonitorSupervisor {
    pipeline: Arc<SignalPipeline>,
    broadcaster: Arc<TickBroadcaster>,
    sessions: Mutex<HashMap<UserId, Session>>,
    next_id: AtomicU64,
}

impl MonitorSupervisor {
    pub fn new(pipeline: Arc<SignalPipeline>, broadcaster: Arc<TickBroadcaster>) -> Self {
        Self {
            pipeline,
            broadcaster,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start monitoring for `user`; false if a session is already running
    pub fn start(&self, user: UserId) -> bool {
        let mut sessions = self.sessions();
        if sessions.get(&user).is_some_and(|s| !s.handle.is_finished()) {
            return false;
        }

        let name = format!("monitor-{}-{}", user, self.next_id.fetch_add(1, Ordering::SeqCst));
        let ticks = self.broadcaster.subscribe(&name);
        let guard = SubscriptionGuard {
            broadcaster: self.broadcaster.clone(),
            name: name.clone(),
        };
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_session(
            self.pipeline.clone(),
            user,
            ticks,
            guard,
            shutdown_rx,
        ));

        tracing::info!(user, subscriber = %name, "Monitoring started");
        sessions.insert(
            user,
            Session {
                name,
                shutdown,
                handle,
            },
        );
        true
    }

    /// Stop `user`'s session and wait for it to unsubscribe
    pub async fn stop(&self, user: UserId, timeout: Duration) -> bool {
        let Some(session) = self.sessions().remove(&user) else {
            return false;
        };
        Self::shutdown_session(user, session, timeout).await;
        true
    }

    pub async fn stop_all(&self, timeout: Duration) {
        let sessions: Vec<(UserId, Session)> = self.sessions().drain().collect();
        let stops = sessions
            .into_iter()
            .map(|(user, session)| Self::shutdown_session(user, session, timeout));
        futures_util::future::join_all(stops).await;
    }

    pub fn is_running(&self, user: UserId) -> bool {
        self.sessions()
            .get(&user)
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Users with a live session
    pub fn running_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .sessions()
            .iter()
            .filter(|(_, s)| !s.handle.is_finished())
            .map(|(user, _)| *user)
            .collect();
        users.sort_unstable();
        users
    }

    async fn shutdown_session(user: UserId, session: Session, timeout: Duration) {
        let _ = session.shutdown.send(true);
        let mut handle = session.handle;
        if tokio::time::timeout(timeout, &mut handle).await.is_err() {
            tracing::warn!(user, subscriber = %session.name, "Monitoring session did not stop in time, aborting");
            handle.abort();
        }
        tracing::info!(user, "Monitoring stopped");
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<UserId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_session(
    pipeline: Arc<SignalPipeline>,
    user: UserId,
    mut ticks: mpsc::Receiver<Tick>,
    guard: SubscriptionGuard,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(pipeline.config().evaluation_interval_secs);
    let backoff = Duration::from_secs(pipeline.config().error_backoff_secs);
    let source = pipeline.config().source;
    let mut next_evaluation = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            tick = ticks.recv() => {
                let Some(tick) = tick else {
                    tracing::warn!(user, subscriber = %guard.name, "Monitoring session was evicted, re-subscribing");
                    ticks = guard.broadcaster.subscribe(&guard.name);
                    continue;
                };
                if Instant::now() < next_evaluation {
                    continue;
                }

                next_evaluation = match pipeline.evaluate_at(user, source, tick.timestamp).await {
                    Ok(Evaluation::Opened { trade, .. }) => {
                        tracing::info!(user, trade_id = %trade.id, "Signal accepted");
                        Instant::now() + interval
                    }
                    Ok(_) => Instant::now() + interval,
                    Err(e) => {
                        tracing::error!(user, "Error in monitoring loop: {}", e);
                        Instant::now() + backoff
                    }
                };
            }
        }
    }
}

/// Feed every tick's mid price to the position manager until shutdown
///
/// Re-subscribes if the broadcaster evicts it.
pub fn spawn_position_tracker(
    positions: Arc<PositionManager>,
    broadcaster: Arc<TickBroadcaster>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _guard = SubscriptionGuard {
            broadcaster: broadcaster.clone(),
            name: POSITION_TRACKER.to_string(),
        };
        let mut ticks = broadcaster.subscribe(POSITION_TRACKER);
        tracing::info!("Position tracker subscribed to tick feed");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                tick = ticks.recv() => match tick {
                    Some(tick) => {
                        if positions.active_count() > 0 {
                            positions.on_price(tick.mid, tick.timestamp).await;
                        }
                    }
                    None => {
                        tracing::warn!("Position tracker was evicted, re-subscribing");
                        ticks = broadcaster.subscribe(POSITION_TRACKER);
                    }
                },
            }
        }

        tracing::info!("Position tracker stopped");
    })
}
