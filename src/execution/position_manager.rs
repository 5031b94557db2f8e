use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::db::{Store, TradeClose};
use crate::error::{BotError, Result};
use crate::models::{Direction, Instrument, Trade, TradeResult, UserId};
use crate::notify::{Event, Notifier};
use crate::risk::{calculate_pnl, TradingCalendar};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Active,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Active => "ACTIVE",
            PositionStatus::Closed => "CLOSED",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(PositionStatus::Active),
            "CLOSED" => Ok(PositionStatus::Closed),
            other => Err(BotError::Store(format!("Invalid position status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TpHit,
    SlHit,
    DynamicSlHit, // Stop had been moved from its original level
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TpHit => "TP_HIT",
            ExitReason::SlHit => "SL_HIT",
            ExitReason::DynamicSlHit => "DYNAMIC_SL_HIT",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitReason {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TP_HIT" => Ok(ExitReason::TpHit),
            "SL_HIT" => Ok(ExitReason::SlHit),
            "DYNAMIC_SL_HIT" => Ok(ExitReason::DynamicSlHit),
            other => Err(BotError::Store(format!("Invalid exit reason: {}", other))),
        }
    }
}

/// Stop management settings (PnL thresholds in account currency)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PositionConfig {
    pub dynamic_sl_loss_threshold: f64,
    pub tightening_multiplier: f64, // Fraction of the original stop distance, in (0, 1)
    pub trailing_profit_threshold: f64,
    pub trailing_distance: f64,     // Price units behind the current price
    pub update_queue_capacity: usize,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            dynamic_sl_loss_threshold: 5.0,
            tightening_multiplier: 0.5,
            trailing_profit_threshold: 10.0,
            trailing_distance: 1.5,
            update_queue_capacity: 1024,
        }
    }
}

/// Live counterpart of an open trade
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: Uuid,
    pub trade_id: Uuid,
    pub user: UserId,
    pub direction: Direction,
    pub entry_price: f64,
    pub lot_size: f64,
    pub take_profit: f64,
    pub current_stop_loss: f64,
    pub original_stop_loss: f64, // Never changes after open
    pub stop_adjustment_count: u32,
    pub max_profit_reached: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub status: PositionStatus,
    pub exit_reason: Option<ExitReason>,
    pub opened_at: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentKind {
    DynamicStop,
    Trailing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopAdjustment {
    pub kind: AdjustmentKind,
    pub old_stop: f64,
    pub new_stop: f64,
}

/// What one price update did to a position
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PriceUpdate {
    pub adjustment: Option<StopAdjustment>,
    pub exit: Option<ExitReason>,
}

impl Position {
    pub fn open(trade: &Trade, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trade_id: trade.id,
            user: trade.user,
            direction: trade.direction,
            entry_price: trade.entry_price,
            lot_size: trade.lot_size,
            take_profit: trade.take_profit,
            current_stop_loss: trade.stop_loss,
            original_stop_loss: trade.stop_loss,
            stop_adjustment_count: 0,
            max_profit_reached: 0.0,
            current_price: trade.entry_price,
            unrealized_pnl: 0.0,
            status: PositionStatus::Active,
            exit_reason: None,
            opened_at: at,
            last_update_time: at,
            closed_at: None,
        }
    }

    /// True if `stop` risks less than the current stop
    fn is_more_protective(&self, stop: f64) -> bool {
        match self.direction {
            Direction::Buy => stop > self.current_stop_loss,
            Direction::Sell => stop < self.current_stop_loss,
        }
    }

    /// Mark to `price`, apply at most one stop adjustment, then test TP/SL
    ///
    /// Loss-triggered tightening takes priority over profit trailing. Either
    /// one only ever moves the stop in the risk-reducing direction.
    pub fn apply_price(
        &mut self,
        price: f64,
        config: &PositionConfig,
        pip_value: f64,
        at: DateTime<Utc>,
    ) -> PriceUpdate {
        let pnl = calculate_pnl(self.direction, self.entry_price, price, self.lot_size, pip_value);
        self.current_price = price;
        self.unrealized_pnl = pnl;
        self.last_update_time = at;

        let sign = self.direction.sign();
        let proposal = if pnl <= -config.dynamic_sl_loss_threshold {
            let original_distance = (self.entry_price - self.original_stop_loss).abs();
            let stop = self.entry_price - sign * original_distance * config.tightening_multiplier;
            Some((AdjustmentKind::DynamicStop, stop))
        } else if pnl >= config.trailing_profit_threshold {
            self.max_profit_reached = self.max_profit_reached.max(pnl);
            Some((AdjustmentKind::Trailing, price - sign * config.trailing_distance))
        } else {
            None
        };

        let mut update = PriceUpdate::default();
        if let Some((kind, stop)) = proposal {
            if self.is_more_protective(stop) {
                update.adjustment = Some(StopAdjustment {
                    kind,
                    old_stop: self.current_stop_loss,
                    new_stop: stop,
                });
                self.current_stop_loss = stop;
                self.stop_adjustment_count += 1;
            }
        }

        let (hit_tp, hit_sl) = match self.direction {
            Direction::Buy => (price >= self.take_profit, price <= self.current_stop_loss),
            Direction::Sell => (price <= self.take_profit, price >= self.current_stop_loss),
        };

        update.exit = if hit_tp {
            Some(ExitReason::TpHit)
        } else if hit_sl && self.stop_adjustment_count > 0 {
            Some(ExitReason::DynamicSlHit)
        } else if hit_sl {
            Some(ExitReason::SlHit)
        } else {
            None
        };

        update
    }
}

/// A position that was closed and persisted
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    pub exit_price: f64,
    pub pnl: f64,
    pub result: TradeResult,
    pub reason: ExitReason,
}

enum WriteOp {
    Save(Box<Position>),
    Flush(oneshot::Sender<()>),
}

/// Owns every active position, keyed by user
///
/// Price updates mutate positions in memory and hand snapshots to a background
/// writer, so persistence never stalls the tick consumer. A position leaves
/// memory only after its close has been committed to the store.
pub struct PositionManager {
    config: PositionConfig,
    instrument: Instrument,
    calendar: TradingCalendar,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    positions: RwLock<HashMap<UserId, HashMap<Uuid, Position>>>,
    closing: Mutex<HashSet<Uuid>>,
    writes: mpsc::Sender<WriteOp>,
}

impl PositionManager {
    /// Build the manager and spawn its persistence writer
    pub fn start(
        config: PositionConfig,
        instrument: Instrument,
        calendar: TradingCalendar,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let (writes, rx) = mpsc::channel(config.update_queue_capacity.max(1));
        tokio::spawn(run_writer(store.clone(), rx));

        Arc::new(Self {
            config,
            instrument,
            calendar,
            store,
            notifier,
            positions: RwLock::new(HashMap::new()),
            closing: Mutex::new(HashSet::new()),
            writes,
        })
    }

    pub fn config(&self) -> &PositionConfig {
        &self.config
    }

    /// Load ACTIVE positions persisted by a previous run
    pub async fn restore(&self) -> Result<usize> {
        let restored = self.store.load_active_positions().await?;
        let count = restored.len();

        let mut positions = self.positions_mut();
        for position in restored {
            positions
                .entry(position.user)
                .or_default()
                .insert(position.id, position);
        }
        drop(positions);

        tracing::info!("Restored {} active positions", count);
        Ok(count)
    }

    /// Open a position for an OPEN trade
    pub async fn add(&self, trade: &Trade) -> Result<Position> {
        self.add_at(trade, Utc::now()).await
    }

    pub async fn add_at(&self, trade: &Trade, at: DateTime<Utc>) -> Result<Position> {
        let position = Position::open(trade, at);
        self.store.save_position(&position).await?;

        self.positions_mut()
            .entry(position.user)
            .or_default()
            .insert(position.id, position.clone());

        tracing::info!(
            user = position.user,
            position_id = %position.id,
            "Position opened: {} @ {:.2} (SL {:.2}, TP {:.2}, lot {:.2})",
            position.direction,
            position.entry_price,
            position.current_stop_loss,
            position.take_profit,
            position.lot_size
        );
        Ok(position)
    }

    /// Apply a price update to every active position
    ///
    /// Returns the positions closed by this update.
    pub async fn on_price(&self, price: f64, at: DateTime<Utc>) -> Vec<ClosedPosition> {
        let mut adjusted = Vec::new();
        let mut touched = Vec::new();

        {
            let mut positions = self.positions_mut();
            for position in positions.values_mut().flat_map(|book| book.values_mut()) {
                let update = position.apply_price(price, &self.config, self.instrument.pip_value, at);
                self.queue_write(position);

                if let Some(adjustment) = update.adjustment {
                    adjusted.push((position.clone(), adjustment));
                }
                if let Some(reason) = update.exit {
                    touched.push((position.user, position.id, reason));
                }
            }
        }

        for (position, adjustment) in adjusted {
            self.report_adjustment(&position, adjustment).await;
        }

        let mut closed = Vec::new();
        for (user, position_id, reason) in touched {
            match self.close_at(user, position_id, price, reason, at).await {
                Ok(Some(c)) => closed.push(c),
                Ok(None) => {}
                Err(e) => tracing::error!(
                    user,
                    position_id = %position_id,
                    "Failed to close position, keeping it active: {}",
                    e
                ),
            }
        }
        closed
    }

    /// Close one position; a second close of the same position is a no-op
    pub async fn close(
        &self,
        user: UserId,
        position_id: Uuid,
        exit_price: f64,
        reason: ExitReason,
    ) -> Result<Option<ClosedPosition>> {
        self.close_at(user, position_id, exit_price, reason, Utc::now()).await
    }

    pub async fn close_at(
        &self,
        user: UserId,
        position_id: Uuid,
        exit_price: f64,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> Result<Option<ClosedPosition>> {
        if !self.closing().insert(position_id) {
            return Ok(None);
        }
        let result = self.close_inner(user, position_id, exit_price, reason, at).await;
        self.closing().remove(&position_id);
        result
    }

    async fn close_inner(
        &self,
        user: UserId,
        position_id: Uuid,
        exit_price: f64,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> Result<Option<ClosedPosition>> {
        let snapshot = self
            .positions()
            .get(&user)
            .and_then(|book| book.get(&position_id))
            .cloned();
        let Some(mut position) = snapshot else {
            return Ok(None);
        };

        let pnl = calculate_pnl(
            position.direction,
            position.entry_price,
            exit_price,
            position.lot_size,
            self.instrument.pip_value,
        );
        let result = TradeResult::from_pnl(pnl);

        let close = TradeClose {
            trade_id: position.trade_id,
            position_id,
            user,
            exit_price,
            actual_pnl: pnl,
            result,
            exit_reason: reason,
            closed_at: at,
            day: self.calendar.day_of(at),
        };
        self.store.close_trade(&close).await?;

        {
            let mut positions = self.positions_mut();
            if let Some(book) = positions.get_mut(&user) {
                book.remove(&position_id);
                if book.is_empty() {
                    positions.remove(&user);
                }
            }
        }

        position.status = PositionStatus::Closed;
        position.exit_reason = Some(reason);
        position.current_price = exit_price;
        position.unrealized_pnl = pnl;
        position.closed_at = Some(at);
        position.last_update_time = at;

        tracing::info!(
            user,
            position_id = %position_id,
            "Position closed: {} P/L ${:.2} ({})",
            reason,
            pnl,
            result.as_str()
        );

        let event = Event::PositionClosed {
            position_id,
            trade_id: position.trade_id,
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price,
            pnl,
            result,
            reason,
        };
        if let Err(e) = self.notifier.notify(user, &event, None).await {
            tracing::warn!(user, "Failed to send close notification: {}", e);
        }

        Ok(Some(ClosedPosition {
            position,
            exit_price,
            pnl,
            result,
            reason,
        }))
    }

    /// Snapshot of one user's active positions
    pub fn active_positions(&self, user: UserId) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions()
            .get(&user)
            .map(|book| book.values().cloned().collect())
            .unwrap_or_default();
        positions.sort_by_key(|p| p.opened_at);
        positions
    }

    pub fn has_active(&self, user: UserId) -> bool {
        self.positions()
            .get(&user)
            .is_some_and(|book| !book.is_empty())
    }

    pub fn active_count(&self) -> usize {
        self.positions().values().map(HashMap::len).sum()
    }

    /// Wait until every queued position write has reached the store
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.writes.send(WriteOp::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    async fn report_adjustment(&self, position: &Position, adjustment: StopAdjustment) {
        tracing::info!(
            user = position.user,
            position_id = %position.id,
            kind = ?adjustment.kind,
            "Stop moved {:.2} -> {:.2} (P/L ${:.2})",
            adjustment.old_stop,
            adjustment.new_stop,
            position.unrealized_pnl
        );

        if adjustment.kind != AdjustmentKind::DynamicStop {
            return;
        }
        let event = Event::StopAdjusted {
            position_id: position.id,
            direction: position.direction,
            old_stop: adjustment.old_stop,
            new_stop: adjustment.new_stop,
            unrealized_pnl: position.unrealized_pnl,
        };
        if let Err(e) = self.notifier.notify(position.user, &event, None).await {
            tracing::warn!(user = position.user, "Failed to send stop notification: {}", e);
        }
    }

    fn queue_write(&self, position: &Position) {
        match self.writes.try_send(WriteOp::Save(Box::new(position.clone()))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(position_id = %position.id, "Position write queue full, skipping snapshot");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(position_id = %position.id, "Position writer stopped");
            }
        }
    }

    fn positions(&self) -> RwLockReadGuard<'_, HashMap<UserId, HashMap<Uuid, Position>>> {
        self.positions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn positions_mut(&self) -> RwLockWriteGuard<'_, HashMap<UserId, HashMap<Uuid, Position>>> {
        self.positions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn closing(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.closing.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_writer(store: Arc<dyn Store>, mut rx: mpsc::Receiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Save(position) => {
                if let Err(e) = store.save_position(&position).await {
                    tracing::error!(position_id = %position.id, "Failed to persist position update: {}", e);
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Position writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{SignalSource, Timeframe, TradeStatus};
    use crate::notify::ImageRef;
    use async_trait::async_trait;
    use chrono::TimeZone;

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<(UserId, &'static str)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, user: UserId, event: &Event, _: Option<&ImageRef>) -> Result<()> {
            self.events.lock().unwrap().push((user, event.kind()));
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn trade(user: UserId, direction: Direction, entry: f64, sl: f64, tp: f64, lot: f64) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            user,
            ticker: "XAUUSD".to_string(),
            direction,
            source: SignalSource::Auto,
            timeframe: Timeframe::M1,
            entry_price: entry,
            stop_loss: sl,
            take_profit: tp,
            lot_size: lot,
            spread: 0.4,
            estimated_pnl: 0.0,
            status: TradeStatus::Open,
            result: None,
            actual_pnl: None,
            exit_price: None,
            signal_time: t0(),
            close_time: None,
        }
    }

    fn manager(store: Arc<MemoryStore>, notifier: Arc<RecordingNotifier>) -> Arc<PositionManager> {
        PositionManager::start(
            PositionConfig::default(),
            Instrument::default(),
            TradingCalendar::default(),
            store,
            notifier,
        )
    }

    async fn open(
        store: &MemoryStore,
        pm: &PositionManager,
        trade: Trade,
    ) -> Position {
        store.insert_trade(&trade).await.unwrap();
        pm.add_at(&trade, t0()).await.unwrap()
    }

    #[test]
    fn test_dynamic_stop_tightens_on_loss() {
        let config = PositionConfig::default();
        let mut position = Position::open(
            &trade(1, Direction::Buy, 2650.0, 2640.0, 2670.0, 0.5),
            t0(),
        );

        // $6 loss: stop moves to half the original distance
        let update = position.apply_price(2648.8, &config, 10.0, t0());
        let adjustment = update.adjustment.unwrap();
        assert_eq!(adjustment.kind, AdjustmentKind::DynamicStop);
        assert!((position.current_stop_loss - 2645.0).abs() < 1e-9);
        assert_eq!(position.original_stop_loss, 2640.0);
        assert_eq!(position.stop_adjustment_count, 1);
        assert!(update.exit.is_none());

        // Same loss again proposes the same stop: no change
        let update = position.apply_price(2648.5, &config, 10.0, t0());
        assert!(update.adjustment.is_none());
        assert_eq!(position.stop_adjustment_count, 1);
    }

    #[test]
    fn test_dynamic_stop_above_price_exits_immediately() {
        let config = PositionConfig::default();
        let mut position = Position::open(
            &trade(1, Direction::Buy, 2650.0, 2648.0, 2654.0, 0.5),
            t0(),
        );

        // Loss of $6 tightens the stop to 2649, which the price is already below
        let update = position.apply_price(2648.8, &config, 10.0, t0());
        assert!((position.current_stop_loss - 2649.0).abs() < 1e-9);
        assert_eq!(update.exit, Some(ExitReason::DynamicSlHit));
    }

    #[test]
    fn test_trailing_ratchet_is_monotonic() {
        let config = PositionConfig::default();
        let mut position = Position::open(
            &trade(1, Direction::Buy, 2650.0, 2645.0, 2670.0, 0.5),
            t0(),
        );

        let prices = [2652.5, 2651.8, 2654.0, 2653.0, 2655.0, 2654.2];
        let mut last_stop = position.current_stop_loss;
        let mut last_max = position.max_profit_reached;

        for price in prices {
            position.apply_price(price, &config, 10.0, t0());
            assert!(position.current_stop_loss >= last_stop);
            assert!(position.max_profit_reached >= last_max);
            last_stop = position.current_stop_loss;
            last_max = position.max_profit_reached;
        }

        assert!((position.current_stop_loss - 2653.5).abs() < 1e-9);
        assert!((position.max_profit_reached - 25.0).abs() < 1e-9);
        assert_eq!(position.original_stop_loss, 2645.0);
    }

    #[test]
    fn test_sell_mirrors_ratchets() {
        let config = PositionConfig::default();
        let mut position = Position::open(
            &trade(1, Direction::Sell, 2650.0, 2660.0, 2630.0, 0.5),
            t0(),
        );

        // Loss: stop falls to 2655
        position.apply_price(2651.2, &config, 10.0, t0());
        assert!((position.current_stop_loss - 2655.0).abs() < 1e-9);

        // Profit $12.5: trail to 2649
        position.apply_price(2647.5, &config, 10.0, t0());
        assert!((position.current_stop_loss - 2649.0).abs() < 1e-9);

        // Price back up touches the stop
        let update = position.apply_price(2649.2, &config, 10.0, t0());
        assert_eq!(update.exit, Some(ExitReason::DynamicSlHit));
    }

    #[test]
    fn test_take_profit_checked_before_stop() {
        let config = PositionConfig::default();
        // Degenerate levels where one price touches both
        let mut position = Position::open(
            &trade(1, Direction::Buy, 2650.0, 2651.0, 2651.0, 0.01),
            t0(),
        );
        let update = position.apply_price(2651.0, &config, 10.0, t0());
        assert_eq!(update.exit, Some(ExitReason::TpHit));
    }

    #[tokio::test]
    async fn test_price_update_closes_on_take_profit() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let pm = manager(store.clone(), notifier.clone());

        let t = trade(7, Direction::Buy, 2650.0, 2648.0, 2654.0, 0.5);
        let position = open(&store, &pm, t.clone()).await;
        assert_eq!(pm.active_count(), 1);

        let closed = pm.on_price(2654.2, t0()).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, ExitReason::TpHit);
        assert_eq!(closed[0].result, TradeResult::Win);
        assert!((closed[0].pnl - 21.0).abs() < 1e-9);
        assert_eq!(pm.active_count(), 0);

        let stored = store.trade(t.id).unwrap();
        assert_eq!(stored.status, TradeStatus::Closed);
        assert_eq!(stored.exit_price, Some(2654.2));

        pm.flush().await;
        let persisted = store.position(position.id).unwrap();
        assert_eq!(persisted.status, PositionStatus::Closed);
        assert_eq!(persisted.exit_reason, Some(ExitReason::TpHit));

        let events = notifier.events.lock().unwrap().clone();
        assert_eq!(events, vec![(7, "position_closed")]);
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let pm = manager(store.clone(), Arc::new(RecordingNotifier::default()));
        let position = open(&store, &pm, trade(1, Direction::Buy, 2650.0, 2648.0, 2654.0, 0.5)).await;

        let first = pm
            .close_at(1, position.id, 2652.0, ExitReason::TpHit, t0())
            .await
            .unwrap();
        assert!(first.is_some());

        let second = pm
            .close_at(1, position.id, 2653.0, ExitReason::TpHit, t0())
            .await
            .unwrap();
        assert!(second.is_none());

        let day = TradingCalendar::default().day_of(t0());
        let perf = store.daily_performance(1, day).unwrap();
        assert_eq!(perf.trades, 1);
        assert!((perf.pnl - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_position_active() {
        let store = Arc::new(MemoryStore::new());
        let pm = manager(store.clone(), Arc::new(RecordingNotifier::default()));
        let t = trade(1, Direction::Buy, 2650.0, 2648.0, 2654.0, 0.5);
        open(&store, &pm, t.clone()).await;

        store.set_fail_writes(true);
        let closed = pm.on_price(2647.0, t0()).await;
        assert!(closed.is_empty());
        assert_eq!(pm.active_count(), 1);
        assert_eq!(store.trade(t.id).unwrap().status, TradeStatus::Open);

        // Store recovers: next touching tick closes it
        store.set_fail_writes(false);
        let closed = pm.on_price(2647.0, t0()).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(pm.active_count(), 0);
    }

    #[tokio::test]
    async fn test_positions_partitioned_by_user() {
        let store = Arc::new(MemoryStore::new());
        let pm = manager(store.clone(), Arc::new(RecordingNotifier::default()));
        open(&store, &pm, trade(1, Direction::Buy, 2650.0, 2640.0, 2670.0, 0.5)).await;
        open(&store, &pm, trade(2, Direction::Sell, 2650.0, 2660.0, 2630.0, 0.5)).await;

        assert_eq!(pm.active_positions(1).len(), 1);
        assert_eq!(pm.active_positions(2)[0].direction, Direction::Sell);
        assert!(pm.active_positions(3).is_empty());

        // Snapshots are copies
        let mut snapshot = pm.active_positions(1);
        snapshot[0].current_stop_loss = 0.0;
        assert_eq!(pm.active_positions(1)[0].current_stop_loss, 2640.0);
    }

    #[tokio::test]
    async fn test_dynamic_adjustment_notifies_owner() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let pm = manager(store.clone(), notifier.clone());
        open(&store, &pm, trade(3, Direction::Buy, 2650.0, 2640.0, 2670.0, 0.5)).await;

        pm.on_price(2648.8, t0()).await;
        // Trailing moves are not announced
        pm.on_price(2653.0, t0()).await;

        let events = notifier.events.lock().unwrap().clone();
        assert_eq!(events, vec![(3, "stop_adjusted")]);
        assert!((pm.active_positions(3)[0].current_stop_loss - 2651.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_restore_loads_active_positions() {
        let store = Arc::new(MemoryStore::new());
        let pm = manager(store.clone(), Arc::new(RecordingNotifier::default()));
        open(&store, &pm, trade(1, Direction::Buy, 2650.0, 2640.0, 2670.0, 0.5)).await;
        pm.on_price(2648.8, t0()).await;
        pm.flush().await;

        let restarted = manager(store.clone(), Arc::new(RecordingNotifier::default()));
        assert_eq!(restarted.restore().await.unwrap(), 1);

        let restored = &restarted.active_positions(1)[0];
        assert!((restored.current_stop_loss - 2645.0).abs() < 1e-9);
        assert_eq!(restored.stop_adjustment_count, 1);
    }
}
