use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{DailyPerformance, DailyStats, PerformanceSummary, Store, TradeClose};
use crate::error::{BotError, Result};
use crate::execution::{Position, PositionStatus};
use crate::models::{SignalLog, Trade, TradeStatus, UserId};

#[derive(Default)]
struct MemoryState {
    trades: HashMap<Uuid, Trade>,
    positions: HashMap<Uuid, Position>,
    signal_logs: Vec<SignalLog>,
    performance: HashMap<(UserId, NaiveDate), DailyPerformance>,
}

/// In-process store for dry runs and tests
///
/// `set_fail_writes(true)` makes every write return an error without
/// touching state.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn trade(&self, id: Uuid) -> Option<Trade> {
        self.state().ok()?.trades.get(&id).cloned()
    }

    pub fn position(&self, id: Uuid) -> Option<Position> {
        self.state().ok()?.positions.get(&id).cloned()
    }

    pub fn signal_logs(&self) -> Vec<SignalLog> {
        self.state()
            .map(|s| s.signal_logs.clone())
            .unwrap_or_default()
    }

    pub fn daily_performance(&self, user: UserId, day: NaiveDate) -> Option<DailyPerformance> {
        self.state().ok()?.performance.get(&(user, day)).cloned()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| BotError::Store("memory store lock poisoned".to_string()))
    }

    fn writable(&self) -> Result<MutexGuard<'_, MemoryState>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BotError::Store("injected write failure".to_string()));
        }
        self.state()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        let mut state = self.writable()?;
        state.trades.insert(trade.id, trade.clone());
        Ok(())
    }

    async fn close_trade(&self, close: &TradeClose) -> Result<()> {
        let mut state = self.writable()?;

        // Validate everything before mutating so a failure leaves no trace
        match state.trades.get(&close.trade_id) {
            Some(trade) if trade.status == TradeStatus::Open => {}
            Some(_) => {
                return Err(BotError::Store(format!(
                    "trade {} is already closed",
                    close.trade_id
                )))
            }
            None => {
                return Err(BotError::Store(format!(
                    "trade {} not found",
                    close.trade_id
                )))
            }
        }

        if let Some(trade) = state.trades.get_mut(&close.trade_id) {
            trade.status = TradeStatus::Closed;
            trade.result = Some(close.result);
            trade.actual_pnl = Some(close.actual_pnl);
            trade.exit_price = Some(close.exit_price);
            trade.close_time = Some(close.closed_at);
        }

        if let Some(position) = state.positions.get_mut(&close.position_id) {
            position.status = PositionStatus::Closed;
            position.exit_reason = Some(close.exit_reason);
            position.current_price = close.exit_price;
            position.unrealized_pnl = close.actual_pnl;
            position.closed_at = Some(close.closed_at);
            position.last_update_time = close.closed_at;
        }

        state
            .performance
            .entry((close.user, close.day))
            .or_insert_with(|| DailyPerformance {
                user: close.user,
                day: close.day,
                ..Default::default()
            })
            .record(close.result, close.actual_pnl);

        Ok(())
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        let mut state = self.writable()?;

        let closed = state
            .positions
            .get(&position.id)
            .is_some_and(|p| p.status == PositionStatus::Closed);
        if !closed {
            state.positions.insert(position.id, position.clone());
        }
        Ok(())
    }

    async fn load_active_positions(&self) -> Result<Vec<Position>> {
        let state = self.state()?;
        let mut positions: Vec<Position> = state
            .positions
            .values()
            .filter(|p| p.status == PositionStatus::Active)
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.opened_at);
        Ok(positions)
    }

    async fn log_signal(&self, log: &SignalLog) -> Result<()> {
        let mut state = self.writable()?;
        state.signal_logs.push(log.clone());
        Ok(())
    }

    async fn daily_stats(&self, user: UserId, since: DateTime<Utc>) -> Result<DailyStats> {
        let state = self.state()?;
        let mut stats = DailyStats::default();

        for trade in state
            .trades
            .values()
            .filter(|t| t.user == user && t.signal_time >= since)
        {
            stats.trade_count += 1;
            stats.realized_pnl += trade.actual_pnl.unwrap_or(0.0);
        }

        Ok(stats)
    }

    async fn performance(&self, user: UserId, day_start: DateTime<Utc>) -> Result<PerformanceSummary> {
        let state = self.state()?;
        let closed = state
            .trades
            .values()
            .filter(|t| t.user == user && t.status == TradeStatus::Closed);
        Ok(PerformanceSummary::from_closed(closed, day_start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExitReason;
    use crate::models::{Direction, SignalSource, Timeframe, TradeResult};
    use chrono::Duration;

    fn open_trade(user: UserId, signal_time: DateTime<Utc>) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            user,
            ticker: "XAUUSD".to_string(),
            direction: Direction::Buy,
            source: SignalSource::Auto,
            timeframe: Timeframe::M1,
            entry_price: 2650.0,
            stop_loss: 2648.0,
            take_profit: 2654.0,
            lot_size: 0.5,
            spread: 0.4,
            estimated_pnl: 20.0,
            status: TradeStatus::Open,
            result: None,
            actual_pnl: None,
            exit_price: None,
            signal_time,
            close_time: None,
        }
    }

    fn closing(trade: &Trade, pnl: f64, at: DateTime<Utc>) -> TradeClose {
        TradeClose {
            trade_id: trade.id,
            position_id: Uuid::new_v4(),
            user: trade.user,
            exit_price: 2654.0,
            actual_pnl: pnl,
            result: TradeResult::from_pnl(pnl),
            exit_reason: ExitReason::TpHit,
            closed_at: at,
            day: at.date_naive(),
        }
    }

    #[tokio::test]
    async fn test_close_trade_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let trade = open_trade(1, now);
        store.insert_trade(&trade).await.unwrap();

        let close = closing(&trade, 20.0, now);
        store.close_trade(&close).await.unwrap();

        let stored = store.trade(trade.id).unwrap();
        assert_eq!(stored.status, TradeStatus::Closed);
        assert_eq!(stored.result, Some(TradeResult::Win));

        // Second close fails and leaves the daily row untouched
        assert!(store.close_trade(&close).await.is_err());
        let day = store.daily_performance(1, close.day).unwrap();
        assert_eq!(day.trades, 1);
        assert_eq!(day.pnl, 20.0);
    }

    #[tokio::test]
    async fn test_daily_stats_scoped_to_user_and_day() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let old = open_trade(1, now - Duration::days(2));
        let today = open_trade(1, now);
        let other_user = open_trade(2, now);
        for t in [&old, &today, &other_user] {
            store.insert_trade(t).await.unwrap();
        }
        store.close_trade(&closing(&today, -7.5, now)).await.unwrap();

        let stats = store.daily_stats(1, now - Duration::hours(1)).await.unwrap();
        assert_eq!(stats.trade_count, 1);
        assert_eq!(stats.realized_pnl, -7.5);
    }

    #[tokio::test]
    async fn test_performance_summary() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let a = open_trade(1, now);
        let b = open_trade(1, now);
        let c = open_trade(1, now);
        for t in [&a, &b, &c] {
            store.insert_trade(t).await.unwrap();
        }
        store.close_trade(&closing(&a, 20.0, now)).await.unwrap();
        store
            .close_trade(&closing(&b, -10.0, now - Duration::days(1)))
            .await
            .unwrap();

        let perf = store.performance(1, now - Duration::hours(1)).await.unwrap();
        assert_eq!(perf.total_trades, 2);
        assert_eq!(perf.wins, 1);
        assert_eq!(perf.losses, 1);
        assert_eq!(perf.win_rate, 50.0);
        assert_eq!(perf.total_pnl, 10.0);
        assert_eq!(perf.today_pnl, 20.0);
    }

    #[tokio::test]
    async fn test_injected_failure_changes_nothing() {
        let store = MemoryStore::new();
        let trade = open_trade(1, Utc::now());

        store.set_fail_writes(true);
        assert!(store.insert_trade(&trade).await.is_err());
        store.set_fail_writes(false);

        assert!(store.trade(trade.id).is_none());
        assert_eq!(store.daily_stats(1, trade.signal_time).await.unwrap().trade_count, 0);
    }
}
