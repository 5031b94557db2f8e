// Persistence: Store trait plus in-memory and Postgres backends
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::execution::{ExitReason, Position};
use crate::models::{SignalLog, Trade, TradeResult, UserId};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Everything needed to close a trade and its position in one transaction
#[derive(Debug, Clone, PartialEq)]
pub struct TradeClose {
    pub trade_id: Uuid,
    pub position_id: Uuid,
    pub user: UserId,
    pub exit_price: f64,
    pub actual_pnl: f64,
    pub result: TradeResult,
    pub exit_reason: ExitReason,
    pub closed_at: DateTime<Utc>,
    pub day: NaiveDate, // Trading day the PnL is booked to
}

/// Counters the risk gate needs for one user since a day boundary
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DailyStats {
    pub trade_count: u32,
    pub realized_pnl: f64,
}

/// Aggregate row per user and trading day
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyPerformance {
    pub user: UserId,
    pub day: NaiveDate,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub pnl: f64,
}

impl DailyPerformance {
    pub fn record(&mut self, result: TradeResult, pnl: f64) {
        self.trades += 1;
        match result {
            TradeResult::Win => self.wins += 1,
            TradeResult::Loss => self.losses += 1,
        }
        self.pnl += pnl;
    }
}

/// Lifetime summary over closed trades
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64, // percent
    pub total_pnl: f64,
    pub today_pnl: f64,
}

impl PerformanceSummary {
    /// Build from closed trades; `today_pnl` counts trades closed at or after `day_start`
    pub fn from_closed<'a>(trades: impl IntoIterator<Item = &'a Trade>, day_start: DateTime<Utc>) -> Self {
        let mut summary = Self::default();

        for trade in trades {
            let pnl = trade.actual_pnl.unwrap_or(0.0);
            summary.total_trades += 1;
            match trade.result {
                Some(TradeResult::Win) => summary.wins += 1,
                _ => summary.losses += 1,
            }
            summary.total_pnl += pnl;
            if trade.close_time.is_some_and(|t| t >= day_start) {
                summary.today_pnl += pnl;
            }
        }

        if summary.total_trades > 0 {
            summary.win_rate = summary.wins as f64 / summary.total_trades as f64 * 100.0;
        }

        summary
    }
}

/// Persistence operations used by the pipeline
///
/// Each call is one short transaction. `close_trade` must fail, and change
/// nothing, if the trade is not OPEN.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_trade(&self, trade: &Trade) -> Result<()>;

    /// Close trade and position, and book the result into the daily row
    async fn close_trade(&self, close: &TradeClose) -> Result<()>;

    /// Upsert a position snapshot; a CLOSED row is never overwritten
    async fn save_position(&self, position: &Position) -> Result<()>;

    async fn load_active_positions(&self) -> Result<Vec<Position>>;

    async fn log_signal(&self, log: &SignalLog) -> Result<()>;

    /// Trades signalled since `since` and the realized PnL among them
    async fn daily_stats(&self, user: UserId, since: DateTime<Utc>) -> Result<DailyStats>;

    async fn performance(&self, user: UserId, day_start: DateTime<Utc>) -> Result<PerformanceSummary>;

}
