use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use super::{DailyStats, PerformanceSummary, Store, TradeClose};
use crate::error::{BotError, Result};
use crate::execution::{ExitReason, Position, PositionStatus};
use crate::models::{SignalLog, Trade, TradeResult, TradeStatus, UserId};

/// Postgres persistence for trades, positions and signal logs
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to Postgres and run migrations
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }
}

fn dec(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default()
}

fn get_f64(row: &PgRow, column: &str) -> Result<f64> {
    let value: Decimal = row.try_get(column)?;
    value
        .to_f64()
        .ok_or_else(|| BotError::Store(format!("{} out of range", column)))
}

fn get_opt_f64(row: &PgRow, column: &str) -> Result<Option<f64>> {
    let value: Option<Decimal> = row.try_get(column)?;
    value
        .map(|v| {
            v.to_f64()
                .ok_or_else(|| BotError::Store(format!("{} out of range", column)))
        })
        .transpose()
}

fn trade_from_row(row: &PgRow) -> Result<Trade> {
    let direction: String = row.try_get("direction")?;
    let source: String = row.try_get("source")?;
    let timeframe: String = row.try_get("timeframe")?;
    let status: String = row.try_get("status")?;
    let result: Option<String> = row.try_get("result")?;

    Ok(Trade {
        id: row.try_get("id")?,
        user: row.try_get("user_id")?,
        ticker: row.try_get("ticker")?,
        direction: direction.parse()?,
        source: source.parse()?,
        timeframe: timeframe.parse()?,
        entry_price: get_f64(row, "entry_price")?,
        stop_loss: get_f64(row, "stop_loss")?,
        take_profit: get_f64(row, "take_profit")?,
        lot_size: get_f64(row, "lot_size")?,
        spread: get_f64(row, "spread")?,
        estimated_pnl: get_f64(row, "estimated_pnl")?,
        status: status.parse()?,
        result: result.map(|r| r.parse::<TradeResult>()).transpose()?,
        actual_pnl: get_opt_f64(row, "actual_pnl")?,
        exit_price: get_opt_f64(row, "exit_price")?,
        signal_time: row.try_get("signal_time")?,
        close_time: row.try_get("close_time")?,
    })
}

fn position_from_row(row: &PgRow) -> Result<Position> {
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;
    let exit_reason: Option<String> = row.try_get("exit_reason")?;
    let adjustments: i32 = row.try_get("stop_adjustment_count")?;

    Ok(Position {
        id: row.try_get("id")?,
        trade_id: row.try_get("trade_id")?,
        user: row.try_get("user_id")?,
        direction: direction.parse()?,
        entry_price: get_f64(row, "entry_price")?,
        lot_size: get_f64(row, "lot_size")?,
        take_profit: get_f64(row, "take_profit")?,
        current_stop_loss: get_f64(row, "current_stop_loss")?,
        original_stop_loss: get_f64(row, "original_stop_loss")?,
        stop_adjustment_count: adjustments.max(0) as u32,
        max_profit_reached: get_f64(row, "max_profit_reached")?,
        current_price: get_f64(row, "current_price")?,
        unrealized_pnl: get_f64(row, "unrealized_pnl")?,
        status: status.parse()?,
        exit_reason: exit_reason.map(|r| r.parse::<ExitReason>()).transpose()?,
        opened_at: row.try_get("opened_at")?,
        last_update_time: row.try_get("last_update_time")?,
        closed_at: row.try_get("closed_at")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, user_id, ticker, direction, source, timeframe,
                entry_price, stop_loss, take_profit, lot_size, spread, estimated_pnl,
                status, signal_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(trade.id)
        .bind(trade.user)
        .bind(&trade.ticker)
        .bind(trade.direction.as_str())
        .bind(trade.source.as_str())
        .bind(trade.timeframe.as_str())
        .bind(dec(trade.entry_price))
        .bind(dec(trade.stop_loss))
        .bind(dec(trade.take_profit))
        .bind(dec(trade.lot_size))
        .bind(dec(trade.spread))
        .bind(dec(trade.estimated_pnl))
        .bind(trade.status.as_str())
        .bind(trade.signal_time)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Saved trade {} for user {}", trade.id, trade.user);

        Ok(())
    }

    async fn close_trade(&self, close: &TradeClose) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE trades
            SET status = 'CLOSED', result = $2, actual_pnl = $3, exit_price = $4, close_time = $5
            WHERE id = $1 AND status = 'OPEN'
            "#,
        )
        .bind(close.trade_id)
        .bind(close.result.as_str())
        .bind(dec(close.actual_pnl))
        .bind(dec(close.exit_price))
        .bind(close.closed_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Dropping the transaction rolls it back
            return Err(BotError::Store(format!(
                "trade {} is not open",
                close.trade_id
            )));
        }

        sqlx::query(
            r#"
            UPDATE positions
            SET status = 'CLOSED', exit_reason = $2, current_price = $3, unrealized_pnl = $4,
                closed_at = $5, last_update_time = $5
            WHERE id = $1
            "#,
        )
        .bind(close.position_id)
        .bind(close.exit_reason.as_str())
        .bind(dec(close.exit_price))
        .bind(dec(close.actual_pnl))
        .bind(close.closed_at)
        .execute(&mut *tx)
        .await?;

        let (win, loss) = match close.result {
            TradeResult::Win => (1i32, 0i32),
            TradeResult::Loss => (0, 1),
        };

        sqlx::query(
            r#"
            INSERT INTO performance (user_id, day, trades, wins, losses, pnl)
            VALUES ($1, $2, 1, $3, $4, $5)
            ON CONFLICT (user_id, day) DO UPDATE SET
                trades = performance.trades + 1,
                wins = performance.wins + EXCLUDED.wins,
                losses = performance.losses + EXCLUDED.losses,
                pnl = performance.pnl + EXCLUDED.pnl
            "#,
        )
        .bind(close.user)
        .bind(close.day)
        .bind(win)
        .bind(loss)
        .bind(dec(close.actual_pnl))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!("Closed trade {} ({})", close.trade_id, close.result.as_str());

        Ok(())
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, trade_id, user_id, direction, entry_price, lot_size, take_profit,
                current_stop_loss, original_stop_loss, stop_adjustment_count,
                max_profit_reached, current_price, unrealized_pnl, status, exit_reason,
                opened_at, last_update_time, closed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (id) DO UPDATE SET
                current_stop_loss = EXCLUDED.current_stop_loss,
                stop_adjustment_count = EXCLUDED.stop_adjustment_count,
                max_profit_reached = EXCLUDED.max_profit_reached,
                current_price = EXCLUDED.current_price,
                unrealized_pnl = EXCLUDED.unrealized_pnl,
                last_update_time = EXCLUDED.last_update_time
            WHERE positions.status <> 'CLOSED'
            "#,
        )
        .bind(position.id)
        .bind(position.trade_id)
        .bind(position.user)
        .bind(position.direction.as_str())
        .bind(dec(position.entry_price))
        .bind(dec(position.lot_size))
        .bind(dec(position.take_profit))
        .bind(dec(position.current_stop_loss))
        .bind(dec(position.original_stop_loss))
        .bind(position.stop_adjustment_count as i32)
        .bind(dec(position.max_profit_reached))
        .bind(dec(position.current_price))
        .bind(dec(position.unrealized_pnl))
        .bind(position.status.as_str())
        .bind(position.exit_reason.map(|r| r.as_str()))
        .bind(position.opened_at)
        .bind(position.last_update_time)
        .bind(position.closed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_active_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT id, trade_id, user_id, direction, entry_price, lot_size, take_profit,
                   current_stop_loss, original_stop_loss, stop_adjustment_count,
                   max_profit_reached, current_price, unrealized_pnl, status, exit_reason,
                   opened_at, last_update_time, closed_at
            FROM positions
            WHERE status = $1
            ORDER BY opened_at ASC
            "#,
        )
        .bind(PositionStatus::Active.as_str())
        .fetch_all(&self.pool)
        .await?;

        let positions = rows
            .iter()
            .map(position_from_row)
            .collect::<Result<Vec<_>>>()?;

        tracing::info!("Loaded {} active positions from Postgres", positions.len());

        Ok(positions)
    }

    async fn log_signal(&self, log: &SignalLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO signal_logs (
                user_id, ticker, direction, source, entry_price, indicators,
                accepted, rejection_reason, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(log.user)
        .bind(&log.ticker)
        .bind(log.direction.as_str())
        .bind(log.source.as_str())
        .bind(dec(log.entry_price))
        .bind(&log.indicators)
        .bind(log.accepted)
        .bind(&log.rejection_reason)
        .bind(log.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn daily_stats(&self, user: UserId, since: DateTime<Utc>) -> Result<DailyStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS trade_count, COALESCE(SUM(actual_pnl), 0) AS realized_pnl
            FROM trades
            WHERE user_id = $1 AND signal_time >= $2
            "#,
        )
        .bind(user)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let trade_count: i64 = row.try_get("trade_count")?;

        Ok(DailyStats {
            trade_count: trade_count.max(0) as u32,
            realized_pnl: get_f64(&row, "realized_pnl")?,
        })
    }

    async fn performance(&self, user: UserId, day_start: DateTime<Utc>) -> Result<PerformanceSummary> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM trades
            WHERE user_id = $1 AND status = $2
            "#,
        )
        .bind(user)
        .bind(TradeStatus::Closed.as_str())
        .fetch_all(&self.pool)
        .await?;

        let trades = rows
            .iter()
            .map(trade_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(PerformanceSummary::from_closed(&trades, day_start))
    }
}
