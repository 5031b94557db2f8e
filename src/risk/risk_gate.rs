use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::db::Store;
use crate::models::{Direction, UserId};

/// Admission limits per user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskConfig {
    pub cooldown_secs: i64,
    pub max_trades_per_day: u32,
    pub daily_loss_limit: f64, // Currency, compared against realized PnL today
    pub day_utc_offset_hours: i32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30,
            max_trades_per_day: 50,
            daily_loss_limit: 30.0,
            day_utc_offset_hours: 7, // Asia/Jakarta, no DST
        }
    }
}

impl RiskConfig {
    pub fn calendar(&self) -> TradingCalendar {
        TradingCalendar::new(self.day_utc_offset_hours)
    }
}

/// Trading-day boundaries in a fixed UTC offset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradingCalendar {
    offset: FixedOffset,
}

impl Default for TradingCalendar {
    fn default() -> Self {
        RiskConfig::default().calendar()
    }
}

impl TradingCalendar {
    pub fn new(utc_offset_hours: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    pub fn day_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// UTC instant of local midnight for the day containing `at`
    pub fn day_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.day_of(at)
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| self.offset.from_local_datetime(&midnight).single())
            .map(|start| start.with_timezone(&Utc))
            .unwrap_or(at)
    }
}

/// Reason a user may not open a trade right now
#[derive(Debug, Clone, PartialEq)]
pub enum RiskTrip {
    Cooldown { remaining_secs: i64 },
    DailyTradeLimit { limit: u32 },
    DailyLossLimit { limit: f64 },
    StoreUnavailable(String),
}

impl fmt::Display for RiskTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTrip::Cooldown { remaining_secs } => {
                write!(f, "Cooldown active, wait {} more seconds", remaining_secs)
            }
            RiskTrip::DailyTradeLimit { limit } => {
                write!(f, "Daily limit of {} trades reached", limit)
            }
            RiskTrip::DailyLossLimit { limit } => {
                write!(f, "Daily loss limit of ${:.2} reached", limit)
            }
            RiskTrip::StoreUnavailable(e) => write!(f, "Risk check unavailable: {}", e),
        }
    }
}

/// Cooldown, daily-cap and daily-loss admission control
pub struct RiskGate {
    config: RiskConfig,
    calendar: TradingCalendar,
    store: Arc<dyn Store>,
    last_signal: DashMap<UserId, DateTime<Utc>>,
}

impl RiskGate {
    pub fn new(config: RiskConfig, store: Arc<dyn Store>) -> Self {
        Self {
            calendar: config.calendar(),
            config,
            store,
            last_signal: DashMap::new(),
        }
    }

    pub fn calendar(&self) -> TradingCalendar {
        self.calendar
    }

    pub async fn can_trade(&self, user: UserId, direction: Direction) -> Result<(), RiskTrip> {
        self.can_trade_at(user, direction, Utc::now()).await
    }

    /// Checks run in order and the first failure wins
    ///
    /// A store error fails closed.
    pub async fn can_trade_at(
        &self,
        user: UserId,
        direction: Direction,
        now: DateTime<Utc>,
    ) -> Result<(), RiskTrip> {
        if let Some(last) = self.last_signal.get(&user).map(|entry| *entry) {
            let elapsed = now - last;
            let cooldown = Duration::seconds(self.config.cooldown_secs);
            if elapsed < cooldown {
                // Round up so "wait 0 seconds" is never reported
                let remaining_ms = (cooldown - elapsed).num_milliseconds();
                return Err(RiskTrip::Cooldown {
                    remaining_secs: (remaining_ms + 999) / 1000,
                });
            }
        }

        let since = self.calendar.day_start(now);
        let stats = self
            .store
            .daily_stats(user, since)
            .await
            .map_err(|e| RiskTrip::StoreUnavailable(e.to_string()))?;

        if stats.trade_count >= self.config.max_trades_per_day {
            return Err(RiskTrip::DailyTradeLimit {
                limit: self.config.max_trades_per_day,
            });
        }

        if stats.realized_pnl < 0.0 && -stats.realized_pnl >= self.config.daily_loss_limit {
            return Err(RiskTrip::DailyLossLimit {
                limit: self.config.daily_loss_limit,
            });
        }

        tracing::debug!(user, direction = %direction, "Risk checks passed");

        Ok(())
    }

    /// Stamp an accepted signal, restarting the cooldown
    pub fn record(&self, user: UserId) {
        self.record_at(user, Utc::now());
    }

    pub fn record_at(&self, user: UserId, at: DateTime<Utc>) {
        self.last_signal.insert(user, at);
        tracing::debug!(user, "Signal recorded, cooldown started");
    }

    /// Clear the cooldown for a user
    pub fn reset(&self, user: UserId) {
        self.last_signal.remove(&user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, TradeClose};
    use crate::execution::ExitReason;
    use crate::models::{SignalSource, Timeframe, Trade, TradeResult, TradeStatus};
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap()
    }

    fn trade(user: UserId, at: DateTime<Utc>) -> Trade {
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
            spread: 0.3,
            estimated_pnl: 20.0,
            status: TradeStatus::Open,
            result: None,
            actual_pnl: None,
            exit_price: None,
            signal_time: at,
            close_time: None,
        }
    }

    #[tokio::test]
    async fn test_cooldown_scenario() {
        let gate = RiskGate::new(RiskConfig::default(), Arc::new(MemoryStore::new()));

        assert!(gate.can_trade_at(1, Direction::Buy, t0()).await.is_ok());
        gate.record_at(1, t0());

        let at_10 = t0() + Duration::seconds(10);
        let trip = gate.can_trade_at(1, Direction::Buy, at_10).await.unwrap_err();
        assert_eq!(trip, RiskTrip::Cooldown { remaining_secs: 20 });
        assert!(trip.to_string().contains("Cooldown"));

        let at_31 = t0() + Duration::seconds(31);
        assert!(gate.can_trade_at(1, Direction::Buy, at_31).await.is_ok());
    }

    #[tokio::test]
    async fn test_cooldown_is_per_user() {
        let gate = RiskGate::new(RiskConfig::default(), Arc::new(MemoryStore::new()));
        gate.record_at(1, t0());

        let at_5 = t0() + Duration::seconds(5);
        assert!(gate.can_trade_at(2, Direction::Sell, at_5).await.is_ok());

        gate.reset(1);
        assert!(gate.can_trade_at(1, Direction::Sell, at_5).await.is_ok());
    }

    #[tokio::test]
    async fn test_daily_trade_limit() {
        let store = Arc::new(MemoryStore::new());
        let config = RiskConfig {
            max_trades_per_day: 2,
            ..Default::default()
        };
        let gate = RiskGate::new(config, store.clone());

        store.insert_trade(&trade(1, t0())).await.unwrap();
        assert!(gate.can_trade_at(1, Direction::Buy, t0()).await.is_ok());

        store.insert_trade(&trade(1, t0())).await.unwrap();
        assert_eq!(
            gate.can_trade_at(1, Direction::Buy, t0()).await,
            Err(RiskTrip::DailyTradeLimit { limit: 2 })
        );
    }

    #[tokio::test]
    async fn test_daily_loss_limit() {
        let store = Arc::new(MemoryStore::new());
        let gate = RiskGate::new(RiskConfig::default(), store.clone());

        let losing = trade(1, t0());
        store.insert_trade(&losing).await.unwrap();
        store
            .close_trade(&TradeClose {
                trade_id: losing.id,
                position_id: Uuid::new_v4(),
                user: 1,
                exit_price: 2644.0,
                actual_pnl: -30.0,
                result: TradeResult::Loss,
                exit_reason: ExitReason::SlHit,
                closed_at: t0(),
                day: gate.calendar().day_of(t0()),
            })
            .await
            .unwrap();

        assert_eq!(
            gate.can_trade_at(1, Direction::Buy, t0()).await,
            Err(RiskTrip::DailyLossLimit { limit: 30.0 })
        );
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        struct BrokenStore;

        #[async_trait::async_trait]
        impl Store for BrokenStore {
            async fn insert_trade(&self, _: &Trade) -> crate::Result<()> {
                unimplemented!()
            }
            async fn close_trade(&self, _: &TradeClose) -> crate::Result<()> {
                unimplemented!()
            }
            async fn save_position(&self, _: &crate::execution::Position) -> crate::Result<()> {
                unimplemented!()
            }
            async fn load_active_positions(&self) -> crate::Result<Vec<crate::execution::Position>> {
                unimplemented!()
            }
            async fn log_signal(&self, _: &crate::models::SignalLog) -> crate::Result<()> {
                unimplemented!()
            }
            async fn daily_stats(
                &self,
                _: UserId,
                _: DateTime<Utc>,
            ) -> crate::Result<crate::db::DailyStats> {
                Err(crate::BotError::Store("connection refused".to_string()))
            }
            async fn performance(
                &self,
                _: UserId,
                _: DateTime<Utc>,
            ) -> crate::Result<crate::db::PerformanceSummary> {
                unimplemented!()
            }
        }

        let gate = RiskGate::new(RiskConfig::default(), Arc::new(BrokenStore));
        let trip = gate.can_trade_at(1, Direction::Buy, t0()).await.unwrap_err();
        assert!(matches!(trip, RiskTrip::StoreUnavailable(_)));
    }

    #[test]
    fn test_day_boundary_in_offset() {
        let calendar = TradingCalendar::new(7);

        // 16:59 UTC is 23:59 in UTC+7; 17:00 UTC starts the next local day
        let before = Utc.with_ymd_and_hms(2024, 5, 1, 16, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 17, 0, 0).unwrap();

        assert_ne!(calendar.day_of(before), calendar.day_of(after));
        assert_eq!(calendar.day_start(after), after);
        assert_eq!(
            calendar.day_start(before),
            Utc.with_ymd_and_hms(2024, 4, 30, 17, 0, 0).unwrap()
        );
    }
}
