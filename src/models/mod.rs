use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::BotError;
use crate::indicators::IndicatorVector;

/// Chat/user identifier (Telegram chat ids are signed 64-bit)
pub type UserId = i64;

/// Instrument constants shared by sizing, PnL and validation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Instrument {
    pub symbol: String,
    pub ticker: String,
    pub pip_value: f64,        // price units -> pips, also $ per pip per lot
    pub default_lot_size: f64, // Used when a stop distance is zero
}

impl Default for Instrument {
    fn default() -> Self {
        Self {
            symbol: "frxXAUUSD".to_string(),
            ticker: "XAUUSD".to_string(),
            pip_value: 10.0,
            default_lot_size: 0.01,
        }
    }
}

/// One bid/ask update from the feed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(bid: f64, ask: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            bid,
            ask,
            mid: (bid + ask) / 2.0,
            timestamp,
        }
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

/// Candle period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
}

impl Timeframe {
    pub fn duration_secs(self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::H1 => 3600,
        }
    }

    /// Floor-align a timestamp to the start of its period
    ///
    /// Aligned timestamps map to themselves, so the result is the same no
    /// matter how many ticks land in the period.
    pub fn period_start(self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let secs = timestamp.timestamp();
        let start = secs - secs.rem_euclid(self.duration_secs());
        DateTime::from_timestamp(start, 0).unwrap_or(timestamp)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::H1 => "H1",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "M1" => Ok(Timeframe::M1),
            "M5" => Ok(Timeframe::M5),
            "M15" => Ok(Timeframe::M15),
            "H1" => Ok(Timeframe::H1),
            other => Err(BotError::Config(format!("Unknown timeframe: {}", other))),
        }
    }
}

/// OHLC candle
///
/// `volume` is the number of ticks folded into the candle. The feed carries no
/// traded volume, so backfilled bars may report 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub period_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// +1 for BUY, -1 for SELL
    pub fn sign(self) -> f64 {
        match self {
            Direction::Buy => 1.0,
            Direction::Sell => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Direction::Buy),
            "SELL" => Ok(Direction::Sell),
            other => Err(BotError::Store(format!("Invalid direction: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Auto,
    Manual,
}

impl SignalSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalSource::Auto => "auto",
            SignalSource::Manual => "manual",
        }
    }
}

impl FromStr for SignalSource {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(SignalSource::Auto),
            "manual" => Ok(SignalSource::Manual),
            other => Err(BotError::Store(format!("Invalid signal source: {}", other))),
        }
    }
}

/// Discrete trend strength bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendLabel {
    Weak,
    Medium,
    Strong,
    VeryStrong,
}

impl TrendLabel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.75 {
            TrendLabel::VeryStrong
        } else if score >= 0.5 {
            TrendLabel::Strong
        } else if score >= 0.3 {
            TrendLabel::Medium
        } else {
            TrendLabel::Weak
        }
    }
}

impl fmt::Display for TrendLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TrendLabel::Weak => "WEAK",
            TrendLabel::Medium => "MEDIUM",
            TrendLabel::Strong => "STRONG",
            TrendLabel::VeryStrong => "VERY STRONG",
        };
        f.write_str(label)
    }
}

/// Directional trade signal with computed levels and size
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    pub source: SignalSource,
    pub timeframe: Timeframe,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub lot_size: f64,
    pub trend_strength: f64, // 0..1
    pub trend_label: TrendLabel,
    pub rr_ratio: f64,
    pub reasons: Vec<String>,
    pub indicators: IndicatorVector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
        }
    }
}

impl FromStr for TradeStatus {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(TradeStatus::Open),
            "CLOSED" => Ok(TradeStatus::Closed),
            other => Err(BotError::Store(format!("Invalid trade status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeResult {
    Win,
    Loss,
}

impl TradeResult {
    /// WIN only for strictly positive PnL
    pub fn from_pnl(pnl: f64) -> Self {
        if pnl > 0.0 {
            TradeResult::Win
        } else {
            TradeResult::Loss
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TradeResult::Win => "WIN",
            TradeResult::Loss => "LOSS",
        }
    }
}

impl FromStr for TradeResult {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WIN" => Ok(TradeResult::Win),
            "LOSS" => Ok(TradeResult::Loss),
            other => Err(BotError::Store(format!("Invalid trade result: {}", other))),
        }
    }
}

/// Persisted trade record (OPEN -> CLOSED, immutable once closed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub user: UserId,
    pub ticker: String,
    pub direction: Direction,
    pub source: SignalSource,
    pub timeframe: Timeframe,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub lot_size: f64,
    pub spread: f64,
    pub estimated_pnl: f64, // PnL if take profit is hit
    pub status: TradeStatus,
    pub result: Option<TradeResult>,
    pub actual_pnl: Option<f64>,
    pub exit_price: Option<f64>,
    pub signal_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
}

/// Audit record for every detected signal, accepted or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalLog {
    pub user: UserId,
    pub ticker: String,
    pub direction: Direction,
    pub source: SignalSource,
    pub entry_price: f64,
    pub indicators: String, // JSON snapshot of the indicator vector
    pub accepted: bool,
    pub rejection_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Read-only process status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub feed_connected: bool,
    pub simulator_active: bool,
    pub active_position_count: usize,
    pub reconnect_attempts: u32,
    pub subscriber_count: usize,
    pub dropped_ticks: u64,
}
