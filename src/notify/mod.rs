// Outbound notifications and chart rendering
pub mod telegram;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::execution::ExitReason;
use crate::models::{Candle, Direction, Signal, TradeResult, UserId};

pub use telegram::TelegramNotifier;

/// Notification settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotifyConfig {
    pub telegram_token: Option<String>,
    pub api_base_url: String,
    pub rate_limit_per_second: u32,
    pub request_timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            telegram_token: None,
            api_base_url: "https://api.telegram.org".to_string(),
            rate_limit_per_second: 25, // Bot API allows ~30 msg/s overall
            request_timeout_secs: 10,
        }
    }
}

/// Reference to a rendered chart (URL or file id the channel understands)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef(pub String);

/// Structured event payloads; formatting is the channel's concern
#[derive(Debug, Clone)]
pub enum Event {
    SignalOpened {
        trade_id: Uuid,
        signal: Box<Signal>,
    },
    SignalRejected {
        direction: Direction,
        reason: String,
    },
    StopAdjusted {
        position_id: Uuid,
        direction: Direction,
        old_stop: f64,
        new_stop: f64,
        unrealized_pnl: f64,
    },
    PositionClosed {
        position_id: Uuid,
        trade_id: Uuid,
        direction: Direction,
        entry_price: f64,
        exit_price: f64,
        pnl: f64,
        result: TradeResult,
        reason: ExitReason,
    },
    FeedDegraded {
        attempts: u32,
    },
    FeedRestored,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::SignalOpened { .. } => "signal_opened",
            Event::SignalRejected { .. } => "signal_rejected",
            Event::StopAdjusted { .. } => "stop_adjusted",
            Event::PositionClosed { .. } => "position_closed",
            Event::FeedDegraded { .. } => "feed_degraded",
            Event::FeedRestored => "feed_restored",
        }
    }

    /// Plain-text rendering used by text channels
    pub fn render(&self) -> String {
        match self {
            Event::SignalOpened { signal, .. } => {
                let mut text = format!(
                    "{} XAUUSD ({}, {})\nEntry: {:.2}\nSL: {:.2}\nTP: {:.2}\nLot: {:.2}\nTrend: {} ({:.2}) R:R 1:{:.2}",
                    signal.direction,
                    signal.source.as_str(),
                    signal.timeframe,
                    signal.entry,
                    signal.stop_loss,
                    signal.take_profit,
                    signal.lot_size,
                    signal.trend_label,
                    signal.trend_strength,
                    signal.rr_ratio
                );
                for reason in &signal.reasons {
                    text.push_str("\n- ");
                    text.push_str(reason);
                }
                text
            }
            Event::SignalRejected { direction, reason } => {
                format!("{} signal rejected: {}", direction, reason)
            }
            Event::StopAdjusted {
                direction,
                old_stop,
                new_stop,
                unrealized_pnl,
                ..
            } => format!(
                "{} stop tightened {:.2} -> {:.2} (unrealized ${:.2})",
                direction, old_stop, new_stop, unrealized_pnl
            ),
            Event::PositionClosed {
                direction,
                entry_price,
                exit_price,
                pnl,
                result,
                reason,
                ..
            } => format!(
                "{} closed: {}\nEntry: {:.2}\nExit: {:.2}\nPnL: ${:.2} ({})",
                direction,
                reason.as_str(),
                entry_price,
                exit_price,
                pnl,
                result.as_str()
            ),
            Event::FeedDegraded { attempts } => format!(
                "Live feed lost after {} reconnect attempts. Signals are now driven by SIMULATED prices.",
                attempts
            ),
            Event::FeedRestored => "Live feed restored. Simulation stopped.".to_string(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: UserId, event: &Event, image: Option<&ImageRef>) -> Result<()>;
}

#[async_trait]
pub trait ChartRenderer: Send + Sync {
    async fn render(&self, candles: &[Candle], signal: Option<&Signal>) -> Result<ImageRef>;
}

/// Notifier that only writes events to the log (dry runs)
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipient: UserId, event: &Event, image: Option<&ImageRef>) -> Result<()> {
        tracing::info!(
            recipient,
            kind = event.kind(),
            image = image.map(|i| i.0.as_str()),
            "{}",
            event.render()
        );
        Ok(())
    }
}

/// Send one event to several recipients; failures are logged only
pub async fn notify_all(notifier: &dyn Notifier, recipients: &[UserId], event: &Event) {
    for recipient in recipients {
        if let Err(e) = notifier.notify(*recipient, event, None).await {
            tracing::warn!("Failed to notify {} of {}: {}", recipient, event.kind(), e);
        }
    }
}
