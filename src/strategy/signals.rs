use serde::{Deserialize, Serialize};
use std::fmt;

use crate::indicators::IndicatorVector;
use crate::models::{Direction, Instrument, Signal, SignalSource, Timeframe, TrendLabel};
use crate::risk::pnl::lot_size_for_risk;

/// Configuration for signal generation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalConfig {
    pub min_score: u32, // Winning side needs at least this many votes
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub stoch_oversold: f64,
    pub stoch_overbought: f64,
    pub volume_threshold_multiplier: f64, // Multiple of average volume
    pub ema_crossover_tolerance: f64,     // Relative short/mid gap for a fresh cross
    // Stop distance
    pub sl_atr_multiplier: f64,
    pub default_sl_pips: f64, // Floor for auto stops
    pub manual_sl_atr_multiplier: f64,
    pub manual_min_sl_distance: f64, // Floor for manual stops, price units
    // Reward ratio scaled by trend strength
    pub tp_ratio_min: f64,
    pub tp_ratio_max: f64,
    // Sizing
    pub fixed_risk_amount: f64,
    pub min_lot: f64,
    pub max_lot: f64,
    // Validation
    pub max_spread_pips: f64,
    pub min_sl_pips: f64,
    pub min_tp_pips: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_score: 4,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            stoch_oversold: 20.0,
            stoch_overbought: 80.0,
            volume_threshold_multiplier: 0.5,
            ema_crossover_tolerance: 0.001,
            sl_atr_multiplier: 1.0,
            default_sl_pips: 20.0,
            manual_sl_atr_multiplier: 1.2,
            manual_min_sl_distance: 1.0,
            tp_ratio_min: 1.45,
            tp_ratio_max: 2.50,
            fixed_risk_amount: 10.0,
            min_lot: 0.01,
            max_lot: 1.0,
            max_spread_pips: 10.0,
            min_sl_pips: 5.0,
            min_tp_pips: 10.0,
        }
    }
}

/// Why a detected signal was not tradeable
#[derive(Debug, Clone, PartialEq)]
pub enum SignalRejection {
    SpreadTooWide { spread_pips: f64, max_pips: f64 },
    StopTooTight { sl_pips: f64, min_pips: f64 },
    TargetTooTight { tp_pips: f64, min_pips: f64 },
}

impl fmt::Display for SignalRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalRejection::SpreadTooWide {
                spread_pips,
                max_pips,
            } => write!(f, "Spread too high: {:.2} pips (max: {})", spread_pips, max_pips),
            SignalRejection::StopTooTight { sl_pips, min_pips } => {
                write!(f, "Stop loss too tight: {:.1} pips (< {} pips)", sl_pips, min_pips)
            }
            SignalRejection::TargetTooTight { tp_pips, min_pips } => {
                write!(f, "Take profit too tight: {:.1} pips (< {} pips)", tp_pips, min_pips)
            }
        }
    }
}

// Trend strength tiers: (strong threshold, medium threshold)
const EMA_SPREAD_TIERS: (f64, f64) = (0.003, 0.0015);
const MACD_HIST_TIERS: (f64, f64) = (0.5, 0.2);
const RSI_MOMENTUM_TIERS: (f64, f64) = (0.4, 0.2);
const VOLUME_RATIO_TIERS: (f64, f64) = (1.5, 1.0);
const STRONG_INCREMENT: f64 = 0.25;
const MEDIUM_INCREMENT: f64 = 0.15;

/// Boolean market conditions derived from one indicator vector
#[derive(Debug, Default)]
struct Conditions {
    ema_trend_bullish: bool,
    ema_trend_bearish: bool,
    ema_cross_bullish: bool,
    ema_cross_bearish: bool,
    macd_cross_bullish: bool,
    macd_cross_bearish: bool,
    macd_bullish: bool,
    macd_bearish: bool,
    rsi_bullish: bool,
    rsi_bearish: bool,
    rsi_oversold_exit: bool,
    rsi_overbought_exit: bool,
    stoch_bullish: bool,
    stoch_bearish: bool,
    volume_strong: bool,
}

/// Scores indicator vectors into directional signals
#[derive(Debug, Clone, Default)]
pub struct SignalEngine {
    config: SignalConfig,
    instrument: Instrument,
}

impl SignalEngine {
    pub fn new(config: SignalConfig, instrument: Instrument) -> Self {
        Self { config, instrument }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Detect a signal for the last candle
    ///
    /// Returns `None` when no side qualifies or a required indicator is
    /// missing.
    pub fn detect(
        &self,
        ind: &IndicatorVector,
        source: SignalSource,
        timeframe: Timeframe,
    ) -> Option<Signal> {
        let conditions = self.conditions(ind)?;

        let (direction, reasons) = match source {
            SignalSource::Auto => self.score_auto(&conditions)?,
            SignalSource::Manual => self.score_manual(&conditions)?,
        };

        let (trend_strength, trend_label) = self.trend_strength(ind);
        let rr_ratio = self.reward_ratio(trend_strength);

        let atr = ind.atr?;
        let sl_distance = match source {
            SignalSource::Auto => (atr * self.config.sl_atr_multiplier)
                .max(self.config.default_sl_pips / self.instrument.pip_value),
            SignalSource::Manual => {
                (atr * self.config.manual_sl_atr_multiplier).max(self.config.manual_min_sl_distance)
            }
        };
        let tp_distance = sl_distance * rr_ratio;

        let entry = ind.close;
        let stop_loss = entry - direction.sign() * sl_distance;
        let take_profit = entry + direction.sign() * tp_distance;

        let sl_pips = sl_distance * self.instrument.pip_value;
        let lot_size = lot_size_for_risk(
            self.config.fixed_risk_amount,
            sl_pips,
            self.instrument.default_lot_size,
            self.config.min_lot,
            self.config.max_lot,
        );

        tracing::info!(
            "{} signal detected ({}) on {}: entry={:.2} sl={:.2} tp={:.2} trend={} ({:.2}) rr=1:{:.2}",
            direction,
            source.as_str(),
            timeframe,
            entry,
            stop_loss,
            take_profit,
            trend_label,
            trend_strength,
            rr_ratio
        );

        Some(Signal {
            direction,
            source,
            timeframe,
            entry,
            stop_loss,
            take_profit,
            lot_size,
            trend_strength,
            trend_label,
            rr_ratio,
            reasons,
            indicators: ind.clone(),
        })
    }

    /// Blend trend, momentum and volume into a 0..1 score
    pub fn trend_strength(&self, ind: &IndicatorVector) -> (f64, TrendLabel) {
        let mut score = 0.0;

        if let (Some(short), Some(long)) = (ind.ema_short(), ind.ema_long()) {
            if ind.close > 0.0 {
                score += tier((short - long).abs() / ind.close, EMA_SPREAD_TIERS);
            }
        }

        if let Some(histogram) = ind.macd_histogram {
            score += tier(histogram.abs(), MACD_HIST_TIERS);
        }

        if let Some(rsi) = ind.rsi {
            score += tier((rsi - 50.0).abs() / 50.0, RSI_MOMENTUM_TIERS);
        }

        if let Some(ratio) = ind.volume_ratio() {
            score += tier(ratio, VOLUME_RATIO_TIERS);
        }

        let score = f64::min(score, 1.0);
        (score, TrendLabel::from_score(score))
    }

    /// Reward ratio interpolated between the configured bounds
    pub fn reward_ratio(&self, trend_strength: f64) -> f64 {
        let span = self.config.tp_ratio_max - self.config.tp_ratio_min;
        (self.config.tp_ratio_min + trend_strength * span)
            .max(self.config.tp_ratio_min)
            .min(self.config.tp_ratio_max)
    }

    /// Check a signal against current market conditions before trading it
    pub fn validate(&self, signal: &Signal, spread: f64) -> Result<(), SignalRejection> {
        let pip_value = self.instrument.pip_value;

        let spread_pips = spread * pip_value;
        if spread_pips > self.config.max_spread_pips {
            return Err(SignalRejection::SpreadTooWide {
                spread_pips,
                max_pips: self.config.max_spread_pips,
            });
        }

        let sl_pips = (signal.entry - signal.stop_loss).abs() * pip_value;
        if sl_pips < self.config.min_sl_pips {
            return Err(SignalRejection::StopTooTight {
                sl_pips,
                min_pips: self.config.min_sl_pips,
            });
        }

        let tp_pips = (signal.entry - signal.take_profit).abs() * pip_value;
        if tp_pips < self.config.min_tp_pips {
            return Err(SignalRejection::TargetTooTight {
                tp_pips,
                min_pips: self.config.min_tp_pips,
            });
        }

        Ok(())
    }

    fn conditions(&self, ind: &IndicatorVector) -> Option<Conditions> {
        let short = ind.ema_short()?;
        let mid = ind.ema_mid()?;
        let long = ind.ema_long()?;
        let rsi = ind.rsi?;
        let macd = ind.macd?;
        let macd_signal = ind.macd_signal?;
        ind.atr?;

        let mut c = Conditions {
            ema_trend_bullish: short > mid && mid > long,
            ema_trend_bearish: short < mid && mid < long,
            macd_bullish: macd > macd_signal,
            macd_bearish: macd < macd_signal,
            rsi_bullish: rsi > 50.0,
            rsi_bearish: rsi < 50.0,
            volume_strong: true,
            ..Default::default()
        };

        if mid != 0.0 {
            let near = (short - mid).abs() / mid < self.config.ema_crossover_tolerance;
            c.ema_cross_bullish = short > mid && near;
            c.ema_cross_bearish = short < mid && near;
        }

        if let (Some(macd_prev), Some(signal_prev)) = (ind.macd_prev, ind.macd_signal_prev) {
            c.macd_cross_bullish = macd_prev <= signal_prev && macd > macd_signal;
            c.macd_cross_bearish = macd_prev >= signal_prev && macd < macd_signal;
        }

        if let Some(rsi_prev) = ind.rsi_prev {
            c.rsi_oversold_exit = rsi_prev < self.config.rsi_oversold && rsi >= self.config.rsi_oversold;
            c.rsi_overbought_exit =
                rsi_prev > self.config.rsi_overbought && rsi <= self.config.rsi_overbought;
        }

        if let (Some(k), Some(d), Some(k_prev), Some(d_prev)) =
            (ind.stoch_k, ind.stoch_d, ind.stoch_k_prev, ind.stoch_d_prev)
        {
            c.stoch_bullish = k_prev < d_prev && k > d && k < self.config.stoch_overbought;
            c.stoch_bearish = k_prev > d_prev && k < d && k > self.config.stoch_oversold;
        }

        // Missing volume counts as strong
        if let Some(avg) = ind.volume_avg {
            c.volume_strong = ind.volume > avg * self.config.volume_threshold_multiplier;
        }

        Some(c)
    }

    fn score_auto(&self, c: &Conditions) -> Option<(Direction, Vec<String>)> {
        let mut bull = 0u32;
        let mut bear = 0u32;

        if c.ema_trend_bullish {
            bull += 2;
        }
        if c.ema_trend_bearish {
            bear += 2;
        }

        if c.macd_cross_bullish {
            bull += 2;
        } else if c.macd_bullish {
            bull += 1;
        }
        if c.macd_cross_bearish {
            bear += 2;
        } else if c.macd_bearish {
            bear += 1;
        }

        if c.rsi_bullish {
            bull += 1;
        }
        if c.rsi_bearish {
            bear += 1;
        }
        if c.rsi_oversold_exit {
            bull += 1;
        }
        if c.rsi_overbought_exit {
            bear += 1;
        }

        if c.stoch_bullish {
            bull += 1;
        }
        if c.stoch_bearish {
            bear += 1;
        }

        // Volume only reinforces the side already ahead
        if c.volume_strong {
            if bull > bear {
                bull += 1;
            } else if bear > bull {
                bear += 1;
            }
        }

        tracing::debug!("Signal score: bull={} bear={}", bull, bear);

        let direction = if bull >= self.config.min_score && bull > bear {
            Direction::Buy
        } else if bear >= self.config.min_score && bear > bull {
            Direction::Sell
        } else {
            return None;
        };

        let mut reasons = Vec::new();
        match direction {
            Direction::Buy => {
                if c.ema_trend_bullish {
                    reasons.push("EMA trend bullish".to_string());
                }
                if c.macd_cross_bullish {
                    reasons.push("MACD bullish crossover".to_string());
                } else if c.macd_bullish {
                    reasons.push("MACD bullish".to_string());
                }
                if c.rsi_oversold_exit {
                    reasons.push("RSI leaving oversold".to_string());
                } else if c.rsi_bullish {
                    reasons.push("RSI above 50".to_string());
                }
                if c.stoch_bullish {
                    reasons.push("Stochastic bullish cross".to_string());
                }
                if c.volume_strong {
                    reasons.push("Volume confirms".to_string());
                }
                reasons.push(format!("Signal score: {}/{}", bull, bear));
            }
            Direction::Sell => {
                if c.ema_trend_bearish {
                    reasons.push("EMA trend bearish".to_string());
                }
                if c.macd_cross_bearish {
                    reasons.push("MACD bearish crossover".to_string());
                } else if c.macd_bearish {
                    reasons.push("MACD bearish".to_string());
                }
                if c.rsi_overbought_exit {
                    reasons.push("RSI leaving overbought".to_string());
                } else if c.rsi_bearish {
                    reasons.push("RSI below 50".to_string());
                }
                if c.stoch_bearish {
                    reasons.push("Stochastic bearish cross".to_string());
                }
                if c.volume_strong {
                    reasons.push("Volume confirms".to_string());
                }
                reasons.push(format!("Signal score: {}/{}", bear, bull));
            }
        }

        Some((direction, reasons))
    }

    fn score_manual(&self, c: &Conditions) -> Option<(Direction, Vec<String>)> {
        let ema_bullish = c.ema_trend_bullish || c.ema_cross_bullish;
        let ema_bearish = c.ema_trend_bearish || c.ema_cross_bearish;
        let rsi_bullish = c.rsi_oversold_exit || c.rsi_bullish;
        let rsi_bearish = c.rsi_overbought_exit || c.rsi_bearish;

        let mut reasons = Vec::new();
        let direction = if ema_bullish && c.macd_bullish && rsi_bullish {
            reasons.push("Manual: EMA bullish".to_string());
            reasons.push("MACD bullish".to_string());
            if c.macd_cross_bullish {
                reasons.push("MACD fresh crossover".to_string());
            }
            if c.rsi_oversold_exit {
                reasons.push("RSI leaving oversold".to_string());
            } else {
                reasons.push("RSI bullish".to_string());
            }
            if c.stoch_bullish {
                reasons.push("Stochastic bullish cross".to_string());
            }
            Direction::Buy
        } else if ema_bearish && c.macd_bearish && rsi_bearish {
            reasons.push("Manual: EMA bearish".to_string());
            reasons.push("MACD bearish".to_string());
            if c.macd_cross_bearish {
                reasons.push("MACD fresh crossover".to_string());
            }
            if c.rsi_overbought_exit {
                reasons.push("RSI leaving overbought".to_string());
            } else {
                reasons.push("RSI bearish".to_string());
            }
            if c.stoch_bearish {
                reasons.push("Stochastic bearish cross".to_string());
            }
            Direction::Sell
        } else {
            return None;
        };

        Some((direction, reasons))
    }
}

fn tier(value: f64, (strong, medium): (f64, f64)) -> f64 {
    if value > strong {
        STRONG_INCREMENT
    } else if value > medium {
        MEDIUM_INCREMENT
    } else {
        0.0
    }
}
