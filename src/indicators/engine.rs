use serde::{Deserialize, Serialize};

use super::{atr_series, ema_series, macd_series, rsi_series, sma_series, stochastic_series};
use crate::error::{BotError, Result};
use crate::models::Candle;

/// Indicator periods
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndicatorConfig {
    pub ema_periods: Vec<usize>, // short, mid, long
    pub rsi_period: usize,
    pub stoch_k_period: usize,
    pub stoch_d_period: usize,
    pub stoch_smooth_k: usize,
    pub atr_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub volume_avg_period: usize,
    pub safety_margin: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ema_periods: vec![2, 3, 4],
            rsi_period: 3,
            stoch_k_period: 3,
            stoch_d_period: 2,
            stoch_smooth_k: 2,
            atr_period: 4,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            volume_avg_period: 20,
            safety_margin: 2,
        }
    }
}

impl IndicatorConfig {
    /// Longest configured period plus the safety margin
    pub fn min_candles(&self) -> usize {
        let longest = self
            .ema_periods
            .iter()
            .copied()
            .chain([
                self.rsi_period,
                self.stoch_k_period,
                self.atr_period,
                self.macd_slow,
            ])
            .max()
            .unwrap_or(0);
        longest + self.safety_margin
    }
}

/// Snapshot of every indicator at the last candle, plus the previous value
/// where crossovers need it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorVector {
    pub ema_periods: Vec<usize>,
    pub emas: Vec<f64>,
    pub rsi: Option<f64>,
    pub rsi_prev: Option<f64>,
    pub stoch_k: Option<f64>,
    pub stoch_d: Option<f64>,
    pub stoch_k_prev: Option<f64>,
    pub stoch_d_prev: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub macd_prev: Option<f64>,
    pub macd_signal_prev: Option<f64>,
    pub atr: Option<f64>,
    pub volume: f64,
    pub volume_avg: Option<f64>,
    pub close: f64,
    pub high: f64,
    pub low: f64,
}

impl IndicatorVector {
    pub fn ema_short(&self) -> Option<f64> {
        self.emas.first().copied()
    }

    pub fn ema_mid(&self) -> Option<f64> {
        self.emas.get(1).copied()
    }

    pub fn ema_long(&self) -> Option<f64> {
        self.emas.get(2).copied()
    }

    /// Volume over its average, `None` when the average is missing or zero
    pub fn volume_ratio(&self) -> Option<f64> {
        match self.volume_avg {
            Some(avg) if avg > 0.0 => Some(self.volume / avg),
            _ => None,
        }
    }
}

/// Stateless indicator calculator
#[derive(Debug, Clone, Default)]
pub struct IndicatorEngine {
    config: IndicatorConfig,
}

impl IndicatorEngine {
    pub fn new(config: IndicatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IndicatorConfig {
        &self.config
    }

    /// Compute the indicator vector for the most recent candle
    ///
    /// Fails with `InsufficientData` below `min_candles()`. Callers treat that
    /// as "no decision yet".
    pub fn compute(&self, candles: &[Candle]) -> Result<IndicatorVector> {
        let need = self.config.min_candles();
        if candles.len() < need {
            return Err(BotError::InsufficientData {
                have: candles.len(),
                need,
            });
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<Option<f64>> = candles.iter().map(|c| Some(c.volume)).collect();

        let emas = self
            .config
            .ema_periods
            .iter()
            .filter_map(|period| ema_series(&closes, *period).last().copied())
            .collect();

        let rsi = rsi_series(&closes, self.config.rsi_period);
        let (stoch_k, stoch_d) = stochastic_series(
            candles,
            self.config.stoch_k_period,
            self.config.stoch_d_period,
            self.config.stoch_smooth_k,
        );
        let macd = macd_series(
            &closes,
            self.config.macd_fast,
            self.config.macd_slow,
            self.config.macd_signal,
        );
        let atr = atr_series(candles, self.config.atr_period);
        let volume_avg = sma_series(&volumes, self.config.volume_avg_period);

        let last_candle = candles
            .last()
            .ok_or(BotError::InsufficientData { have: 0, need })?;

        Ok(IndicatorVector {
            ema_periods: self.config.ema_periods.clone(),
            emas,
            rsi: last(&rsi),
            rsi_prev: prev(&rsi),
            stoch_k: last(&stoch_k),
            stoch_d: last(&stoch_d),
            stoch_k_prev: prev(&stoch_k),
            stoch_d_prev: prev(&stoch_d),
            macd: macd.macd.last().copied(),
            macd_signal: macd.signal.last().copied(),
            macd_histogram: macd.histogram.last().copied(),
            macd_prev: macd.macd.iter().rev().nth(1).copied(),
            macd_signal_prev: macd.signal.iter().rev().nth(1).copied(),
            atr: last(&atr),
            volume: last_candle.volume,
            volume_avg: last(&volume_avg),
            close: last_candle.close,
            high: last_candle.high,
            low: last_candle.low,
        })
    }
}

fn last(series: &[Option<f64>]) -> Option<f64> {
    series.last().copied().flatten()
}

fn prev(series: &[Option<f64>]) -> Option<f64> {
    series.iter().rev().nth(1).copied().flatten()
}
