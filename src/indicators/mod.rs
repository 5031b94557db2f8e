// Technical indicators module
// Series calculators plus the engine that snapshots them per candle window

pub mod atr;
pub mod engine;
pub mod macd;
pub mod moving_average;
pub mod rsi;
pub mod stochastic;

pub use atr::{atr_series, true_range_series};
pub use engine::{IndicatorConfig, IndicatorEngine, IndicatorVector};
pub use macd::{macd_series, MacdSeries};
pub use moving_average::{ema_series, sma_series};
pub use rsi::rsi_series;
pub use stochastic::stochastic_series;
