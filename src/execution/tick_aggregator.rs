use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::models::{Candle, Timeframe};

/// Aggregator settings shared by every timeframe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AggregatorConfig {
    pub timeframes: Vec<Timeframe>,
    pub capacity: usize, // Closed candles kept per timeframe
    pub backfill_count: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            timeframes: vec![Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1],
            capacity: 500,
            backfill_count: 200,
        }
    }
}

/// Builds OHLC candles for one timeframe from a tick stream
///
/// Closed candles live in a fixed-capacity ring (oldest evicted). The open
/// candle is mutated in place until a tick from a later period arrives.
#[derive(Debug, Clone)]
pub struct TickAggregator {
    timeframe: Timeframe,
    capacity: usize,
    closed: VecDeque<Candle>,
    current: Option<Candle>,
    dropped_ticks: u64,
}

impl TickAggregator {
    pub fn new(timeframe: Timeframe, capacity: usize) -> Self {
        Self {
            timeframe,
            capacity: capacity.max(1),
            closed: VecDeque::with_capacity(capacity.max(1)),
            current: None,
            dropped_ticks: 0,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Fold one tick into the open candle
    ///
    /// Returns the candle that was finalized when this tick opened a new
    /// period. A tick from a period older than the open candle is dropped and
    /// counted; an older timestamp inside the open period is folded in.
    pub fn add_tick(&mut self, bid: f64, ask: f64, timestamp: DateTime<Utc>) -> Option<Candle> {
        let mid = (bid + ask) / 2.0;
        let period_start = self.timeframe.period_start(timestamp);

        if let Some(candle) = self.current.as_mut() {
            if candle.period_start == period_start {
                candle.high = candle.high.max(mid);
                candle.low = candle.low.min(mid);
                candle.close = mid;
                candle.volume += 1.0;
                return None;
            }

            if period_start < candle.period_start {
                tracing::debug!(
                    timeframe = %self.timeframe,
                    tick_time = %timestamp,
                    open_period = %candle.period_start,
                    "Dropped out-of-order tick"
                );
                self.dropped_ticks += 1;
                return None;
            }
        }

        let finished = self.current.replace(Candle {
            period_start,
            open: mid,
            high: mid,
            low: mid,
            close: mid,
            volume: 1.0,
        });
        if let Some(candle) = &finished {
            self.push_closed(candle.clone());
        }
        finished
    }

    /// Up to `limit` candles, oldest first, including the open candle
    pub fn get_candles(&self, limit: usize) -> Vec<Candle> {
        let total = self.len();
        let skip = total.saturating_sub(limit);
        self.closed
            .iter()
            .chain(self.current.iter())
            .skip(skip)
            .cloned()
            .collect()
    }

    /// Pre-populate with historical bars
    ///
    /// Bars must be older than the open candle and newer than the last closed
    /// one; anything else is ignored. Returns the number of bars kept.
    pub fn seed(&mut self, mut candles: Vec<Candle>) -> usize {
        candles.sort_by_key(|c| c.period_start);

        let upper = self.current.as_ref().map(|c| c.period_start);
        let mut lower = self.closed.back().map(|c| c.period_start);
        let mut seeded = Vec::new();

        for candle in candles {
            let below_open = upper.map_or(true, |u| candle.period_start < u);
            let above_closed = lower.map_or(true, |l| candle.period_start > l);
            if below_open && above_closed {
                lower = Some(candle.period_start);
                seeded.push(candle);
            }
        }

        let count = seeded.len();
        for candle in seeded {
            self.push_closed(candle);
        }
        count
    }

    /// Closed candles plus the open one
    pub fn len(&self) -> usize {
        self.closed.len() + usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks
    }

    fn push_closed(&mut self, candle: Candle) {
        self.closed.push_back(candle);
        while self.closed.len() > self.capacity {
            self.closed.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 5).unwrap()
    }

    fn bar(period_start: DateTime<Utc>, close: f64) -> Candle {
        Candle {
            period_start,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    #[test]
    fn test_two_ticks_same_minute() {
        let mut agg = TickAggregator::new(Timeframe::M1, 500);

        assert!(agg.add_tick(2649.80, 2650.20, t0()).is_none());
        assert!(agg
            .add_tick(2651.00, 2651.40, t0() + Duration::seconds(30))
            .is_none());

        let candles = agg.get_candles(10);
        assert_eq!(candles.len(), 1);
        let c = &candles[0];
        assert!((c.open - 2650.00).abs() < 1e-9);
        assert!((c.high - 2651.20).abs() < 1e-9);
        assert!((c.low - 2650.00).abs() < 1e-9);
        assert!((c.close - 2651.20).abs() < 1e-9);
        assert_eq!(c.volume, 2.0);
    }

    #[test]
    fn test_high_low_bound_every_mid() {
        let mut agg = TickAggregator::new(Timeframe::M5, 500);
        let mids = [2650.0, 2652.5, 2648.0, 2651.0, 2649.5];

        for (i, mid) in mids.iter().enumerate() {
            agg.add_tick(mid - 0.2, mid + 0.2, t0() + Duration::seconds(i as i64 * 10));
        }

        let c = agg.current().unwrap();
        assert!(mids.iter().all(|m| c.high >= *m && c.low <= *m));
        assert_eq!(c.volume, mids.len() as f64);
    }

    #[test]
    fn test_rollover_finalizes_candle() {
        let mut agg = TickAggregator::new(Timeframe::M1, 500);

        agg.add_tick(2650.0, 2650.0, t0());
        let finished = agg.add_tick(2655.0, 2655.0, t0() + Duration::seconds(60));

        let finished = finished.expect("new minute closes the previous candle");
        assert_eq!(finished.close, 2650.0);
        assert_eq!(agg.len(), 2);
        assert_eq!(agg.get_candles(1)[0].open, 2655.0);
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut agg = TickAggregator::new(Timeframe::M1, 3);

        for i in 0..10 {
            let price = 2650.0 + i as f64;
            agg.add_tick(price, price, t0() + Duration::minutes(i));
        }

        // 3 closed + 1 open
        let candles = agg.get_candles(100);
        assert_eq!(candles.len(), 4);
        assert_eq!(candles[0].close, 2656.0);
        assert_eq!(candles[3].close, 2659.0);
    }

    #[test]
    fn test_out_of_order_ticks() {
        let mut agg = TickAggregator::new(Timeframe::M1, 500);

        agg.add_tick(2650.0, 2650.0, t0() + Duration::minutes(1));
        // Older period: dropped
        agg.add_tick(2600.0, 2600.0, t0());
        // Same period, earlier timestamp: folded in
        agg.add_tick(2660.0, 2660.0, t0() + Duration::seconds(56));

        assert_eq!(agg.dropped_ticks(), 1);
        let c = agg.current().unwrap();
        assert_eq!(c.low, 2650.0);
        assert_eq!(c.high, 2660.0);
        assert_eq!(c.volume, 2.0);
    }

    #[test]
    fn test_empty_aggregator() {
        let agg = TickAggregator::new(Timeframe::H1, 500);
        assert!(agg.is_empty());
        assert!(agg.get_candles(50).is_empty());
    }

    #[test]
    fn test_seed_keeps_only_older_bars() {
        let mut agg = TickAggregator::new(Timeframe::M1, 500);
        let open = Utc.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap();
        agg.add_tick(2650.0, 2650.0, open);

        let history = vec![
            bar(open - Duration::minutes(1), 2649.0),
            bar(open - Duration::minutes(3), 2647.0),
            bar(open - Duration::minutes(2), 2648.0),
            bar(open, 2700.0), // same period as the open candle
        ];

        assert_eq!(agg.seed(history), 3);

        let candles = agg.get_candles(10);
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![2647.0, 2648.0, 2649.0, 2650.0]);
    }
}
