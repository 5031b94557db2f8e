/// Average True Range (ATR) indicator
///
/// Measures market volatility as the rolling mean of true ranges over a period.
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
use super::moving_average::sma_series;
use crate::models::Candle;

/// True range per candle; the first candle has no previous close and uses high - low
pub fn true_range_series(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .enumerate()
        .map(|(i, candle)| {
            let high_low = candle.high - candle.low;
            match i.checked_sub(1).map(|prev| candles[prev].close) {
                Some(prev_close) => high_low
                    .max((candle.high - prev_close).abs())
                    .max((candle.low - prev_close).abs()),
                None => high_low,
            }
        })
        .collect()
}

/// ATR aligned with the candles (`None` until a full window exists)
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let true_ranges: Vec<Option<f64>> = true_range_series(candles).into_iter().map(Some).collect();
    sma_series(&true_ranges, period)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            period_start: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_true_range_uses_previous_close_gap() {
        let candles = vec![candle(101.0, 99.0, 100.0), candle(106.0, 104.0, 105.0)];
        let tr = true_range_series(&candles);

        assert_eq!(tr[0], 2.0);
        // Gap up: high - prev_close = 6 beats high - low = 2
        assert_eq!(tr[1], 6.0);
    }

    #[test]
    fn test_atr_rolling_mean() {
        let candles = vec![
            candle(102.0, 100.0, 101.0),
            candle(103.0, 101.0, 102.0),
            candle(104.0, 102.0, 103.0),
            candle(105.0, 103.0, 104.0),
        ];

        let atr = atr_series(&candles, 2);
        assert!(atr[0].is_none());
        assert_eq!(atr[3], Some(2.0));
    }

    #[test]
    fn test_atr_insufficient_data() {
        let candles = vec![candle(101.0, 99.0, 100.0)];
        let atr = atr_series(&candles, 14);
        assert_eq!(atr, vec![None]);
    }
}
