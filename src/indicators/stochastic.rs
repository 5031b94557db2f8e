use super::moving_average::sma_series;
use crate::models::Candle;

/// Smoothed stochastic oscillator
///
/// Raw %K = 100 * (close - lowest low) / (highest high - lowest low) over
/// `k_period` candles, smoothed by an SMA of `smooth_k`. %D is the SMA of the
/// smoothed %K over `d_period`. A window with no range reports 50.
pub fn stochastic_series(
    candles: &[Candle],
    k_period: usize,
    d_period: usize,
    smooth_k: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let mut raw_k = vec![None; candles.len()];

    if k_period > 0 {
        for i in (k_period - 1)..candles.len() {
            let window = &candles[i + 1 - k_period..=i];
            let lowest = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
            let highest = window
                .iter()
                .map(|c| c.high)
                .fold(f64::NEG_INFINITY, f64::max);

            let range = highest - lowest;
            raw_k[i] = if range > 0.0 {
                Some(100.0 * (candles[i].close - lowest) / range)
            } else {
                Some(50.0)
            };
        }
    }

    let k = sma_series(&raw_k, smooth_k);
    let d = sma_series(&k, d_period);
    (k, d)
}
