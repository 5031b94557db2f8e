use super::moving_average::sma_series;

/// RSI value reported when a window has neither gains nor losses
pub const FLAT_RSI: f64 = 50.0;

/// Calculate Relative Strength Index (RSI) for every close
///
/// Uses a rolling mean of gains and losses over `period` price changes.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
/// A window with no losses reports 100; a completely flat window reports
/// [`FLAT_RSI`] instead of dividing zero by zero.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut gains = vec![None; closes.len()];
    let mut losses = vec![None; closes.len()];

    for i in 1..closes.len() {
        let change = closes[i] - closes[i - 1];
        gains[i] = Some(change.max(0.0));
        losses[i] = Some((-change).max(0.0));
    }

    let avg_gain = sma_series(&gains, period);
    let avg_loss = sma_series(&losses, period);

    avg_gain
        .iter()
        .zip(avg_loss.iter())
        .map(|(gain, loss)| match (gain, loss) {
            (Some(gain), Some(loss)) => Some(rsi_from_averages(*gain, *loss)),
            _ => None,
        })
        .collect()
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            return FLAT_RSI;
        }
        return 100.0;
    }

    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_calculation() {
        let prices = vec![
            44.0, 44.25, 44.5, 43.75, 44.0, 44.5, 45.0, 45.5, 45.25, 45.5, 46.0, 46.5, 46.25,
            46.0, 46.5,
        ];

        let rsi = rsi_series(&prices, 14);
        let last = rsi.last().copied().flatten().unwrap();
        assert!(last > 0.0 && last < 100.0);
        // First full window ends at index 14
        assert!(rsi[13].is_none());
    }

    #[test]
    fn test_rsi_all_gains() {
        let prices = vec![100.0, 101.0, 102.0, 103.0, 104.0, 105.0];
        let rsi = rsi_series(&prices, 5);
        assert_eq!(rsi[5], Some(100.0));
    }

    #[test]
    fn test_rsi_flat_prices() {
        let prices = vec![100.0; 6];
        let rsi = rsi_series(&prices, 3);
        assert_eq!(rsi[5], Some(FLAT_RSI));
    }

    #[test]
    fn test_rsi_balanced_moves() {
        let prices = vec![100.0, 101.0, 100.0, 101.0, 100.0];
        let rsi = rsi_series(&prices, 4);
        assert!((rsi[4].unwrap() - 50.0).abs() < 1e-9);
    }
}
