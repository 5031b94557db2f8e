/// Rolling simple moving average aligned with the input
///
/// Entries before the first full window are `None`, as are windows that
/// contain a `None`.
pub fn sma_series(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 {
        return out;
    }

    for i in (period - 1)..values.len() {
        let window = &values[i + 1 - period..=i];
        let sum: Option<f64> = window.iter().copied().sum();
        out[i] = sum.map(|s| s / period as f64);
    }

    out
}

/// Exponential moving average aligned with the input
///
/// Recursive smoothing with alpha = 2 / (period + 1), seeded with the first
/// value, so every position has a value.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());

    let mut ema = match values.first() {
        Some(first) => *first,
        None => return out,
    };

    for value in values {
        ema = alpha * value + (1.0 - alpha) * ema;
        out.push(ema);
    }

    out
}
