use crate::models::Direction;

/// Profit/loss in account currency
///
/// `pip_value` converts a price delta into pips, and one pip is worth one
/// currency unit per lot at the instrument's contract size.
pub fn calculate_pnl(direction: Direction, entry: f64, exit: f64, lot_size: f64, pip_value: f64) -> f64 {
    direction.sign() * (exit - entry) * pip_value * lot_size
}

/// Lot size that risks `risk_amount` over a stop of `sl_pips`
///
/// Falls back to `default_lot` for a zero-width stop and clamps to
/// `[min_lot, max_lot]`, with `max_lot` winning if the bounds cross.
pub fn lot_size_for_risk(
    risk_amount: f64,
    sl_pips: f64,
    default_lot: f64,
    min_lot: f64,
    max_lot: f64,
) -> f64 {
    let lot = if sl_pips > 0.0 {
        risk_amount / sl_pips
    } else {
        default_lot
    };
    lot.max(min_lot).min(max_lot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buy_pnl() {
        let pnl = calculate_pnl(Direction::Buy, 2650.0, 2652.0, 0.5, 10.0);
        assert!((pnl - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_sell_pnl_is_mirrored() {
        let pnl = calculate_pnl(Direction::Sell, 2650.0, 2652.0, 0.5, 10.0);
        assert!((pnl + 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_lot_size_clamped() {
        // $10 over 20 pips
        assert!((lot_size_for_risk(10.0, 20.0, 0.01, 0.01, 1.0) - 0.5).abs() < 1e-9);
        // Very wide stop floors at the minimum lot
        assert_eq!(lot_size_for_risk(10.0, 5000.0, 0.01, 0.01, 1.0), 0.01);
        // Very tight stop caps at the maximum lot
        assert_eq!(lot_size_for_risk(10.0, 1.0, 0.01, 0.01, 1.0), 1.0);
        assert_eq!(lot_size_for_risk(10.0, 0.0, 0.01, 0.01, 1.0), 0.01);
    }

    #[test]
    fn test_lot_size_with_crossed_bounds_does_not_panic() {
        assert_eq!(lot_size_for_risk(10.0, 20.0, 0.01, 2.0, 1.0), 1.0);
    }
}
