pub mod pnl;
pub mod risk_gate;

pub use pnl::{calculate_pnl, lot_size_for_risk};
pub use risk_gate::{RiskConfig, RiskGate, RiskTrip, TradingCalendar};
