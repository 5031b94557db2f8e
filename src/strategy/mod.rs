// Signal detection and validation
pub mod signals;

pub use signals::{SignalConfig, SignalEngine, SignalRejection};
