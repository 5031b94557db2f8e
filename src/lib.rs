// Core modules
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod notify;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::Settings;
pub use error::{BotError, Result};
pub use models::*;
