//! Error types for the signal engine.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Feed error: {0}")]
    Feed(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Insufficient data: {have} candles, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("Position not found: {0}")]
    PositionNotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, BotError>;
