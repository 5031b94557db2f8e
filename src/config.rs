//! Layered settings: defaults, optional TOML file, then `GOLDBOT_*` environment.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BotError, Result};
use crate::execution::{
    AggregatorConfig, BroadcasterConfig, FeedConfig, MonitorConfig, PositionConfig,
};
use crate::indicators::IndicatorConfig;
use crate::models::{Instrument, UserId};
use crate::notify::NotifyConfig;
use crate::risk::RiskConfig;
use crate::strategy::SignalConfig;

const ENV_PREFIX: &str = "GOLDBOT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub users: Vec<UserId>, // Authorized users; each gets a monitoring session
    pub dry_run: bool,      // In-memory store and log-only notifications
    pub shutdown_timeout_secs: u64,
    pub status_interval_secs: u64,
    pub instrument: Instrument,
    pub feed: FeedConfig,
    pub broadcaster: BroadcasterConfig,
    pub aggregator: AggregatorConfig,
    pub indicators: IndicatorConfig,
    pub signals: SignalConfig,
    pub risk: RiskConfig,
    pub positions: PositionConfig,
    pub monitor: MonitorConfig,
    pub notify: NotifyConfig,
    pub database: DatabaseConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            dry_run: false,
            shutdown_timeout_secs: 10,
            status_interval_secs: 60,
            instrument: Instrument::default(),
            feed: FeedConfig::default(),
            broadcaster: BroadcasterConfig::default(),
            aggregator: AggregatorConfig::default(),
            indicators: IndicatorConfig::default(),
            signals: SignalConfig::default(),
            risk: RiskConfig::default(),
            positions: PositionConfig::default(),
            monitor: MonitorConfig::default(),
            notify: NotifyConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Settings {
    /// Load from an optional TOML file overlaid with the environment
    ///
    /// e.g. `GOLDBOT_RISK__COOLDOWN_SECS=45`, `GOLDBOT_USERS=1,2`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let mut settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("users"),
            )
            .build()?
            .try_deserialize()?;

        if settings.notify.telegram_token.is_none() {
            settings.notify.telegram_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
        }
        if settings.database.url.is_none() {
            settings.database.url = std::env::var("DATABASE_URL").ok();
        }

        Ok(settings)
    }

    pub fn from_toml(toml: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Reject settings the bot cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.users.is_empty() {
            return Err(BotError::Config("no users configured".to_string()));
        }

        if !self.dry_run {
            if self.notify.telegram_token.as_deref().map_or(true, str::is_empty) {
                return Err(BotError::Config(
                    "TELEGRAM_BOT_TOKEN is required unless dry_run is set".to_string(),
                ));
            }
            if self.database.url.is_none() {
                return Err(BotError::Config(
                    "DATABASE_URL is required unless dry_run is set".to_string(),
                ));
            }
        }

        let periods = &self.indicators.ema_periods;
        if periods.is_empty() || periods.windows(2).any(|w| w[0] >= w[1]) {
            return Err(BotError::Config(format!(
                "ema_periods must be strictly ascending, got {:?}",
                periods
            )));
        }

        let multiplier = self.positions.tightening_multiplier;
        if !(multiplier > 0.0 && multiplier < 1.0) {
            return Err(BotError::Config(format!(
                "tightening_multiplier must be in (0, 1), got {}",
                multiplier
            )));
        }

        let signals = &self.signals;
        if !(signals.min_lot > 0.0 && signals.min_lot <= signals.max_lot) {
            return Err(BotError::Config(format!(
                "lot range must satisfy 0 < min_lot <= max_lot, got {}..{}",
                signals.min_lot, signals.max_lot
            )));
        }
        if !(signals.tp_ratio_min > 0.0 && signals.tp_ratio_min <= signals.tp_ratio_max) {
            return Err(BotError::Config(format!(
                "tp ratio range must satisfy 0 < tp_ratio_min <= tp_ratio_max, got {}..{}",
                signals.tp_ratio_min, signals.tp_ratio_max
            )));
        }

        let pip_value = self.instrument.pip_value;
        if !(pip_value.is_finite() && pip_value > 0.0) {
            return Err(BotError::Config(format!(
                "instrument pip_value must be positive, got {}",
                pip_value
            )));
        }

        if !(-12..=14).contains(&self.risk.day_utc_offset_hours) {
            return Err(BotError::Config(format!(
                "day_utc_offset_hours must be within -12..=14, got {}",
                self.risk.day_utc_offset_hours
            )));
        }

        if self.aggregator.timeframes.is_empty()
            || !self.aggregator.timeframes.contains(&self.monitor.timeframe)
        {
            return Err(BotError::Config(format!(
                "monitor timeframe {} is not aggregated",
                self.monitor.timeframe
            )));
        }

        Ok(())
    }
}
