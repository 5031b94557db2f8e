use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::models::Tick;

/// Synthetic tick generator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulatorConfig {
    pub base_price: f64,
    pub tick_interval_ms: u64,
    pub max_delta: f64,      // Largest mid move per tick
    pub min_spread: f64,
    pub max_spread: f64,
    pub max_deviation_pct: f64, // Walk stays within base +/- this
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            base_price: 2650.0,
            tick_interval_ms: 1000,
            max_delta: 0.50,
            min_spread: 0.20,
            max_spread: 0.50,
            max_deviation_pct: 0.05,
            seed: None,
        }
    }
}

/// Bounded random walk around a base price
pub struct TickSimulator {
    config: SimulatorConfig,
    rng: StdRng,
    mid: f64,
}

impl TickSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            mid: config.base_price,
            config,
            rng,
        }
    }

    /// First synthetic tick, at the base price
    pub fn seed_tick(&mut self, at: DateTime<Utc>) -> Tick {
        self.mid = self.config.base_price;
        self.quote(at)
    }

    pub fn next_tick(&mut self, at: DateTime<Utc>) -> Tick {
        let delta = if self.config.max_delta > 0.0 {
            self.rng.gen_range(-self.config.max_delta..=self.config.max_delta)
        } else {
            0.0
        };

        let band = self.config.base_price * self.config.max_deviation_pct;
        self.mid = (self.mid + delta).clamp(
            self.config.base_price - band,
            self.config.base_price + band,
        );

        self.quote(at)
    }

    fn quote(&mut self, at: DateTime<Utc>) -> Tick {
        let spread = if self.config.max_spread > self.config.min_spread {
            self.rng
                .gen_range(self.config.min_spread..=self.config.max_spread)
        } else {
            self.config.min_spread
        };
        Tick::new(self.mid - spread / 2.0, self.mid + spread / 2.0, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> TickSimulator {
        TickSimulator::new(SimulatorConfig {
            seed: Some(42),
            ..Default::default()
        })
    }

    #[test]
    fn test_seed_tick_at_base_price() {
        let mut sim = seeded();
        let tick = sim.seed_tick(Utc::now());
        assert!((tick.mid - 2650.0).abs() < 1e-9);
        assert!(tick.spread() >= 0.20 - 1e-9 && tick.spread() <= 0.50 + 1e-9);
    }

    #[test]
    fn test_walk_stays_in_band() {
        let mut sim = seeded();
        let mut prev = sim.seed_tick(Utc::now()).mid;

        for _ in 0..10_000 {
            let tick = sim.next_tick(Utc::now());
            assert!(tick.mid >= 2650.0 * 0.95 - 1e-9 && tick.mid <= 2650.0 * 1.05 + 1e-9);
            assert!((tick.mid - prev).abs() <= 0.50 + 1e-9);
            assert!(tick.ask > tick.bid);
            prev = tick.mid;
        }
    }

    #[test]
    fn test_same_seed_same_walk() {
        let mut a = seeded();
        let mut b = seeded();
        let now = Utc::now();
        for _ in 0..100 {
            assert_eq!(a.next_tick(now), b.next_tick(now));
        }
    }
}
