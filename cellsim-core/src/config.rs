//! Kernel configuration.
//!
//! All tunable kernel parameters live here; discipline and endpoint
//! parameters are plain structs next to the objects they configure.

use serde::{Deserialize, Serialize};

use crate::clock::Tick;
use crate::error::ConfigError;

/// Default number of calendar buckets per phase.
pub const DEFAULT_HORIZON: usize = 4096;

/// Default tick at which the clock is rebased to zero.
pub const DEFAULT_RENORMALIZE_AT: Tick = 1 << 48;

/// Parameters of one simulation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Seed of the shared random stream
    pub seed: u64,
    /// Calendar buckets per phase; delays beyond it still work, just slower
    pub horizon: usize,
    /// Clock value that triggers automatic renormalization after a tick
    pub renormalize_threshold: Tick,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            horizon: DEFAULT_HORIZON,
            renormalize_threshold: DEFAULT_RENORMALIZE_AT,
        }
    }
}

impl SimulationConfig {
    /// Small horizon and early renormalization, so tests exercise both paths.
    pub fn deterministic_testing() -> Self {
        Self {
            seed: 42,
            horizon: 64,
            renormalize_threshold: 1 << 20,
        }
    }

    /// Wide horizon for long runs with large service times.
    pub fn long_run() -> Self {
        Self {
            horizon: 1 << 16,
            ..Self::default()
        }
    }

    /// Replaces the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Replaces the horizon.
    pub fn with_horizon(mut self, horizon: usize) -> Self {
        self.horizon = horizon;
        self
    }

    /// Replaces the renormalization threshold.
    pub fn with_renormalize_threshold(mut self, threshold: Tick) -> Self {
        self.renormalize_threshold = threshold;
        self
    }

    /// Creates configuration with environment variable overrides.
    ///
    /// Recognises `CELLSIM_SEED`, `CELLSIM_HORIZON` and
    /// `CELLSIM_RENORMALIZE_AT`; unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(seed) = env_value::<u64>("CELLSIM_SEED") {
            config.seed = seed;
        }
        if let Some(horizon) = env_value::<usize>("CELLSIM_HORIZON") {
            config.horizon = horizon;
        }
        if let Some(threshold) = env_value::<Tick>("CELLSIM_RENORMALIZE_AT") {
            config.renormalize_threshold = threshold;
        }

        config
    }

    /// Checks parameter ranges.
    ///
    /// # Errors
    ///
    /// - `ConfigError::BelowMinimum` - If the horizon or renormalization threshold is zero
    /// - `ConfigError::Invalid` - If the horizon does not fit a 32-bit slot index
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.horizon == 0 {
            return Err(ConfigError::BelowMinimum {
                object: "simulation".to_string(),
                parameter: "horizon",
                minimum: 1,
                value: 0,
            });
        }
        if u32::try_from(self.horizon).is_err() {
            return Err(ConfigError::Invalid {
                object: "simulation".to_string(),
                reason: format!("horizon {} exceeds the 32-bit slot range", self.horizon),
            });
        }
        if self.renormalize_threshold == 0 {
            return Err(ConfigError::BelowMinimum {
                object: "simulation".to_string(),
                parameter: "renormalize_threshold",
                minimum: 1,
                value: 0,
            });
        }
        Ok(())
    }
}

fn env_value<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}
