//! Monotonic statistics counters.

use serde::Serialize;

use crate::error::{SimError, SimResult};

/// Counter that only grows, except on an explicit reset.
///
/// Wrapping around is a fatal error, never a silent restart from zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Counter(u64);

impl Counter {
    /// Counter starting at zero.
    pub const ZERO: Counter = Counter(0);

    /// Current value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Adds one.
    ///
    /// # Errors
    ///
    /// - `SimError::CounterOverflow` - If the counter is already at `u64::MAX`
    pub fn increment(&mut self, object: &str, counter: &str) -> SimResult<()> {
        self.add(1, object, counter)
    }

    /// Adds `amount`.
    ///
    /// # Errors
    ///
    /// - `SimError::CounterOverflow` - If the sum does not fit in a `u64`
    pub fn add(&mut self, amount: u64, object: &str, counter: &str) -> SimResult<()> {
        self.0 = self
            .0
            .checked_add(amount)
            .ok_or_else(|| SimError::CounterOverflow {
                object: object.to_string(),
                counter: counter.to_string(),
            })?;
        Ok(())
    }

    /// Sets the counter back to zero.
    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

impl From<Counter> for f64 {
    fn from(counter: Counter) -> f64 {
        counter.0 as f64
    }
}
