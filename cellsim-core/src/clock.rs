//! Slot time, tick phases and random number generation for deterministic runs.

use std::fmt;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// One slot of the simulator's logical clock.
pub type Tick = u64;

/// Sub-step of a tick.
///
/// Every early activation of a tick completes before the first late
/// activation of the same tick begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    /// Service and departure effects
    Early,
    /// Arrival aggregation
    Late,
}

impl Phase {
    /// Both phases in execution order.
    pub const ALL: [Phase; 2] = [Phase::Early, Phase::Late];

    /// Dense index usable for per-phase arrays.
    pub fn index(self) -> usize {
        match self {
            Phase::Early => 0,
            Phase::Late => 1,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Early => write!(f, "early"),
            Phase::Late => write!(f, "late"),
        }
    }
}

/// Deterministic random number generator for reproducible simulations.
///
/// Uses ChaCha8 for fast, high-quality pseudorandom numbers. Two generators
/// built from the same seed produce identical sequences.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    rng: ChaCha8Rng,
    seed: u64,
}

impl DeterministicRng {
    /// Creates deterministic RNG from seed value.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    /// Returns the seed used for this RNG.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Generates a uniform number in `[0, 1)`.
    pub fn random_f64(&mut self) -> f64 {
        self.rng.random::<f64>()
    }

    /// Draws a uniform index in `[0, len)`; returns 0 when `len` is 0.
    pub fn random_index(&mut self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        self.rng.random_range(0..len)
    }

    /// Returns `true` with the given probability.
    ///
    /// Exactly one draw is consumed regardless of the probability so that
    /// changing a parameter does not shift the rest of the random stream.
    pub fn random_bool(&mut self, probability: f64) -> bool {
        self.random_f64() < probability
    }

    /// Shuffles a mutable slice in-place.
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        slice.shuffle(&mut self.rng);
    }

    /// Re-seeds the generator, restarting its sequence.
    pub fn reseed(&mut self, seed: u64) {
        *self = Self::from_seed(seed);
    }
}
