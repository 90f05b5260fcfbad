//! Seeded noise keys for DP training.
//!
//! A [`NoiseKey`] is a 256-bit ChaCha20 seed. Each optimizer step draws its
//! noise from an independent stream of that key, selected by the step index,
//! so noise is reproducible for a fixed seed and never reused across steps.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Root key for a training session's noise.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoiseKey {
    seed: [u8; 32],
}

impl NoiseKey {
    /// Derive a key deterministically from a 64-bit seed.
    pub fn new(seed: u64) -> Self {
        let mut expander = ChaCha20Rng::seed_from_u64(seed);
        let mut bytes = [0u8; 32];
        expander.fill_bytes(&mut bytes);
        Self { seed: bytes }
    }

    /// Draw a fresh key from operating-system entropy.
    pub fn from_entropy() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { seed: bytes }
    }

    /// The RNG stream for optimizer step `step`.
    pub fn stream(self, step: u64) -> NoiseRng {
        let mut rng = ChaCha20Rng::from_seed(self.seed);
        rng.set_stream(step);
        rng
    }
}

impl std::fmt::Debug for NoiseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseKey").finish_non_exhaustive()
    }
}

/// Cryptographically secure RNG used for one step's noise draw.
pub type NoiseRng = ChaCha20Rng;

/// Common imports for PRNG utilities.
pub mod prelude {
    pub use crate::{NoiseKey, NoiseRng};
}
