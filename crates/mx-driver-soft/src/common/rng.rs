//! Seeded RNG wrapper for reproducible simulated noise.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Thread-safe random number generator with an optional fixed seed.
pub struct SoftRng {
    inner: Mutex<ChaCha8Rng>,
}

impl SoftRng {
    /// Seeded from `seed`, or from the OS when `None`.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// True with probability `rate` (clamped to 0..=1).
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().gen::<f64>() < rate
    }

    /// Uniform value in `[-amplitude, amplitude]`.
    pub fn noise(&self, amplitude: f64) -> f64 {
        if amplitude <= 0.0 {
            return 0.0;
        }
        self.inner.lock().gen_range(-amplitude..=amplitude)
    }

    /// Uniform value in `[0, 1)`.
    pub fn next_f64(&self) -> f64 {
        self.inner.lock().gen()
    }
}

impl Default for SoftRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for SoftRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftRng")
            .field("inner", &"<Mutex<ChaCha8Rng>>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_noise() {
        let a = SoftRng::new(Some(7));
        let b = SoftRng::new(Some(7));
        for _ in 0..10 {
            assert_eq!(a.noise(1.0), b.noise(1.0));
        }
    }

    #[test]
    fn noise_stays_in_bounds() {
        let rng = SoftRng::new(Some(1));
        for _ in 0..1000 {
            assert!(rng.noise(0.5).abs() <= 0.5);
        }
        assert_eq!(rng.noise(0.0), 0.0);
    }

    #[test]
    fn extreme_rates() {
        let rng = SoftRng::new(Some(3));
        assert!(!rng.should_fail(0.0));
        assert!(rng.should_fail(1.0));
    }
}
