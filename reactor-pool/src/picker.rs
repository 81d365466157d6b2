//! Uniform-random service selection.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Picks a uniformly random service index in `[0, service_count)`.
///
/// The pool keeps one picker per calling thread (keyed by `ThreadId`) so the
/// random-selection path never shares an RNG across threads.
pub struct ServicePicker {
    service_count: usize,
    rng: StdRng,
}

impl ServicePicker {
    /// Picker over `service_count` services, seeded from the OS.
    pub fn new(service_count: usize) -> Self {
        debug_assert!(service_count >= 1);
        Self {
            service_count,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic picker for reproducible selection sequences.
    pub fn with_seed(service_count: usize, seed: u64) -> Self {
        debug_assert!(service_count >= 1);
        Self {
            service_count,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform selection; every call is independent of the previous ones.
    pub fn pick(&mut self) -> usize {
        self.rng.random_range(0..self.service_count)
    }
}

impl std::fmt::Debug for ServicePicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePicker")
            .field("service_count", &self.service_count)
            .finish()
    }
}
