//! Worker-to-service placement, applied once at pool start.

use rand::Rng;

/// How `start` maps each worker thread onto one of the pool's services.
///
/// The policy only decides which service a worker's *run loop* serves; it is
/// independent of how `post`/`dispatch` pick a target queue for a given unit
/// of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPolicy {
    /// Each worker picks a service uniformly at random, independently of the
    /// others. No balancing guarantee.
    #[default]
    Random,

    /// Workers are laid out round-robin over services: thread `i` serves
    /// service `i % service_count`, so each service gets an approximately
    /// equal share of dedicated threads.
    PerCore,

    /// Every worker runs the first service's loop, draining one queue
    /// cooperatively. With more than one configured service the remaining
    /// queues are left unserved.
    AllCores,
}

/// Resolve which service index worker `thread_index` will serve.
pub(crate) fn service_for_thread<R: Rng>(
    thread_index: usize,
    service_count: usize,
    policy: DispatchPolicy,
    rng: &mut R,
) -> usize {
    match policy {
        DispatchPolicy::Random => rng.random_range(0..service_count),
        DispatchPolicy::PerCore => thread_index % service_count,
        DispatchPolicy::AllCores => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn per_core_wraps_over_services() {
        let mut rng = StdRng::seed_from_u64(0);
        let placement: Vec<usize> = (0..6)
            .map(|i| service_for_thread(i, 3, DispatchPolicy::PerCore, &mut rng))
            .collect();
        assert_eq!(placement, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn per_core_is_one_to_one_when_counts_match() {
        let mut rng = StdRng::seed_from_u64(0);
        for i in 0..4 {
            assert_eq!(
                service_for_thread(i, 4, DispatchPolicy::PerCore, &mut rng),
                i
            );
        }
    }

    #[test]
    fn all_cores_targets_the_first_service() {
        let mut rng = StdRng::seed_from_u64(0);
        for i in 0..8 {
            assert_eq!(
                service_for_thread(i, 3, DispatchPolicy::AllCores, &mut rng),
                0
            );
        }
    }

    #[test]
    fn random_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(42);
        for i in 0..100 {
            let idx = service_for_thread(i, 5, DispatchPolicy::Random, &mut rng);
            assert!(idx < 5);
        }
    }
}
