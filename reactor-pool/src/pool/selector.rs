//! Service selection for queued work.

/// Selects which service a unit of work lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceSelector {
    /// The service at this index. Out-of-range indices are rejected.
    Index(usize),

    /// Rotate through all services via a shared atomic cursor. Long-run
    /// submissions spread evenly across services regardless of which thread
    /// submits them.
    #[default]
    RoundRobin,

    /// A uniformly random service, chosen by the calling thread's picker.
    /// Each call is independent; no global balance is guaranteed.
    Random,

    /// The service whose loop the calling thread is executing. Only valid
    /// from inside one of the pool's worker threads.
    Current,
}
