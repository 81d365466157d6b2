use std::io;
use thiserror::Error;

/// Errors surfaced by pool lifecycle and dispatch operations.
///
/// Every variant is a configuration or lifecycle error reported at the call
/// site; none of them corrupts pool state.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("thread pool `{name}` is already running")]
    AlreadyRunning { name: String },

    #[error("thread pool `{name}` has been stopped and cannot be restarted")]
    AlreadyStopped { name: String },

    #[error("service index {index} is out of range ({count} services)")]
    ServiceOutOfRange { index: usize, count: usize },

    #[error("current-service selection is only valid from a pool worker thread")]
    NotAWorkerThread,

    #[error("failed to spawn pool thread: {0}")]
    Spawn(#[from] io::Error),
}
