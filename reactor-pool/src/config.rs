use std::fmt;

/// Configuration for a [`ThreadPool`](crate::ThreadPool) that owns its
/// services.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of worker threads spawned by `start`.
    pub thread_count: usize,

    /// Number of independent service queues. Always at least one.
    pub service_count: usize,

    /// Pool label, used for worker/timer thread names and log events.
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_count: num_cpus::get(),
            service_count: 1,
            name: "reactor-pool".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn new(thread_count: usize) -> Self {
        Self {
            thread_count,
            ..Default::default()
        }
    }

    /// Number of service queues; values below one are clamped to one.
    pub fn with_services(mut self, service_count: usize) -> Self {
        self.service_count = service_count.max(1);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl fmt::Display for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} threads, {} services)",
            self.name, self.thread_count, self.service_count
        )
    }
}
