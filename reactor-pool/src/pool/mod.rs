//! # Managed Thread Pool
//!
//! [`ThreadPool`] fronts one or more event-loop [`Service`]s with a fixed
//! set of worker threads. Callers queue work now (`post`/`dispatch`) or
//! later and repeatedly (`schedule`); the pool resolves which service the
//! work lands on and keeps the thread lifecycle honest: start exactly once,
//! stop exactly once, join on destruction.
//!
//! ## Key Concepts
//! - Placement: a [`DispatchPolicy`] fixes each worker's service at `start`
//! - Selection: a [`ServiceSelector`] picks the target queue per submission
//! - Lifecycle: `Created → Running → Stopped`, never re-entered
//!
//! ## Design Principles
//! - No locks on the hot path: the round-robin cursor and live-worker count
//!   are plain atomics; the services vector is read-only after construction
//! - Destruction always implies full, joined shutdown

pub mod policy;
pub mod selector;
pub mod timer;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::picker::ServicePicker;
use crate::service::{Service, WorkGuard};
use self::policy::{service_for_thread, DispatchPolicy};
use self::selector::ServiceSelector;
use self::timer::{run_timer, timer_pair, Timer, TimerStatus};

/// Per-thread init callback, run once on each worker before it enters its
/// service loop.
type ThreadInit = Arc<dyn Fn() + Send + Sync + 'static>;

struct TimerEntry {
    handle: Timer,
    thread: JoinHandle<()>,
}

/// Lifecycle states of a pool. The progression is one-way: a stopped pool
/// cannot be restarted, which keeps thread and queue identity simple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Created,
    Running,
    Stopped,
}

/// A fixed-size pool of worker threads draining one or more service queues.
///
/// The pool is move-only: worker threads and queue identities must not be
/// duplicated, so there is no `Clone`. Lifecycle methods take `&mut self`;
/// submission methods take `&self` and are safe to call from any thread.
pub struct ThreadPool {
    name: String,
    thread_count: usize,
    services: Vec<Service>,
    owns_services: bool,
    state: PoolState,

    /// Keep-alive guards for owned services, held from `start` to `stop`.
    guards: Vec<WorkGuard>,
    workers: Vec<JoinHandle<()>>,

    round_robin: AtomicUsize,
    live_workers: Arc<AtomicUsize>,

    /// Which service each live worker thread is draining. Answers
    /// `running_in_pool` and the `Current` selector.
    worker_services: Arc<RwLock<HashMap<ThreadId, usize>>>,

    /// Lazily-built per-thread random pickers.
    pickers: Mutex<HashMap<ThreadId, ServicePicker>>,

    /// Outstanding timer threads; drained on `stop`.
    timers: Mutex<Vec<TimerEntry>>,
}

impl ThreadPool {
    /// Pool with `thread_count` workers over a single owned service.
    pub fn new(thread_count: usize) -> Self {
        Self::with_config(PoolConfig::new(thread_count))
    }

    /// Pool that owns `config.service_count` services.
    pub fn with_config(config: PoolConfig) -> Self {
        let service_count = config.service_count.max(1);
        let services = (0..service_count).map(|_| Service::new()).collect();
        Self::assemble(config.name, config.thread_count, services, true)
    }

    /// Pool over a single externally-owned service.
    ///
    /// The caller keeps control of the service's lifetime: no keep-alive
    /// guard is managed here, so the worker loops return as soon as the
    /// queue is drained unless the caller holds its own
    /// [`WorkGuard`](crate::WorkGuard).
    pub fn with_external_service(
        thread_count: usize,
        service: Service,
        name: impl Into<String>,
    ) -> Self {
        Self::assemble(name.into(), thread_count, vec![service], false)
    }

    fn assemble(
        name: String,
        thread_count: usize,
        services: Vec<Service>,
        owns_services: bool,
    ) -> Self {
        Self {
            name,
            thread_count,
            services,
            owns_services,
            state: PoolState::Created,
            guards: Vec::new(),
            workers: Vec::new(),
            round_robin: AtomicUsize::new(0),
            live_workers: Arc::new(AtomicUsize::new(0)),
            worker_services: Arc::new(RwLock::new(HashMap::new())),
            pickers: Mutex::new(HashMap::new()),
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker threads, assigning each a service per `policy`.
    ///
    /// Errors if the pool is already running. A stopped pool cannot be
    /// restarted.
    pub fn start(&mut self, policy: DispatchPolicy) -> Result<(), PoolError> {
        self.spawn_workers(policy, None)
    }

    /// Like [`start`](Self::start), with a callback run once on each worker
    /// thread before it enters its service loop. `running_in_pool` is
    /// already true inside the callback.
    pub fn start_with_init<F>(&mut self, policy: DispatchPolicy, init: F) -> Result<(), PoolError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.spawn_workers(policy, Some(Arc::new(init)))
    }

    fn spawn_workers(
        &mut self,
        policy: DispatchPolicy,
        init: Option<ThreadInit>,
    ) -> Result<(), PoolError> {
        match self.state {
            PoolState::Running => {
                return Err(PoolError::AlreadyRunning {
                    name: self.name.clone(),
                })
            }
            PoolState::Stopped => {
                return Err(PoolError::AlreadyStopped {
                    name: self.name.clone(),
                })
            }
            PoolState::Created => {}
        }
        self.state = PoolState::Running;

        if self.owns_services {
            self.guards = self.services.iter().map(|s| s.work_guard()).collect();
        }

        let mut rng = StdRng::from_os_rng();
        for i in 0..self.thread_count {
            let service_index = service_for_thread(i, self.services.len(), policy, &mut rng);
            let service = self.services[service_index].clone();
            let init = init.clone();
            let live = Arc::clone(&self.live_workers);
            let registry = Arc::clone(&self.worker_services);
            let label = format!("{}-worker-{}", self.name, i);

            let spawned = thread::Builder::new().name(label.clone()).spawn(move || {
                let id = thread::current().id();
                registry.write().unwrap().insert(id, service_index);
                live.fetch_add(1, Ordering::SeqCst);
                debug!(worker = %label, service = service_index, "worker entering service loop");

                let result = catch_unwind(AssertUnwindSafe(|| {
                    if let Some(init) = init.as_deref() {
                        init();
                    }
                    service.run();
                }));
                if let Err(payload) = result {
                    error!(
                        worker = %label,
                        panic = %panic_message(payload.as_ref()),
                        "worker thread panicked; it will not be restarted"
                    );
                }

                live.fetch_sub(1, Ordering::SeqCst);
                registry.write().unwrap().remove(&id);
            });

            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    // Roll back whatever already started before reporting.
                    self.stop();
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        info!(
            pool = %self.name,
            threads = self.thread_count,
            services = self.services.len(),
            ?policy,
            "thread pool started"
        );
        Ok(())
    }

    /// Stop the pool and join every thread it spawned. Idempotent: calling
    /// it on a pool that is not running is a no-op.
    ///
    /// Outstanding timers are cancelled first, then the keep-alive guards
    /// are released so each service loop exits once its queue drains.
    /// Pending work runs to completion before the workers are joined.
    pub fn stop(&mut self) {
        if self.state != PoolState::Running {
            return;
        }
        self.state = PoolState::Stopped;
        info!(pool = %self.name, "stopping thread pool");

        // Cancel timers while the workers are still alive, so a callback a
        // timer already queued drains normally before its thread is joined.
        let timers: Vec<TimerEntry> = self.timers.lock().unwrap().drain(..).collect();
        for entry in &timers {
            entry.handle.cancel();
        }
        for entry in timers {
            if entry.thread.join().is_err() {
                error!(pool = %self.name, "timer thread panicked");
            }
        }

        self.guards.clear();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!(pool = %self.name, "worker thread panicked");
            }
        }
        self.pickers.lock().unwrap().clear();
        info!(pool = %self.name, "thread pool stopped");
    }

    /// Resolve `selector` to a concrete service.
    pub fn get_service(&self, selector: ServiceSelector) -> Result<&Service, PoolError> {
        match selector {
            ServiceSelector::Index(index) => {
                self.services
                    .get(index)
                    .ok_or(PoolError::ServiceOutOfRange {
                        index,
                        count: self.services.len(),
                    })
            }
            ServiceSelector::RoundRobin => Ok(self.round_robin_service()),
            ServiceSelector::Random => {
                let mut pickers = self.pickers.lock().unwrap();
                let picker = pickers
                    .entry(thread::current().id())
                    .or_insert_with(|| ServicePicker::new(self.services.len()));
                Ok(&self.services[picker.pick()])
            }
            ServiceSelector::Current => self.current_service(),
        }
    }

    /// The service whose loop the calling thread is executing. Errors unless
    /// called from one of this pool's worker threads.
    pub fn current_service(&self) -> Result<&Service, PoolError> {
        let registry = self.worker_services.read().unwrap();
        let index = registry
            .get(&thread::current().id())
            .copied()
            .ok_or(PoolError::NotAWorkerThread)?;
        Ok(&self.services[index])
    }

    fn round_robin_service(&self) -> &Service {
        let cursor = self.round_robin.fetch_add(1, Ordering::Relaxed);
        &self.services[cursor % self.services.len()]
    }

    /// Queue `job` on the next round-robin service. Never blocks.
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.round_robin_service().post(job);
    }

    /// Queue `job` on the service resolved by `selector`.
    pub fn post_to<F>(&self, selector: ServiceSelector, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.get_service(selector)?.post(job);
        Ok(())
    }

    /// Run `job` inline when the calling thread already serves the next
    /// round-robin service, queue it otherwise.
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.round_robin_service().dispatch(job);
    }

    /// Run `job` inline when the calling thread already serves the resolved
    /// service, queue it otherwise.
    pub fn dispatch_to<F>(&self, selector: ServiceSelector, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.get_service(selector)?.dispatch(job);
        Ok(())
    }

    /// Queue `job` once per worker thread, through the round-robin selector.
    /// Broadcast-to-threads semantics: with every worker sharing one service
    /// this runs the job `threads()` times on that one queue.
    pub fn post_all<F>(&self, job: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let job = Arc::new(job);
        for _ in 0..self.thread_count {
            let job = Arc::clone(&job);
            self.post(move || (*job)());
        }
    }

    /// Like [`post_all`](Self::post_all), but each submission dispatches:
    /// the ones resolving to the caller's own service run inline.
    pub fn dispatch_all<F>(&self, job: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let job = Arc::new(job);
        for _ in 0..self.thread_count {
            let job = Arc::clone(&job);
            self.dispatch(move || (*job)());
        }
    }

    /// Arm a timer on the next round-robin service. The callback runs on
    /// that service after each `delay` interval and re-arms for another one
    /// until it returns `false` ([`TimerStatus`] lets `()` mean "continue").
    pub fn schedule<F, R>(&self, delay: Duration, callback: F) -> Result<Timer, PoolError>
    where
        F: FnMut() -> R + Send + 'static,
        R: TimerStatus + 'static,
    {
        self.schedule_on(ServiceSelector::RoundRobin, delay, callback)
    }

    /// Arm a timer on the service resolved by `selector`.
    pub fn schedule_on<F, R>(
        &self,
        selector: ServiceSelector,
        delay: Duration,
        callback: F,
    ) -> Result<Timer, PoolError>
    where
        F: FnMut() -> R + Send + 'static,
        R: TimerStatus + 'static,
    {
        let service = self.get_service(selector)?.clone();
        let (handle, gate) = timer_pair();
        let thread = thread::Builder::new()
            .name(format!("{}-timer", self.name))
            .spawn(move || run_timer(service, delay, callback, gate))?;

        let mut timers = self.timers.lock().unwrap();
        timers.retain(|entry| !entry.thread.is_finished());
        timers.push(TimerEntry {
            handle: handle.clone(),
            thread,
        });
        Ok(handle)
    }

    /// True iff the calling thread is one of this pool's worker threads.
    pub fn running_in_pool(&self) -> bool {
        self.worker_services
            .read()
            .unwrap()
            .contains_key(&thread::current().id())
    }

    /// Configured worker thread count.
    pub fn threads(&self) -> usize {
        self.thread_count
    }

    /// Number of service queues fronted by this pool.
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Number of worker threads currently inside their service loop.
    pub fn running_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state == PoolState::Running
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    fn picker_count(&self) -> usize {
        self.pickers.lock().unwrap().len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("services", &self.services.len())
            .field("state", &self.state)
            .field("live_workers", &self.running_workers())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_services() {
        let pool = ThreadPool::with_config(PoolConfig::new(1).with_services(3));
        let expected: Vec<Service> = (0..3)
            .map(|i| pool.get_service(ServiceSelector::Index(i)).unwrap().clone())
            .collect();

        for round in 0..2 {
            for service in &expected {
                let picked = pool.get_service(ServiceSelector::RoundRobin).unwrap();
                assert_eq!(picked, service, "round {round}");
            }
        }
    }

    #[test]
    fn explicit_index_out_of_range_is_rejected() {
        let pool = ThreadPool::with_config(PoolConfig::new(1).with_services(2));
        let err = pool.get_service(ServiceSelector::Index(2)).unwrap_err();
        assert!(matches!(
            err,
            PoolError::ServiceOutOfRange { index: 2, count: 2 }
        ));
    }

    #[test]
    fn current_selector_outside_pool_is_rejected() {
        let pool = ThreadPool::new(1);
        let err = pool.get_service(ServiceSelector::Current).unwrap_err();
        assert!(matches!(err, PoolError::NotAWorkerThread));
    }

    #[test]
    fn random_selector_builds_one_picker_per_thread() {
        let pool = ThreadPool::with_config(PoolConfig::new(1).with_services(4));
        assert_eq!(pool.picker_count(), 0);

        pool.get_service(ServiceSelector::Random).unwrap();
        pool.get_service(ServiceSelector::Random).unwrap();
        assert_eq!(pool.picker_count(), 1);

        thread::scope(|scope| {
            scope.spawn(|| {
                pool.get_service(ServiceSelector::Random).unwrap();
            });
        });
        assert_eq!(pool.picker_count(), 2);
    }

    #[test]
    fn random_selector_stays_in_range() {
        let pool = ThreadPool::with_config(PoolConfig::new(1).with_services(3));
        for _ in 0..50 {
            // Resolution itself would panic on an out-of-range pick.
            pool.get_service(ServiceSelector::Random).unwrap();
        }
    }

    #[test]
    fn double_start_is_rejected() {
        let mut pool = ThreadPool::new(1);
        pool.start(DispatchPolicy::Random).unwrap();
        let err = pool.start(DispatchPolicy::Random).unwrap_err();
        assert!(matches!(err, PoolError::AlreadyRunning { .. }));
        pool.stop();
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mut pool = ThreadPool::new(2);
        pool.stop();
        pool.stop();
        assert!(!pool.is_running());
    }

    #[test]
    fn restart_after_stop_is_rejected() {
        let mut pool = ThreadPool::new(1);
        pool.start(DispatchPolicy::Random).unwrap();
        pool.stop();

        let err = pool.start(DispatchPolicy::Random).unwrap_err();
        assert!(matches!(err, PoolError::AlreadyStopped { .. }));
    }
}
