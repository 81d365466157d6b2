//! # Event-Loop Service
//!
//! A [`Service`] is the queue-draining reactor that pool worker threads run.
//! It owns a FIFO job queue; any number of threads may call [`Service::run`]
//! concurrently, and each loop pulls queued jobs and executes them until the
//! queue is empty and no [`WorkGuard`] is alive.
//!
//! ## Key Concepts
//! - Posting: queue a job for asynchronous execution on a loop thread
//! - Dispatching: run a job inline when the caller is already a loop thread
//! - Keep-alive: a `WorkGuard` stops an idle loop from returning
//!
//! Jobs queued on one service run in submission order as long as a single
//! thread serves it. With several threads in `run` on the same service the
//! jobs are pulled concurrently and must be independently thread-safe.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::trace;

/// A unit of work queued on a service.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// How long an idle run loop waits for new work before re-checking whether
/// it is still kept alive by a guard.
const IDLE_POLL: Duration = Duration::from_millis(10);

struct ServiceInner {
    queue_tx: Sender<Job>,
    queue_rx: Receiver<Job>,

    /// Number of live [`WorkGuard`]s. The run loop only returns once this
    /// reaches zero and the queue is drained.
    guards: AtomicUsize,

    /// Threads currently inside [`Service::run`]. Read by `dispatch` to
    /// decide whether it can execute inline.
    loop_threads: RwLock<HashSet<ThreadId>>,
}

/// Handle to one event-loop service.
///
/// Cheap to clone; all clones share the same queue and loop state. Equality
/// between handles means "same underlying service".
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = flume::unbounded();
        Self {
            inner: Arc::new(ServiceInner {
                queue_tx,
                queue_rx,
                guards: AtomicUsize::new(0),
                loop_threads: RwLock::new(HashSet::new()),
            }),
        }
    }

    /// Queue `job` for asynchronous execution on whichever thread runs this
    /// service's loop. Never blocks the caller.
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // The receiver lives inside `self`, so the send cannot fail.
        let _ = self.inner.queue_tx.send(Box::new(job));
    }

    /// Run `job` inline when the calling thread is already executing this
    /// service's loop, otherwise queue it like [`post`](Self::post).
    ///
    /// The inline path reenters the caller's stack: a job that dispatches to
    /// its own service runs the new job before the call returns.
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.running_in_this_thread() {
            job();
        } else {
            self.post(job);
        }
    }

    /// True when the calling thread is currently inside this service's
    /// [`run`](Self::run) loop.
    pub fn running_in_this_thread(&self) -> bool {
        self.inner
            .loop_threads
            .read()
            .unwrap()
            .contains(&thread::current().id())
    }

    /// Prevent the run loop from returning while idle. Dropping the guard
    /// releases the claim; the loop exits once the queue drains.
    pub fn work_guard(&self) -> WorkGuard {
        self.inner.guards.fetch_add(1, Ordering::SeqCst);
        WorkGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of jobs currently queued and not yet picked up by a loop.
    pub fn pending(&self) -> usize {
        self.inner.queue_rx.len()
    }

    /// Drain the queue on the calling thread until no work remains and no
    /// [`WorkGuard`] is alive. Jobs already queued always run to completion
    /// before the loop returns.
    ///
    /// A panic escaping a job unwinds out of `run`; the loop does not absorb
    /// it. The thread's registration is still cleaned up on the way out.
    pub fn run(&self) {
        let _registration = LoopRegistration::new(&self.inner);
        trace!("service loop entered");
        loop {
            match self.inner.queue_rx.recv_timeout(IDLE_POLL) {
                Ok(job) => job(),
                Err(RecvTimeoutError::Timeout) => {
                    if self.inner.guards.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        trace!("service loop exited");
    }
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Service {}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("pending", &self.inner.queue_rx.len())
            .field("guards", &self.inner.guards.load(Ordering::SeqCst))
            .field(
                "loop_threads",
                &self.inner.loop_threads.read().unwrap().len(),
            )
            .finish()
    }
}

/// Keep-alive token for a service's run loop.
///
/// While at least one guard is alive the loop idles instead of returning
/// when its queue is empty.
pub struct WorkGuard {
    inner: Arc<ServiceInner>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.inner.guards.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for WorkGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkGuard")
            .field("guards", &self.inner.guards.load(Ordering::SeqCst))
            .finish()
    }
}

/// Registers the current thread as a loop thread for the service; removal
/// happens on drop so a panicking job cannot leave a stale registration.
struct LoopRegistration<'a> {
    inner: &'a ServiceInner,
    id: ThreadId,
}

impl<'a> LoopRegistration<'a> {
    fn new(inner: &'a ServiceInner) -> Self {
        let id = thread::current().id();
        inner.loop_threads.write().unwrap().insert(id);
        Self { inner, id }
    }
}

impl Drop for LoopRegistration<'_> {
    fn drop(&mut self) {
        self.inner.loop_threads.write().unwrap().remove(&self.id);
    }
}
