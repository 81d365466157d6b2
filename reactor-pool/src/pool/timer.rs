//! # Self-Rescheduling Timer
//!
//! A [`Timer`] is a cancellable handle to a delayed callback bound to one
//! service. The driving loop runs on a dedicated thread: wait out the delay,
//! run the callback on the bound service, then re-arm for another interval
//! while the callback keeps asking for it.
//!
//! Expressing the reschedule as an explicit loop keeps stack depth bounded
//! and makes cancellation a flag check between iterations.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error};

use crate::service::Service;

/// How often a timer blocked on callback completion re-checks whether it has
/// been cancelled. Keeps a cancelled timer from wedging shutdown behind a
/// queue that will never drain.
const COMPLETION_POLL: Duration = Duration::from_millis(20);

/// Return-type contract for timer callbacks: `bool` decides whether the
/// timer re-arms, `()` always re-arms.
pub trait TimerStatus {
    fn reschedule(self) -> bool;
}

impl TimerStatus for bool {
    fn reschedule(self) -> bool {
        self
    }
}

impl TimerStatus for () {
    fn reschedule(self) -> bool {
        true
    }
}

/// Cancellable handle to a scheduled callback.
///
/// Cloning yields another handle to the same timer. Dropping every handle
/// does not stop the timer by itself; the pool keeps the pending wait alive
/// until the callback declines rescheduling, a handle is cancelled, or the
/// pool shuts down.
#[derive(Clone)]
pub struct Timer {
    cancelled: Arc<AtomicBool>,
    wake: Sender<()>,
}

impl Timer {
    /// Stop the timer. Idempotent. An invocation already in flight may still
    /// complete; no further ones start.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Wake a wait in progress; a full channel means one is queued.
        let _ = self.wake.try_send(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Wait side of a timer, owned by its driving thread.
pub(crate) struct TimerGate {
    cancelled: Arc<AtomicBool>,
    wake: Receiver<()>,
}

enum Wait {
    Fire,
    Cancel,
}

impl TimerGate {
    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Block out one delay interval, distinguishing expiry from
    /// cancellation.
    fn wait(&self, delay: Duration) -> Wait {
        if self.cancelled() {
            return Wait::Cancel;
        }
        match self.wake.recv_timeout(delay) {
            Ok(()) => Wait::Cancel,
            Err(RecvTimeoutError::Disconnected) => Wait::Cancel,
            Err(RecvTimeoutError::Timeout) => {
                if self.cancelled() {
                    Wait::Cancel
                } else {
                    Wait::Fire
                }
            }
        }
    }
}

/// Create a connected handle/gate pair.
pub(crate) fn timer_pair() -> (Timer, TimerGate) {
    let cancelled = Arc::new(AtomicBool::new(false));
    let (wake_tx, wake_rx) = flume::bounded(1);
    (
        Timer {
            cancelled: Arc::clone(&cancelled),
            wake: wake_tx,
        },
        TimerGate {
            cancelled,
            wake: wake_rx,
        },
    )
}

/// Drive one timer to completion: wait out the delay, run the callback on
/// its service, re-arm while the callback keeps asking for it.
///
/// Cancellation (explicit or through pool shutdown) ends the loop silently.
/// A callback that is dropped without running while the timer is still live
/// means the service side died underneath us; that is escalated, not
/// retried.
pub(crate) fn run_timer<F, R>(service: Service, delay: Duration, mut callback: F, gate: TimerGate)
where
    F: FnMut() -> R + Send + 'static,
    R: TimerStatus,
{
    loop {
        if let Wait::Cancel = gate.wait(delay) {
            debug!("timer cancelled");
            return;
        }

        let (done_tx, done_rx) = flume::bounded(1);
        let mut cb = callback;
        service.post(move || {
            let again = cb().reschedule();
            let _ = done_tx.send((again, cb));
        });

        let (again, cb) = loop {
            match done_rx.recv_timeout(COMPLETION_POLL) {
                Ok(result) => break result,
                Err(RecvTimeoutError::Timeout) => {
                    if gate.cancelled() {
                        // The queued callback may still run later; its
                        // result no longer matters.
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if gate.cancelled() {
                        return;
                    }
                    error!("timer callback was dropped without running");
                    panic!("timer callback was dropped without running");
                }
            }
        };

        if !again {
            debug!("timer callback declined reschedule");
            return;
        }
        callback = cb;
    }
}
