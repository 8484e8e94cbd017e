use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error};

/// Minimum rearm interval for the timer thread. Rearming closer than this
/// just burns CPU without improving accuracy.
const MIN_REARM: Duration = Duration::from_millis(1);

/// Idle wait when the heap is empty.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Which mechanism drives a deferred callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerBackend {
    /// Delegates to the async runtime's native timer. Fires only while the
    /// runtime is pumping, so it must not be used for cleanup deadlines.
    Cooperative,
    /// Dedicated timer thread with a min-heap and a condition variable armed
    /// to the next deadline. Fires even when the event loop is stuck.
    Thread,
}

/// Handle to a pending deadline. Cancellation through a stale handle (already
/// fired or already cancelled) is a no-op.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Whether the callback has already run.
    pub fn has_fired(&self) -> bool {
        self.fired.load(AtomicOrdering::SeqCst)
    }
}

/// A pending thread-backend deadline. Ordered by fire time, ties broken by
/// insertion sequence so equal deadlines fire in issue order.
struct Deadline {
    fire_at: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
    callback: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline is on top.
        (other.fire_at, other.seq).cmp(&(self.fire_at, self.seq))
    }
}

struct WheelInner {
    heap: BinaryHeap<Deadline>,
    shutdown: bool,
}

struct WheelShared {
    inner: Mutex<WheelInner>,
    wakeup: Condvar,
    panics: Mutex<Vec<String>>,
}

impl WheelShared {
    /// Runs one callback outside the heap lock. Panics are collected, never
    /// swallowed silently, and never prevent the worker from rearming.
    fn fire(&self, deadline: Deadline) {
        if deadline.cancelled.load(AtomicOrdering::SeqCst) {
            debug!(seq = deadline.seq, "deadline cancelled before firing");
            return;
        }
        if deadline.fired.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        debug!(seq = deadline.seq, "firing deadline");
        if let Err(panic) = catch_unwind(AssertUnwindSafe(deadline.callback)) {
            let message = panic_message(panic.as_ref());
            error!(seq = deadline.seq, %message, "deadline callback panicked");
            self.panics
                .lock()
                .expect("timer panic log poisoned")
                .push(message);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Deferred-callback scheduler with two backends.
///
/// One instance per scenario; dropping the wheel stops the timer thread, so
/// deadlines from one scenario can never leak into the next.
pub struct TimerWheel {
    shared: Arc<WheelShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_seq: AtomicU64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(WheelShared {
                inner: Mutex::new(WheelInner {
                    heap: BinaryHeap::new(),
                    shutdown: false,
                }),
                wakeup: Condvar::new(),
                panics: Mutex::new(Vec::new()),
            }),
            worker: Mutex::new(None),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Schedules `callback` to run after `delay`.
    ///
    /// A zero delay is due-checked synchronously: the callback runs on the
    /// calling thread before `after` returns. Callbacks on the thread backend
    /// run on the timer thread and must not block; they may schedule further
    /// deadlines.
    pub fn after<F>(&self, delay: Duration, backend: TimerBackend, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        let handle = TimerHandle {
            id: seq,
            cancelled: Arc::new(AtomicBool::new(false)),
            fired: Arc::new(AtomicBool::new(false)),
        };

        if delay.is_zero() {
            // Already due; fire inline so callers see it before we return.
            self.shared.fire(Deadline {
                fire_at: Instant::now(),
                seq,
                cancelled: handle.cancelled.clone(),
                fired: handle.fired.clone(),
                callback: Box::new(callback),
            });
            return handle;
        }

        match backend {
            TimerBackend::Cooperative => {
                let cancelled = handle.cancelled.clone();
                let fired = handle.fired.clone();
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.fire(Deadline {
                        fire_at: Instant::now(),
                        seq,
                        cancelled,
                        fired,
                        callback: Box::new(callback),
                    });
                });
            }
            TimerBackend::Thread => {
                self.ensure_worker();
                let deadline = Deadline {
                    fire_at: Instant::now() + delay,
                    seq,
                    cancelled: handle.cancelled.clone(),
                    fired: handle.fired.clone(),
                    callback: Box::new(callback),
                };
                let mut inner = self.shared.inner.lock().expect("timer heap poisoned");
                inner.heap.push(deadline);
                // The new deadline may be earlier than the one the worker is
                // armed for.
                self.shared.wakeup.notify_one();
            }
        }

        debug!(seq, ?delay, ?backend, "deadline armed");
        handle
    }

    /// Cancels a pending deadline. Idempotent: cancelling twice, or after the
    /// callback has fired, is a no-op and never double-invokes.
    pub fn cancel(&self, handle: &TimerHandle) {
        let was = handle.cancelled.swap(true, AtomicOrdering::SeqCst);
        if !was && !handle.has_fired() {
            debug!(seq = handle.id, "deadline cancelled");
        }
    }

    /// Drains the messages of callbacks that panicked while firing.
    pub fn take_panics(&self) -> Vec<String> {
        std::mem::take(&mut *self.shared.panics.lock().expect("timer panic log poisoned"))
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock().expect("timer worker slot poisoned");
        if worker.is_some() {
            return;
        }
        let shared = self.shared.clone();
        *worker = Some(
            std::thread::Builder::new()
                .name("timer-wheel".to_string())
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn timer thread"),
        );
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.inner.lock().expect("timer heap poisoned");
            inner.shutdown = true;
            inner.heap.clear();
        }
        self.shared.wakeup.notify_one();
        if let Some(worker) = self.worker.lock().expect("timer worker slot poisoned").take() {
            let _ = worker.join();
        }
    }
}

/// Pops and fires every due deadline, then rearms the condition variable for
/// the new heap top. Callbacks run outside the lock, so a callback inserting
/// new deadlines re-enters safely.
fn worker_loop(shared: Arc<WheelShared>) {
    let mut guard = shared.inner.lock().expect("timer heap poisoned");
    loop {
        if guard.shutdown {
            return;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        while guard
            .heap
            .peek()
            .map_or(false, |deadline| deadline.fire_at <= now)
        {
            due.push(guard.heap.pop().expect("peeked deadline vanished"));
        }

        if !due.is_empty() {
            drop(guard);
            for deadline in due {
                shared.fire(deadline);
            }
            guard = shared.inner.lock().expect("timer heap poisoned");
            continue;
        }

        let wait = guard
            .heap
            .peek()
            .map(|deadline| {
                deadline
                    .fire_at
                    .saturating_duration_since(now)
                    .max(MIN_REARM)
            })
            .unwrap_or(IDLE_WAIT);
        let (next, _timed_out) = shared
            .wakeup
            .wait_timeout(guard, wait)
            .expect("timer heap poisoned");
        guard = next;
    }
}
