//! Condition variable with FIFO wakeup
//!
//! A `KCond` is used together with an external `parking_lot::Mutex` that
//! protects the condition being waited for. The caller holds the external
//! lock when calling [`KCond::wait`]; the waiter is queued before that lock
//! is released, so a [`KCond::signal`] issued by anyone who observes the
//! queued state can never be lost. The external lock is held again when
//! `wait` returns.
//!
//! Waiting with a spinlock-class lock counted in the current context is a
//! contract violation.
//!
//! `signal` wakes waiters strictly in the order they were queued.
//! Waiters that are leaving because of a timeout or an interruption are
//! skipped, so a signal always goes to a waiter that is still sleeping.

use crate::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// How a wait ended. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by `signal` or `broadcast`
    Signalled,
    /// The timeout of a `timedwait` expired first
    TimedOut,
    /// The caller's [`CancelToken`] was cancelled
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterState {
    Blocked,
    Woken,
    TimedOut,
    Interrupted,
}

/// Per-wait record. Lives exactly as long as the `wait` call that made it.
struct Waiter {
    state: Mutex<WaiterState>,
    cond: Condvar,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaiterState::Blocked),
            cond: Condvar::new(),
        })
    }

    /// Returns false if the waiter already left on its own.
    fn wake(&self) -> bool {
        let mut state = self.state.lock();
        if *state != WaiterState::Blocked {
            return false;
        }
        *state = WaiterState::Woken;
        self.cond.notify_one();
        true
    }
}

pub struct KCond {
    queue: Mutex<VecDeque<Arc<Waiter>>>,
    #[cfg(test)]
    sleep_delay: Mutex<Option<Duration>>,
}

impl KCond {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            #[cfg(test)]
            sleep_delay: Mutex::new(None),
        }
    }

    /// Block until signalled or, when `cancel` is given, until it is cancelled.
    pub fn wait<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        cancel: Option<&CancelToken>,
    ) -> WaitOutcome {
        self.wait_inner(guard, None, cancel)
    }

    /// Like [`KCond::wait`] but gives up after `timeout`.
    ///
    /// A waiter whose timeout fired reports `TimedOut` even if a signal
    /// arrives while it is on its way out; that signal goes to the next
    /// waiter in line instead.
    pub fn timedwait<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> WaitOutcome {
        self.wait_inner(guard, Some(Instant::now() + timeout), cancel)
    }

    fn wait_inner<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
        cancel: Option<&CancelToken>,
    ) -> WaitOutcome {
        debug::might_sleep();
        let waiter = Waiter::new();
        self.queue.lock().push_back(Arc::clone(&waiter));
        let _registration = cancel.map(|token| token.register(&waiter));

        MutexGuard::unlocked(guard, || {
            #[cfg(test)]
            self.injected_delay();
            self.sleep(&waiter, deadline, cancel)
        })
    }

    fn sleep(
        &self,
        waiter: &Arc<Waiter>,
        deadline: Option<Instant>,
        cancel: Option<&CancelToken>,
    ) -> WaitOutcome {
        let mut state = waiter.state.lock();
        loop {
            if *state == WaiterState::Woken {
                return WaitOutcome::Signalled;
            }
            if cancel.map_or(false, CancelToken::is_cancelled) {
                *state = WaiterState::Interrupted;
                break;
            }
            match deadline {
                Some(deadline) => {
                    let timed_out = waiter.cond.wait_until(&mut state, deadline).timed_out();
                    if timed_out && *state == WaiterState::Blocked {
                        *state = WaiterState::TimedOut;
                        break;
                    }
                }
                None => waiter.cond.wait(&mut state),
            }
        }

        let outcome = match *state {
            WaiterState::TimedOut => WaitOutcome::TimedOut,
            _ => WaitOutcome::Interrupted,
        };
        drop(state);
        self.remove(waiter);
        outcome
    }

    /// Unlink a departing waiter. A no-op if a signaller got to it first.
    fn remove(&self, waiter: &Arc<Waiter>) {
        let mut queue = self.queue.lock();
        if let Some(pos) = queue.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            queue.remove(pos);
        }
    }

    /// Wake the oldest sleeping waiter, if any.
    pub fn signal(&self) {
        let mut queue = self.queue.lock();
        while let Some(waiter) = queue.pop_front() {
            if waiter.wake() {
                break;
            }
        }
    }

    /// Wake every queued waiter and empty the queue.
    pub fn broadcast(&self) {
        let mut queue = self.queue.lock();
        for waiter in queue.drain(..) {
            waiter.wake();
        }
    }

    /// Advisory: only valid at the instant it is sampled.
    pub fn has_waiters(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Advisory count of queued waiters.
    pub fn nr_waiters(&self) -> usize {
        self.queue.lock().len()
    }

    #[cfg(test)]
    fn set_sleep_delay(&self, delay: Option<Duration>) {
        *self.sleep_delay.lock() = delay;
    }

    #[cfg(test)]
    fn injected_delay(&self) {
        let delay = *self.sleep_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }
}

impl Default for KCond {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for KCond {
    fn drop(&mut self) {
        debug_assert!(
            self.queue.get_mut().is_empty() || std::thread::panicking(),
            "condition variable destroyed with waiters queued"
        );
    }
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    sleepers: Mutex<Vec<Weak<Waiter>>>,
}

/// Interruption source for interruptible waits.
///
/// Cancelling wakes every waiter currently sleeping with this token; they
/// return [`WaitOutcome::Interrupted`]. The token stays cancelled until
/// [`CancelToken::reset`].
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let sleepers = self.inner.sleepers.lock();
        for waiter in sleepers.iter().filter_map(Weak::upgrade) {
            // Taking the state lock orders this wakeup after the sleeper's
            // own check of the flag.
            let _state = waiter.state.lock();
            waiter.cond.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::SeqCst);
    }

    fn register(&self, waiter: &Arc<Waiter>) -> CancelRegistration<'_> {
        self.inner.sleepers.lock().push(Arc::downgrade(waiter));
        CancelRegistration {
            token: self,
            waiter: Arc::as_ptr(waiter),
        }
    }
}

struct CancelRegistration<'a> {
    token: &'a CancelToken,
    waiter: *const Waiter,
}

impl Drop for CancelRegistration<'_> {
    fn drop(&mut self) {
        let mut sleepers = self.token.inner.sleepers.lock();
        sleepers.retain(|w| !std::ptr::eq(w.as_ptr(), self.waiter) && w.strong_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(10), "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    type Shared = Arc<(Mutex<Vec<usize>>, KCond)>;

    fn spawn_waiter(shared: &Shared, id: usize) -> thread::JoinHandle<WaitOutcome> {
        let shared = Arc::clone(shared);
        thread::spawn(move || {
            let (lock, cond) = &*shared;
            let mut woken = lock.lock();
            let outcome = cond.wait(&mut woken, None);
            woken.push(id);
            outcome
        })
    }

    #[test]
    fn test_signal_wakes_in_fifo_order() {
        const N: usize = 6;
        let shared: Shared = Arc::new((Mutex::new(Vec::new()), KCond::new()));

        let mut handles = Vec::new();
        for i in 0..N {
            handles.push(spawn_waiter(&shared, i));
            wait_until("waiter to queue", || shared.1.nr_waiters() == i + 1);
        }

        for k in 0..N {
            shared.1.signal();
            wait_until("woken waiter to record itself", || shared.0.lock().len() == k + 1);
        }

        for handle in handles {
            assert_eq!(handle.join().unwrap(), WaitOutcome::Signalled);
        }
        assert_eq!(*shared.0.lock(), (0..N).collect::<Vec<_>>());
        assert!(!shared.1.has_waiters());
    }

    #[test]
    fn test_broadcast_wakes_everyone_once() {
        const N: usize = 5;
        let shared: Shared = Arc::new((Mutex::new(Vec::new()), KCond::new()));

        let handles: Vec<_> = (0..N).map(|i| spawn_waiter(&shared, i)).collect();
        wait_until("all waiters to queue", || shared.1.nr_waiters() == N);

        shared.1.broadcast();
        assert!(!shared.1.has_waiters());

        for handle in handles {
            assert_eq!(handle.join().unwrap(), WaitOutcome::Signalled);
        }
        let mut woken = shared.0.lock().clone();
        woken.sort_unstable();
        assert_eq!(woken, (0..N).collect::<Vec<_>>());
    }

    #[test]
    fn test_signal_between_enqueue_and_sleep_is_not_lost() {
        let shared: Shared = Arc::new((Mutex::new(Vec::new()), KCond::new()));
        shared.1.set_sleep_delay(Some(Duration::from_millis(100)));

        let handle = spawn_waiter(&shared, 7);
        wait_until("waiter to queue", || shared.1.has_waiters());
        // The waiter is queued but still inside the injected delay.
        shared.1.signal();

        assert_eq!(handle.join().unwrap(), WaitOutcome::Signalled);
        assert_eq!(*shared.0.lock(), vec![7]);
    }

    #[test]
    fn test_broadcast_between_enqueue_and_sleep_is_not_lost() {
        const N: usize = 3;
        let shared: Shared = Arc::new((Mutex::new(Vec::new()), KCond::new()));
        shared.1.set_sleep_delay(Some(Duration::from_millis(100)));

        let handles: Vec<_> = (0..N).map(|i| spawn_waiter(&shared, i)).collect();
        wait_until("all waiters to queue", || shared.1.nr_waiters() == N);
        // Every waiter is queued but none has gone to sleep yet.
        shared.1.broadcast();
        assert!(!shared.1.has_waiters());

        for handle in handles {
            assert_eq!(handle.join().unwrap(), WaitOutcome::Signalled);
        }
        let mut woken = shared.0.lock().clone();
        woken.sort_unstable();
        assert_eq!(woken, (0..N).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "sleeping with spinlocks held")]
    fn test_wait_with_spinlock_held_panics() {
        let (sb, _, _) = crate::test_utils::mock_super_block("kcond-spin");
        let _ctx = crate::context::init_context(&sb);
        debug::lock_acquired(crate::LockClass::JnodeSpin);

        let lock = Mutex::new(());
        let cond = KCond::new();
        let mut guard = lock.lock();
        cond.timedwait(&mut guard, Duration::from_millis(10), None);
    }

    #[test]
    fn test_wait_holding_sleeping_lock_is_allowed() {
        let (sb, _, _) = crate::test_utils::mock_super_block("kcond-sleeping-lock");
        let ctx = crate::context::init_context(&sb);
        debug::lock_acquired(crate::LockClass::LongTermZnode);

        let lock = Mutex::new(());
        let cond = KCond::new();
        let mut guard = lock.lock();
        assert_eq!(
            cond.timedwait(&mut guard, Duration::from_millis(5), None),
            WaitOutcome::TimedOut
        );
        drop(guard);

        debug::lock_released(crate::LockClass::LongTermZnode);
        ctx.exit();
    }

    #[test]
    fn test_timedwait_times_out_and_dequeues() {
        let lock = Mutex::new(());
        let cond = KCond::new();
        let mut guard = lock.lock();

        let start = Instant::now();
        let outcome = cond.timedwait(&mut guard, Duration::from_millis(30), None);

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!cond.has_waiters());
    }

    #[test]
    fn test_signal_without_waiters_is_a_no_op() {
        let lock = Mutex::new(());
        let cond = KCond::new();
        cond.signal();
        cond.broadcast();

        let mut guard = lock.lock();
        assert_eq!(
            cond.timedwait(&mut guard, Duration::from_millis(10), None),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn test_cancel_interrupts_waiter() {
        let shared = Arc::new((Mutex::new(()), KCond::new()));
        let token = CancelToken::new();

        let handle = {
            let shared = Arc::clone(&shared);
            let token = token.clone();
            thread::spawn(move || {
                let (lock, cond) = &*shared;
                let mut guard = lock.lock();
                cond.wait(&mut guard, Some(&token))
            })
        };

        wait_until("waiter to queue", || shared.1.has_waiters());
        token.cancel();

        assert_eq!(handle.join().unwrap(), WaitOutcome::Interrupted);
        assert!(!shared.1.has_waiters());
    }

    #[test]
    fn test_cancelled_token_interrupts_immediately() {
        let lock = Mutex::new(());
        let cond = KCond::new();
        let token = CancelToken::new();
        token.cancel();

        let mut guard = lock.lock();
        assert_eq!(cond.wait(&mut guard, Some(&token)), WaitOutcome::Interrupted);

        token.reset();
        assert_eq!(
            cond.timedwait(&mut guard, Duration::from_millis(5), Some(&token)),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn test_signal_skips_interrupted_waiter() {
        let shared = Arc::new((Mutex::new(Vec::new()), KCond::new()));
        let token = CancelToken::new();

        let first = {
            let shared = Arc::clone(&shared);
            let token = token.clone();
            thread::spawn(move || {
                let (lock, cond) = &*shared;
                let mut guard = lock.lock();
                cond.wait(&mut guard, Some(&token))
            })
        };
        wait_until("first waiter to queue", || shared.1.nr_waiters() == 1);
        let second = spawn_waiter(&shared, 2);
        wait_until("second waiter to queue", || shared.1.nr_waiters() == 2);

        token.cancel();
        assert_eq!(first.join().unwrap(), WaitOutcome::Interrupted);

        shared.1.signal();
        assert_eq!(second.join().unwrap(), WaitOutcome::Signalled);
        assert_eq!(*shared.0.lock(), vec![2]);
    }

    #[test]
    fn test_external_lock_held_on_return() {
        let shared = Arc::new((Mutex::new(0u32), KCond::new()));
        let handle = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let (lock, cond) = &*shared;
                let mut value = lock.lock();
                while *value == 0 {
                    cond.wait(&mut value, None);
                }
                *value += 1;
                *value
            })
        };

        wait_until("waiter to queue", || shared.1.has_waiters());
        *shared.0.lock() = 41;
        shared.1.signal();
        assert_eq!(handle.join().unwrap(), 42);
    }
}
