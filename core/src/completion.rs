//! One-shot completion: a semaphore that starts out blocked and is released once.

use crate::debug;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every waiter. Returns false if someone already completed it.
    pub fn complete(&self) -> bool {
        let mut done = self.done.lock();
        if *done {
            return false;
        }
        *done = true;
        self.cond.notify_all();
        true
    }

    pub fn wait(&self) {
        debug::might_sleep();
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    /// Returns true if completed before the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        debug::might_sleep();
        let mut done = self.done.lock();
        if !*done {
            self.cond.wait_while_for(&mut done, |done| !*done, timeout);
        }
        *done
    }

    pub fn is_completed(&self) -> bool {
        *self.done.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_complete_releases_waiter() {
        let completion = Arc::new(Completion::new());
        let waiter = {
            let completion = Arc::clone(&completion);
            thread::spawn(move || completion.wait())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(completion.complete());
        waiter.join().unwrap();
        assert!(completion.is_completed());
    }

    #[test]
    fn test_second_complete_reports_false() {
        let completion = Completion::new();
        assert!(completion.complete());
        assert!(!completion.complete());
    }

    #[test]
    #[should_panic(expected = "sleeping with spinlocks held")]
    fn test_wait_with_spinlock_held_panics() {
        let (sb, _, _) = crate::test_utils::mock_super_block("completion-spin");
        let _ctx = crate::context::init_context(&sb);
        debug::lock_acquired(crate::LockClass::EntdSpin);

        let completion = Completion::new();
        completion.complete();
        completion.wait();
    }

    #[test]
    fn test_wait_timeout() {
        let completion = Completion::new();
        assert!(!completion.wait_timeout(Duration::from_millis(10)));
        completion.complete();
        assert!(completion.wait_timeout(Duration::from_millis(10)));
    }
}
