//! Ent write-back daemon
//!
//! One thread per mounted volume. Page write-out requests coming from the
//! page-dirtying path are counted and, once the backlog of asynchronous
//! requests exceeds `async_requests_limit`, queued; the submitter then
//! sleeps until the daemon (or an early completion) releases its request.
//!
//! The daemon runs flush passes, each inside its own context, for as long
//! as any request is outstanding. A queued request that has sat at the
//! head of the queue for more than `max_iters` passes is released without
//! another pass.

use parking_lot::{Mutex, MutexGuard};
use r4_core::config::EntdConfig;
use r4_core::context::{self, init_context};
use r4_core::debug;
use r4_core::{
    CancelToken, Completion, FlushFlags, KCond, Page, R4Error, Result, SuperBlock, WaitOutcome,
    WritebackControl,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntdStats {
    pub flush_passes: u64,
    pub failed_passes: u64,
    pub sync_submissions: u64,
    pub async_submissions: u64,
    /// Queued requests released after `max_iters` passes
    pub forced_completions: u64,
    /// Queued requests released by `ent_writes_page`
    pub early_completions: u64,
    pub async_retired: u64,
    /// Queued requests released by shutdown
    pub drained_at_shutdown: u64,
    pub interrupted_waits: u64,
}

/// How `write_page_by_ent` disposed of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// No daemon; the page is left dirty
    NotRunning,
    /// Counted, caller did not block
    Async,
    /// Queued, and released by the daemon or an early completion
    Completed,
}

struct WbqRequest {
    page: Arc<dyn Page>,
    for_reclaim: bool,
    done: Completion,
}

struct Queued {
    request: Arc<WbqRequest>,
    iters: u32,
}

struct EntdState {
    running: bool,
    done: bool,
    flushers: u32,
    nr_all_requests: u64,
    nr_synchronous_requests: u64,
    wbq: VecDeque<Queued>,
    stats: EntdStats,
}

impl EntdState {
    fn retire_front(&mut self) -> Option<Arc<WbqRequest>> {
        let queued = self.wbq.pop_front()?;
        self.nr_all_requests -= 1;
        self.nr_synchronous_requests -= 1;
        Some(queued.request)
    }

    fn nr_async(&self) -> u64 {
        self.nr_all_requests - self.nr_synchronous_requests
    }
}

struct EntdShared {
    sb: Arc<SuperBlock>,
    config: EntdConfig,
    guard: Mutex<EntdState>,
    /// Work available
    wait: KCond,
    /// Cancelled by `stop`
    shutdown: CancelToken,
    started: Completion,
    finish: Completion,
}

pub struct Entd {
    shared: Arc<EntdShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Entd {
    /// Spawn the daemon for `sb` and wait until it reports running.
    pub fn start(sb: &Arc<SuperBlock>) -> Result<Self> {
        let shared = Arc::new(EntdShared {
            sb: Arc::clone(sb),
            config: sb.config().entd.clone(),
            guard: Mutex::new(EntdState {
                running: false,
                done: false,
                flushers: 0,
                nr_all_requests: 0,
                nr_synchronous_requests: 0,
                wbq: VecDeque::new(),
                stats: EntdStats::default(),
            }),
            wait: KCond::new(),
            shutdown: CancelToken::new(),
            started: Completion::new(),
            finish: Completion::new(),
        });

        let daemon = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("ent:{}", sb.name()))
            .spawn(move || daemon.run())
            .map_err(|e| R4Error::ThreadSpawn(format!("ent:{}: {}", sb.name(), e)))?;
        shared.started.wait();

        tracing::info!("{}: ent daemon started", sb.name());
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Hand a dirty page over to the daemon.
    ///
    /// The page is re-dirtied and unlocked first; callers must not assume
    /// anything about its lock state afterwards. Blocks only when the
    /// asynchronous backlog is full.
    pub fn write_page_by_ent(&self, page: Arc<dyn Page>, wbc: &WritebackControl) -> Submission {
        page.mark_dirty();
        page.unlock();

        let shared = &self.shared;
        let mut state = shared.guard.lock();
        if !state.running || state.done {
            return Submission::NotRunning;
        }
        let blocking = state.nr_all_requests + 1
            > state.nr_synchronous_requests + shared.config.async_requests_limit;
        if blocking {
            debug::might_sleep();
        }
        if state.flushers == 0 {
            shared.wait.signal();
        }
        state.nr_all_requests += 1;
        if !blocking {
            state.stats.async_submissions += 1;
            return Submission::Async;
        }

        let request = Arc::new(WbqRequest {
            page,
            for_reclaim: wbc.for_reclaim,
            done: Completion::new(),
        });
        state.wbq.push_back(Queued {
            request: Arc::clone(&request),
            iters: 0,
        });
        state.nr_synchronous_requests += 1;
        state.stats.sync_submissions += 1;
        drop(state);

        tracing::trace!(
            "{}: page {} queued for ent",
            shared.sb.name(),
            request.page.index()
        );
        request.done.wait();
        Submission::Completed
    }

    /// Some other path finished writing `page`; release the oldest request.
    pub fn ent_writes_page(&self, page: &dyn Page) {
        if page.is_active() {
            return;
        }
        let mut state = self.shared.guard.lock();
        if state.nr_all_requests == 0 {
            return;
        }
        page.set_reclaim();
        match state.retire_front() {
            Some(request) => {
                state.stats.early_completions += 1;
                drop(state);
                request.done.complete();
            }
            None => {
                state.nr_all_requests -= 1;
                state.stats.async_retired += 1;
            }
        }
    }

    pub fn enter_flush(&self) {
        self.shared.guard.lock().flushers += 1;
    }

    pub fn leave_flush(&self) {
        let mut state = self.shared.guard.lock();
        r4_core::r4_assert!(state.flushers > 0, "leave_flush without enter_flush");
        state.flushers -= 1;
        if state.flushers == 0 && state.nr_synchronous_requests != 0 {
            self.shared.wait.signal();
        }
    }

    /// Bracket a long-running flush done outside the daemon.
    pub fn flush_scope(&self) -> FlushGuard<'_> {
        self.enter_flush();
        FlushGuard { entd: self }
    }

    /// True if there are submitters sleeping on the queue.
    pub fn wbq_available(&self) -> bool {
        !self.shared.guard.lock().wbq.is_empty()
    }

    /// Page indexes of the queued requests, oldest first.
    pub fn queued_pages(&self) -> Vec<u64> {
        self.shared
            .guard
            .lock()
            .wbq
            .iter()
            .map(|queued| queued.request.page.index())
            .collect()
    }

    /// `(nr_all_requests, nr_synchronous_requests)`
    pub fn request_counts(&self) -> (u64, u64) {
        let state = self.shared.guard.lock();
        (state.nr_all_requests, state.nr_synchronous_requests)
    }

    pub fn nr_flushers(&self) -> u32 {
        self.shared.guard.lock().flushers
    }

    pub fn is_running(&self) -> bool {
        self.shared.guard.lock().running
    }

    pub fn stats(&self) -> EntdStats {
        self.shared.guard.lock().stats.clone()
    }

    /// Stop the daemon, releasing every queued submitter. Idempotent.
    pub fn stop(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        {
            let mut state = self.shared.guard.lock();
            state.done = true;
            self.shared.shutdown.cancel();
        }
        self.shared.finish.wait();
        if thread.join().is_err() {
            tracing::warn!("{}: ent daemon panicked", self.shared.sb.name());
        }
        tracing::info!("{}: ent daemon stopped", self.shared.sb.name());
    }
}

impl Drop for Entd {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct FlushGuard<'a> {
    entd: &'a Entd,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.entd.leave_flush();
    }
}

impl EntdShared {
    fn run(&self) {
        let mut state = self.guard.lock();
        state.running = true;
        self.started.complete();

        while !state.done {
            self.drain(&mut state);
            if state.done {
                break;
            }
            if self.wait.wait(&mut state, Some(&self.shutdown)) == WaitOutcome::Interrupted {
                state.stats.interrupted_waits += 1;
                tracing::debug!("{}: ent wait interrupted", self.sb.name());
            }
        }

        self.wakeup_all_wbq(&mut state);
        state.running = false;
        drop(state);
        self.finish.complete();
    }

    /// Work until no request is outstanding or shutdown is requested.
    fn drain(&self, state: &mut MutexGuard<'_, EntdState>) {
        while state.nr_all_requests != 0 && !state.done {
            let mut for_reclaim = false;
            if let Some(front) = state.wbq.front_mut() {
                front.iters += 1;
                if front.iters > self.config.max_iters {
                    if let Some(request) = state.retire_front() {
                        state.stats.forced_completions += 1;
                        tracing::debug!(
                            "{}: page {} released after {} passes",
                            self.sb.name(),
                            request.page.index(),
                            self.config.max_iters
                        );
                        request.done.complete();
                    }
                    continue;
                }
                for_reclaim = front.request.for_reclaim;
            }

            let result = MutexGuard::unlocked(state, || self.flush_pass(for_reclaim));
            state.stats.flush_passes += 1;
            let submitted = match result {
                Ok(submitted) => submitted as u64,
                Err(e) => {
                    state.stats.failed_passes += 1;
                    tracing::warn!("{}: ent flush pass failed: {}", self.sb.name(), e);
                    0
                }
            };

            if state.nr_synchronous_requests == 0 {
                let retired = state.nr_async().min(submitted.max(1));
                state.nr_all_requests -= retired;
                state.stats.async_retired += retired;
            }
        }
    }

    fn flush_pass(&self, for_reclaim: bool) -> Result<usize> {
        let ctx = init_context(&self.sb);
        context::with_current(|ctx| ctx.set_entd());

        let nr_to_write = self.config.nr_to_write;
        let mut wbc = if for_reclaim {
            WritebackControl::for_reclaim(nr_to_write)
        } else {
            WritebackControl::new(nr_to_write)
        };
        let result = self
            .sb
            .page_cache()
            .capture_anonymous_pages(&self.sb, &mut wbc)
            .and_then(|_| {
                self.sb
                    .txn_manager()
                    .flush_some_atom(&mut wbc, FlushFlags::WRITE_BLOCKS)
            });
        ctx.exit();

        if let Ok(submitted) = result {
            tracing::trace!("{}: ent pass submitted {} blocks", self.sb.name(), submitted);
        }
        result
    }

    fn wakeup_all_wbq(&self, state: &mut EntdState) {
        let mut drained = 0;
        while let Some(request) = state.retire_front() {
            request.done.complete();
            drained += 1;
        }
        state.stats.drained_at_shutdown += drained;
        state.nr_all_requests = 0;
        if drained != 0 {
            tracing::debug!("{}: released {} queued pages at shutdown", self.sb.name(), drained);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r4_core::config::VolumeConfig;
    use r4_core::test_utils::{mock_super_block_with, MockPage};
    use std::time::{Duration, Instant};

    fn volume(async_limit: u64, max_iters: u32) -> Arc<SuperBlock> {
        let mut config = VolumeConfig::default();
        config.entd.async_requests_limit = async_limit;
        config.entd.max_iters = max_iters;
        mock_super_block_with("entd-unit", config).0
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_async_submission_does_not_block() {
        let sb = volume(4, 10);
        let entd = Entd::start(&sb).unwrap();
        assert!(entd.is_running());

        let page = MockPage::new(1);
        let outcome = entd.write_page_by_ent(page.clone(), &WritebackControl::new(1));
        assert_eq!(outcome, Submission::Async);
        assert!(page.is_dirty());
        assert!(!page.is_locked());

        // async work is retired by flush passes
        wait_for(|| entd.request_counts() == (0, 0));
        let stats = entd.stats();
        assert_eq!(stats.async_submissions, 1);
        assert_eq!(stats.async_retired, 1);
        assert!(stats.flush_passes >= 1);
    }

    #[test]
    fn test_submission_after_stop_is_skipped() {
        let sb = volume(0, 10);
        let entd = Entd::start(&sb).unwrap();
        entd.stop();
        assert!(!entd.is_running());

        let page = MockPage::new(9);
        let outcome = entd.write_page_by_ent(page.clone(), &WritebackControl::new(1));
        assert_eq!(outcome, Submission::NotRunning);
        assert!(page.is_dirty());
        assert_eq!(entd.request_counts(), (0, 0));
    }

    #[test]
    fn test_stop_interrupts_idle_daemon() {
        let sb = volume(4, 10);
        let entd = Entd::start(&sb).unwrap();
        wait_for(|| entd.shared.wait.has_waiters());

        entd.stop();
        let stats = entd.stats();
        assert_eq!(stats.interrupted_waits, 1);
        assert_eq!(stats.flush_passes, 0);
    }

    #[test]
    #[should_panic(expected = "sleeping with spinlocks held")]
    fn test_blocking_submission_with_spinlock_held_panics() {
        let sb = volume(0, 10);
        let entd = Entd::start(&sb).unwrap();
        let _ctx = init_context(&sb);
        debug::lock_acquired(r4_core::LockClass::JnodeSpin);
        entd.write_page_by_ent(MockPage::new(1), &WritebackControl::new(1));
    }

    #[test]
    fn test_async_submission_with_spinlock_held_is_allowed() {
        let sb = volume(4, 10);
        let entd = Entd::start(&sb).unwrap();
        let ctx = init_context(&sb);
        debug::lock_acquired(r4_core::LockClass::JnodeSpin);
        let outcome = entd.write_page_by_ent(MockPage::new(1), &WritebackControl::new(1));
        assert_eq!(outcome, Submission::Async);
        debug::lock_released(r4_core::LockClass::JnodeSpin);
        ctx.exit();
        assert_eq!(entd.request_counts().1, 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let sb = volume(0, 10);
        let entd = Entd::start(&sb).unwrap();
        entd.stop();
        entd.stop();
        drop(entd);
    }

    #[test]
    fn test_ent_writes_page_skips_active_pages() {
        let sb = volume(4, 10);
        let entd = Entd::start(&sb).unwrap();
        entd.enter_flush();
        entd.write_page_by_ent(MockPage::new(1), &WritebackControl::new(1));

        let active = MockPage::new(2);
        active.set_active(true);
        entd.ent_writes_page(active.as_ref());
        assert!(!active.is_reclaim());

        entd.leave_flush();
        entd.stop();
    }

    #[test]
    fn test_flush_guard_balances() {
        let sb = volume(4, 10);
        let entd = Entd::start(&sb).unwrap();
        {
            let _outer = entd.flush_scope();
            let _inner = entd.flush_scope();
            assert_eq!(entd.nr_flushers(), 2);
        }
        assert_eq!(entd.nr_flushers(), 0);
    }

    #[test]
    #[should_panic(expected = "leave_flush without enter_flush")]
    fn test_unbalanced_leave_flush_panics() {
        let sb = volume(4, 10);
        let entd = Entd::start(&sb).unwrap();
        entd.leave_flush();
    }
}
