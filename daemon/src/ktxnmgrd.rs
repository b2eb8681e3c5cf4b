//! Transaction commit daemon
//!
//! Wakes up every `timeout_ms` (or when kicked) and asks the transaction
//! manager to commit whatever atoms its own policy considers due. A kick
//! that arrives while a scan is running makes the daemon scan again
//! straight away instead of going back to sleep.

use parking_lot::{Mutex, MutexGuard};
use r4_core::context::init_context;
use r4_core::{CancelToken, KCond, R4Error, Result, SuperBlock, WaitOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnmgrdStats {
    pub scans: u64,
    /// Scans repeated because of a kick during the previous one
    pub rescans: u64,
    pub failed_scans: u64,
    pub atoms_committed: u64,
    pub interrupted_waits: u64,
}

struct TxnmgrdState {
    running: bool,
    done: bool,
    rescan: bool,
    stats: TxnmgrdStats,
}

struct TxnmgrdShared {
    sb: Arc<SuperBlock>,
    timeout: Duration,
    guard: Mutex<TxnmgrdState>,
    wait: KCond,
    startup: KCond,
    /// Cancelled by `stop`
    shutdown: CancelToken,
}

pub struct Ktxnmgrd {
    shared: Arc<TxnmgrdShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Ktxnmgrd {
    pub fn start(sb: &Arc<SuperBlock>) -> Result<Self> {
        let shared = Arc::new(TxnmgrdShared {
            sb: Arc::clone(sb),
            timeout: sb.config().ktxnmgrd.timeout(),
            guard: Mutex::new(TxnmgrdState {
                running: false,
                done: false,
                rescan: false,
                stats: TxnmgrdStats::default(),
            }),
            wait: KCond::new(),
            startup: KCond::new(),
            shutdown: CancelToken::new(),
        });

        let daemon = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("ktxnmgrd:{}", sb.name()))
            .spawn(move || daemon.run())
            .map_err(|e| R4Error::ThreadSpawn(format!("ktxnmgrd:{}: {}", sb.name(), e)))?;

        {
            let mut state = shared.guard.lock();
            while !state.running {
                shared.startup.wait(&mut state, None);
            }
        }

        tracing::info!(
            "{}: commit daemon started, interval {:?}",
            sb.name(),
            shared.timeout
        );
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Ask for a commit scan now rather than at the next timeout.
    pub fn kick(&self) -> Result<()> {
        let mut state = self.shared.guard.lock();
        if !state.running || state.done {
            return Err(R4Error::DaemonNotRunning(format!(
                "ktxnmgrd:{}",
                self.shared.sb.name()
            )));
        }
        state.rescan = true;
        self.shared.wait.signal();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.guard.lock().running
    }

    pub fn stats(&self) -> TxnmgrdStats {
        self.shared.guard.lock().stats.clone()
    }

    /// Stop the daemon and wait for its thread. Idempotent.
    pub fn stop(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        {
            let mut state = self.shared.guard.lock();
            state.done = true;
            self.shared.shutdown.cancel();
        }
        if thread.join().is_err() {
            tracing::warn!("{}: commit daemon panicked", self.shared.sb.name());
        }
        tracing::info!("{}: commit daemon stopped", self.shared.sb.name());
    }
}

impl Drop for Ktxnmgrd {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TxnmgrdShared {
    fn run(&self) {
        let mut state = self.guard.lock();
        state.running = true;
        self.startup.broadcast();

        while !state.done {
            match self.wait.timedwait(&mut state, self.timeout, Some(&self.shutdown)) {
                WaitOutcome::Signalled | WaitOutcome::TimedOut => {}
                WaitOutcome::Interrupted => {
                    state.stats.interrupted_waits += 1;
                    tracing::debug!("{}: commit daemon wait interrupted", self.sb.name());
                }
            }
            if state.done {
                break;
            }
            self.scan_until_settled(&mut state);
        }

        state.running = false;
    }

    fn scan_until_settled(&self, state: &mut MutexGuard<'_, TxnmgrdState>) {
        loop {
            state.rescan = false;
            state.stats.scans += 1;
            match MutexGuard::unlocked(state, || self.commit_some_atoms()) {
                Ok(committed) => state.stats.atoms_committed += committed as u64,
                Err(e) => {
                    state.stats.failed_scans += 1;
                    tracing::warn!("{}: commit scan failed: {}", self.sb.name(), e);
                }
            }
            if !state.rescan {
                break;
            }
            state.stats.rescans += 1;
            tracing::trace!("{}: rescanning atoms", self.sb.name());
        }
    }

    fn commit_some_atoms(&self) -> Result<usize> {
        let ctx = init_context(&self.sb);
        let result = self.sb.txn_manager().commit_some_atoms();
        ctx.exit();
        result
    }
}
