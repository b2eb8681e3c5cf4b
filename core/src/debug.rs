//! Panic formatting and lock accounting
//!
//! Every context carries a set of per-class lock counters. The locking
//! wrappers of the tree, atom and inode code bump them through
//! [`lock_acquired`] and [`lock_released`]; the context code consults them
//! to catch sleeping with a spinlock held and leaking locks past a commit.
//!
//! Contract violations go through [`r4_panic!`](crate::r4_panic), which
//! dumps the current lock counters (and, with the `debug` feature, every
//! live context) before unwinding.

use crate::context;
use crate::R4Error;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cell::Cell;
use std::fmt::{self, Write as _};
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::atomic::{AtomicU32, Ordering};

/// Panic messages are truncated to this many bytes.
pub const PANIC_BUF_SIZE: usize = 1024;

#[macro_export]
macro_rules! r4_panic {
    ($($arg:tt)*) => {
        $crate::debug::panic_fmt(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! r4_assert {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::r4_panic!(
                "assertion failed: {}: {}",
                stringify!($cond),
                format_args!($($arg)*)
            );
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockClass {
    JnodeSpin,
    TreeSpin,
    DkSpin,
    TxnhSpin,
    AtomSpin,
    StackSpin,
    TxnmgrSpin,
    KtxnmgrdSpin,
    FqSpin,
    InodeSpin,
    SuperSpin,
    EntdSpin,
    TreeRead,
    TreeWrite,
    DkRead,
    DkWrite,
    LongTermZnode,
    InodeSemRead,
    InodeSemWrite,
    DRef,
    XRef,
    TRef,
}

impl LockClass {
    pub const COUNT: usize = 22;

    pub const ALL: [LockClass; LockClass::COUNT] = [
        LockClass::JnodeSpin,
        LockClass::TreeSpin,
        LockClass::DkSpin,
        LockClass::TxnhSpin,
        LockClass::AtomSpin,
        LockClass::StackSpin,
        LockClass::TxnmgrSpin,
        LockClass::KtxnmgrdSpin,
        LockClass::FqSpin,
        LockClass::InodeSpin,
        LockClass::SuperSpin,
        LockClass::EntdSpin,
        LockClass::TreeRead,
        LockClass::TreeWrite,
        LockClass::DkRead,
        LockClass::DkWrite,
        LockClass::LongTermZnode,
        LockClass::InodeSemRead,
        LockClass::InodeSemWrite,
        LockClass::DRef,
        LockClass::XRef,
        LockClass::TRef,
    ];

    /// Spinning locks, including the read/write spinlocks on tree and dk.
    pub fn is_spin(self) -> bool {
        !matches!(
            self,
            LockClass::LongTermZnode
                | LockClass::InodeSemRead
                | LockClass::InodeSemWrite
                | LockClass::DRef
                | LockClass::XRef
                | LockClass::TRef
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            LockClass::JnodeSpin => "spin_locked_jnode",
            LockClass::TreeSpin => "spin_locked_tree",
            LockClass::DkSpin => "spin_locked_dk",
            LockClass::TxnhSpin => "spin_locked_txnh",
            LockClass::AtomSpin => "spin_locked_atom",
            LockClass::StackSpin => "spin_locked_stack",
            LockClass::TxnmgrSpin => "spin_locked_txnmgr",
            LockClass::KtxnmgrdSpin => "spin_locked_ktxnmgrd",
            LockClass::FqSpin => "spin_locked_fq",
            LockClass::InodeSpin => "spin_locked_inode",
            LockClass::SuperSpin => "spin_locked_super",
            LockClass::EntdSpin => "spin_locked_entd",
            LockClass::TreeRead => "read_locked_tree",
            LockClass::TreeWrite => "write_locked_tree",
            LockClass::DkRead => "read_locked_dk",
            LockClass::DkWrite => "write_locked_dk",
            LockClass::LongTermZnode => "long_term_locked_znode",
            LockClass::InodeSemRead => "inode_sem_r",
            LockClass::InodeSemWrite => "inode_sem_w",
            LockClass::DRef => "d_refs",
            LockClass::XRef => "x_refs",
            LockClass::TRef => "t_refs",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Per-context lock counters.
///
/// Only the owning thread writes; the live-context registry reads them
/// for diagnostics, hence the atomics.
#[derive(Debug, Default)]
pub struct LockCounters {
    counts: [AtomicU32; LockClass::COUNT],
}

impl LockCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, class: LockClass) {
        self.counts[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn release(&self, class: LockClass) {
        let slot = &self.counts[class.index()];
        let held = slot.load(Ordering::Relaxed);
        crate::r4_assert!(held > 0, "{} released more often than acquired", class.name());
        slot.store(held - 1, Ordering::Relaxed);
    }

    pub fn count(&self, class: LockClass) -> u32 {
        self.counts[class.index()].load(Ordering::Relaxed)
    }

    /// No spinlock-class counter is held.
    pub fn schedulable(&self) -> bool {
        LockClass::ALL
            .iter()
            .filter(|class| class.is_spin())
            .all(|&class| self.count(class) == 0)
    }

    pub fn no_counters_held(&self) -> bool {
        self.all_zero_except(&[])
    }

    /// Like [`LockCounters::no_counters_held`] but tolerates the inode
    /// reader/writer semaphore, which may span a commit.
    pub fn commit_check_locks(&self) -> bool {
        self.all_zero_except(&[LockClass::InodeSemRead, LockClass::InodeSemWrite])
    }

    fn all_zero_except(&self, allowed: &[LockClass]) -> bool {
        LockClass::ALL
            .iter()
            .filter(|class| !allowed.contains(class))
            .all(|&class| self.count(class) == 0)
    }

    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            held: LockClass::ALL
                .iter()
                .map(|&class| (class, self.count(class)))
                .filter(|(_, count)| *count != 0)
                .collect(),
        }
    }
}

/// Non-zero counters at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSnapshot {
    pub held: Vec<(LockClass, u32)>,
}

impl fmt::Display for LockSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.held.is_empty() {
            return write!(f, "no locks held");
        }
        for (i, (class, count)) in self.held.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", class.name(), count)?;
        }
        Ok(())
    }
}

/// Record that the current thread took a lock of `class`.
pub fn lock_acquired(class: LockClass) {
    context::with_current(|ctx| ctx.lock_counters().acquire(class));
}

pub fn lock_released(class: LockClass) {
    context::with_current(|ctx| ctx.lock_counters().release(class));
}

/// True outside any context, or when no spinlock is counted as held.
pub fn schedulable() -> bool {
    context::try_with_current_counters(LockCounters::schedulable).unwrap_or(true)
}

/// Called on entry to anything that can put the thread to sleep.
#[track_caller]
pub fn might_sleep() {
    if !schedulable() {
        let location = Location::caller();
        crate::r4_panic!(
            "sleeping with spinlocks held at {}:{}",
            location.file(),
            location.line()
        );
    }
}

pub fn no_counters_held() -> bool {
    context::with_current(|ctx| ctx.lock_counters().no_counters_held()).unwrap_or(true)
}

pub fn commit_check_locks() -> bool {
    context::with_current(|ctx| ctx.lock_counters().commit_check_locks()).unwrap_or(true)
}

thread_local! {
    static ATOMIC_DEPTH: Cell<u32> = const { Cell::new(0) };
    static PANICKING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running in interrupt-like context.
/// Entering a filesystem context inside one is a contract violation.
pub struct AtomicSection {
    _not_send: PhantomData<*const ()>,
}

impl AtomicSection {
    pub fn enter() -> Self {
        ATOMIC_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for AtomicSection {
    fn drop(&mut self) {
        ATOMIC_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

pub fn in_atomic() -> bool {
    ATOMIC_DEPTH.with(|depth| depth.get() > 0)
}

/// Where the first error of the current call chain was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorSite {
    pub code: i32,
    pub file: &'static str,
    pub line: u32,
}

impl fmt::Display for ErrorSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.code, self.file, self.line)
    }
}

pub trait ResultExt {
    /// Record the caller's location in the current context if this is an error.
    fn track(self) -> Self;
}

impl<T> ResultExt for std::result::Result<T, R4Error> {
    #[track_caller]
    fn track(self) -> Self {
        if let Err(ref err) = self {
            record_error(err.errno(), Location::caller());
        }
        self
    }
}

#[cfg(feature = "debug")]
fn record_error(code: i32, location: &'static Location<'static>) {
    context::with_current(|ctx| {
        ctx.record_error(ErrorSite {
            code,
            file: location.file(),
            line: location.line(),
        })
    });
}

#[cfg(not(feature = "debug"))]
fn record_error(_code: i32, _location: &'static Location<'static>) {}

static PANIC_BUF: Lazy<Mutex<String>> = Lazy::new(|| Mutex::new(String::with_capacity(PANIC_BUF_SIZE)));

/// Format, dump diagnostics, and unwind. Never returns.
#[cold]
pub fn panic_fmt(args: fmt::Arguments<'_>) -> ! {
    if PANICKING.with(|flag| flag.replace(true)) {
        // Panicked while producing diagnostics: skip straight to the stop.
        panic!("r4 panic (recursive): {}", args);
    }

    let message = {
        let mut buf = PANIC_BUF.lock();
        buf.clear();
        let _ = write!(buf, "{}", args);
        if buf.len() > PANIC_BUF_SIZE {
            let mut end = PANIC_BUF_SIZE;
            while !buf.is_char_boundary(end) {
                end -= 1;
            }
            buf.truncate(end);
        }
        buf.clone()
    };

    tracing::error!("r4 panic: {}", message);
    if let Some(snapshot) = context::try_current_lock_snapshot() {
        tracing::error!("lock counters: {}", snapshot);
    }
    #[cfg(feature = "debug")]
    {
        if let Some(site) = context::try_first_error() {
            tracing::error!("first error: {}", site);
        }
        for line in crate::registry::dump_contexts() {
            tracing::error!("live context: {}", line);
        }
    }

    PANICKING.with(|flag| flag.set(false));
    panic!("r4 panic: {}", message);
}
