//! Per-thread filesystem context
//!
//! A context says "this thread is inside a filesystem operation on this
//! volume". It carries the thread's transaction handle, its lock counters,
//! the blocks it has grabbed and the number of nodes it dirtied.
//!
//! Each thread owns a stack of slots. Entering a volume that already has
//! the top slot only bumps that context's child counter and shares its
//! transaction; entering a different volume, or entering on top of a
//! foreign scope, pushes a fresh top-level context that is popped again on
//! exit, which restores whatever was there before.
//!
//! Contexts are scoped by [`ContextGuard`] and must be left in LIFO order.
//!
//! ```ignore
//! let ctx = init_context(&sb);
//! let oid = oid::oid_allocate(&sb);
//! context::mark_dirty();
//! ctx.exit();
//! ```

use crate::debug::{self, LockCounters, LockSnapshot, ResultExt};
use crate::super_block::SuperBlock;
use crate::txn::TxnHandle;
use crate::{r4_assert, r4_panic, R4Error, Result};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::ThreadId;

#[cfg(feature = "debug")]
use crate::debug::ErrorSite;
#[cfg(feature = "debug")]
use crate::registry::{self, Registration};

thread_local! {
    static SLOTS: RefCell<Vec<Slot>> = const { RefCell::new(Vec::new()) };
}

enum Slot {
    Fs(Box<Context>),
    /// Another subsystem's use of the per-thread slot.
    Foreign(&'static str),
}

/// A scan cursor attached to the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tap {
    pub key: u64,
}

pub struct Context {
    tid: ThreadId,
    sb: Arc<SuperBlock>,
    txnh: Option<Box<dyn TxnHandle>>,
    nr_children: u32,
    grab_enabled: bool,
    grabbed_blocks: u64,
    taps: Vec<Tap>,
    nr_marked_dirty: u64,
    lock_counters: Arc<LockCounters>,
    /// Running inside a constrained writer path
    writeout: bool,
    /// This is the ent daemon's own context
    entd: bool,
    /// Skip throttling on exit
    nobalance: bool,
    sd_updates_delayed: u64,
    sd_updates_immediate: u64,
    #[cfg(feature = "debug")]
    first_error: Option<ErrorSite>,
    #[cfg(feature = "debug")]
    registration: Registration,
}

impl Context {
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn sb(&self) -> &Arc<SuperBlock> {
        &self.sb
    }

    pub fn nr_children(&self) -> u32 {
        self.nr_children
    }

    pub fn nr_marked_dirty(&self) -> u64 {
        self.nr_marked_dirty
    }

    pub fn grabbed_blocks(&self) -> u64 {
        self.grabbed_blocks
    }

    pub fn lock_counters(&self) -> &LockCounters {
        &self.lock_counters
    }

    pub fn is_entd(&self) -> bool {
        self.entd
    }

    pub fn set_entd(&mut self) {
        self.entd = true;
    }

    pub fn in_writeout(&self) -> bool {
        self.writeout
    }

    pub fn stat_data_updates(&self) -> (u64, u64) {
        (self.sd_updates_delayed, self.sd_updates_immediate)
    }

    /// The transaction handle of this context.
    pub fn txnh_mut(&mut self) -> &mut dyn TxnHandle {
        match self.txnh.as_deref_mut() {
            Some(txnh) => txnh,
            None => r4_panic!("context on {} has no transaction handle", self.sb.name()),
        }
    }

    #[cfg(feature = "debug")]
    pub(crate) fn record_error(&mut self, site: ErrorSite) {
        if self.first_error.is_none() {
            self.first_error = Some(site);
        }
    }

    #[cfg(feature = "debug")]
    pub fn first_error(&self) -> Option<ErrorSite> {
        self.first_error
    }

    #[cfg(feature = "debug")]
    pub fn registry_id(&self) -> u64 {
        self.registration.id()
    }
}

/// Scope of one `init_context`. Dropping it exits the context.
#[must_use = "dropping the guard exits the context immediately"]
pub struct ContextGuard {
    depth: usize,
    sb_id: u64,
    nested: bool,
    _not_send: PhantomData<*const ()>,
}

/// Enter a filesystem operation on `sb`.
///
/// Entering from an [`AtomicSection`](crate::debug::AtomicSection) is a
/// contract violation.
pub fn init_context(sb: &Arc<SuperBlock>) -> ContextGuard {
    r4_assert!(!debug::in_atomic(), "context entered from atomic section");

    let joined = SLOTS.with(|slots| {
        let mut slots = slots.borrow_mut();
        let depth = slots.len().checked_sub(1)?;
        match slots.last_mut() {
            Some(Slot::Fs(ctx)) if ctx.sb.id() == sb.id() => {
                ctx.nr_children += 1;
                Some(depth)
            }
            _ => None,
        }
    });
    if let Some(depth) = joined {
        return ContextGuard {
            depth,
            sb_id: sb.id(),
            nested: true,
            _not_send: PhantomData,
        };
    }

    let txnh = sb.txn_manager().begin();
    let lock_counters = Arc::new(LockCounters::new());
    let ctx = Context {
        tid: std::thread::current().id(),
        sb: Arc::clone(sb),
        txnh: Some(txnh),
        nr_children: 0,
        grab_enabled: true,
        grabbed_blocks: 0,
        taps: Vec::new(),
        nr_marked_dirty: 0,
        #[cfg(feature = "debug")]
        registration: registry::register(sb.name(), Arc::clone(&lock_counters)),
        lock_counters,
        writeout: false,
        entd: false,
        nobalance: false,
        sd_updates_delayed: 0,
        sd_updates_immediate: 0,
        #[cfg(feature = "debug")]
        first_error: None,
    };

    let depth = SLOTS.with(|slots| {
        let mut slots = slots.borrow_mut();
        slots.push(Slot::Fs(Box::new(ctx)));
        slots.len() - 1
    });
    tracing::trace!("entered context on {} at depth {}", sb.name(), depth);
    ContextGuard {
        depth,
        sb_id: sb.id(),
        nested: false,
        _not_send: PhantomData,
    }
}

impl ContextGuard {
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// Leave the context. Same as dropping the guard.
    pub fn exit(self) {
        drop(self)
    }

    fn leave(&self) {
        r4_assert!(debug::schedulable(), "exiting context with spinlocks held");
        if self.nested {
            self.leave_nested();
        } else {
            self.leave_top();
        }
    }

    fn leave_nested(&self) {
        with_slot(self.depth, self.sb_id, |ctx| {
            r4_assert!(
                ctx.nr_children > 0,
                "nested exit on {} without matching init",
                ctx.sb.name()
            );
            ctx.nr_children -= 1;
        });
    }

    fn leave_top(&self) {
        let (sb, nobalance, throttle) = with_slot(self.depth, self.sb_id, |ctx| {
            r4_assert!(
                ctx.nr_children == 0,
                "top-level exit on {} with {} nested contexts live",
                ctx.sb.name(),
                ctx.nr_children
            );
            let throttle = if ctx.nr_marked_dirty != 0 && !ctx.entd && !ctx.writeout {
                Some(ctx.nr_marked_dirty)
            } else {
                None
            };
            (Arc::clone(&ctx.sb), ctx.nobalance, throttle)
        });

        if !nobalance {
            let mut txnh = take_txnh(self.depth, self.sb_id);
            if let Err(e) = txnh.restart() {
                tracing::warn!("{}: transaction restart failed: {}", sb.name(), e);
            }
            put_txnh(self.depth, self.sb_id, txnh);
            if let Some(nr_dirtied) = throttle {
                tracing::trace!("{}: throttling after {} dirtied nodes", sb.name(), nr_dirtied);
                sb.page_cache().balance_dirty_pages(&sb, nr_dirtied);
            }
        }

        r4_assert!(debug::commit_check_locks(), "locks held across commit");
        let txnh = take_txnh(self.depth, self.sb_id);
        if let Err(e) = txnh.end() {
            tracing::warn!("{}: transaction end failed: {}", sb.name(), e);
        }

        let ctx = SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            r4_assert!(
                slots.len() == self.depth + 1,
                "context on {} exited out of order",
                sb.name()
            );
            match slots.pop() {
                Some(Slot::Fs(ctx)) => ctx,
                _ => r4_panic!("context slot on {} replaced", sb.name()),
            }
        });

        if ctx.grabbed_blocks != 0 {
            sb.release_grabbed(ctx.grabbed_blocks);
        }
        r4_assert!(
            ctx.lock_counters.no_counters_held(),
            "locks leaked at context exit: {}",
            ctx.lock_counters.snapshot()
        );
        r4_assert!(
            ctx.taps.is_empty(),
            "{} scan cursors left at context exit",
            ctx.taps.len()
        );
        #[cfg(feature = "debug")]
        if ctx.sd_updates_delayed != 0 || ctx.sd_updates_immediate != 0 {
            tracing::debug!(
                "{}: stat-data updates delayed={} immediate={}",
                sb.name(),
                ctx.sd_updates_delayed,
                ctx.sd_updates_immediate
            );
        }
        tracing::trace!("left context on {} at depth {}", sb.name(), self.depth);
    }

    /// Best-effort unwinding while the thread is already panicking.
    fn unwind(&self) {
        let _ = SLOTS.try_with(|slots| {
            let Ok(mut slots) = slots.try_borrow_mut() else {
                return;
            };
            if self.nested {
                if let Some(Slot::Fs(ctx)) = slots.get_mut(self.depth) {
                    ctx.nr_children = ctx.nr_children.saturating_sub(1);
                }
            } else if slots.len() > self.depth {
                slots.truncate(self.depth);
            }
        });
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.unwind();
        } else {
            self.leave();
        }
    }
}

fn with_slot<R>(depth: usize, sb_id: u64, f: impl FnOnce(&mut Context) -> R) -> R {
    SLOTS.with(|slots| {
        let mut slots = slots.borrow_mut();
        let top = slots.len().checked_sub(1);
        r4_assert!(top == Some(depth), "context exited out of order");
        match slots.get_mut(depth) {
            Some(Slot::Fs(ctx)) if ctx.sb.id() == sb_id => f(&mut **ctx),
            _ => r4_panic!("context slot {} does not belong to volume {}", depth, sb_id),
        }
    })
}

fn take_txnh(depth: usize, sb_id: u64) -> Box<dyn TxnHandle> {
    with_slot(depth, sb_id, |ctx| match ctx.txnh.take() {
        Some(txnh) => txnh,
        None => r4_panic!("context on {} lost its transaction handle", ctx.sb.name()),
    })
}

fn put_txnh(depth: usize, sb_id: u64, txnh: Box<dyn TxnHandle>) {
    with_slot(depth, sb_id, |ctx| ctx.txnh = Some(txnh));
}

/// A foreign subsystem's claim on the per-thread slot.
#[must_use]
pub struct ForeignScope {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

pub fn enter_foreign(tag: &'static str) -> ForeignScope {
    let depth = SLOTS.with(|slots| {
        let mut slots = slots.borrow_mut();
        slots.push(Slot::Foreign(tag));
        slots.len() - 1
    });
    ForeignScope {
        depth,
        _not_send: PhantomData,
    }
}

impl Drop for ForeignScope {
    fn drop(&mut self) {
        let _ = SLOTS.try_with(|slots| {
            let Ok(mut slots) = slots.try_borrow_mut() else {
                return;
            };
            let on_top = slots.len() == self.depth + 1;
            let tag = match slots.last() {
                Some(Slot::Foreign(tag)) if on_top => Some(*tag),
                _ => None,
            };
            if let Some(tag) = tag {
                tracing::trace!("left foreign scope {}", tag);
                slots.pop();
            } else if !std::thread::panicking() {
                r4_panic!("foreign scope exited out of order");
            }
        });
    }
}

/// True iff the innermost slot is a filesystem context.
pub fn is_in_context() -> bool {
    SLOTS.with(|slots| matches!(slots.borrow().last(), Some(Slot::Fs(_))))
}

/// Tag of the foreign scope on top of the slot stack, if that is what is there.
pub fn foreign_tag() -> Option<&'static str> {
    SLOTS.with(|slots| match slots.borrow().last() {
        Some(Slot::Foreign(tag)) => Some(*tag),
        _ => None,
    })
}

/// Number of slots (contexts and foreign scopes) on this thread.
pub fn depth() -> usize {
    SLOTS.with(|slots| slots.borrow().len())
}

/// Run `f` on the current context, if there is one.
///
/// `f` must not enter or leave contexts.
pub fn with_current<R>(f: impl FnOnce(&mut Context) -> R) -> Option<R> {
    SLOTS.with(|slots| match slots.borrow_mut().last_mut() {
        Some(Slot::Fs(ctx)) => Some(f(&mut **ctx)),
        _ => None,
    })
}

fn expect_current<R>(what: &str, f: impl FnOnce(&mut Context) -> R) -> R {
    match with_current(f) {
        Some(r) => r,
        None => r4_panic!("{} outside of a filesystem context", what),
    }
}

pub fn current_sb() -> Option<Arc<SuperBlock>> {
    with_current(|ctx| Arc::clone(&ctx.sb))
}

/// Note that a node was dirtied outside the normal write path.
pub fn mark_dirty() {
    expect_current("mark_dirty", |ctx| ctx.nr_marked_dirty += 1);
}

pub fn set_nobalance() {
    expect_current("set_nobalance", |ctx| ctx.nobalance = true);
}

pub fn mark_stat_data_update_delayed() {
    expect_current("stat-data update", |ctx| ctx.sd_updates_delayed += 1);
}

pub fn mark_stat_data_update_immediate() {
    expect_current("stat-data update", |ctx| ctx.sd_updates_immediate += 1);
}

/// Reserve `count` disk blocks for the current operation.
pub fn grab_space(count: u64) -> Result<()> {
    let granted = expect_current("grab_space", |ctx| {
        if !ctx.grab_enabled {
            return Err(R4Error::InvalidInput(format!(
                "{}: block grabbing disabled in this context",
                ctx.sb.name()
            )));
        }
        ctx.sb.grab_blocks(count)?;
        ctx.grabbed_blocks += count;
        Ok(())
    });
    granted.track()
}

/// Give back blocks grabbed earlier in this context.
pub fn release_space(count: u64) {
    expect_current("release_space", |ctx| {
        r4_assert!(
            ctx.grabbed_blocks >= count,
            "releasing {} blocks, context grabbed {}",
            count,
            ctx.grabbed_blocks
        );
        ctx.grabbed_blocks -= count;
        ctx.sb.release_grabbed(count);
    });
}

pub fn set_grab_enabled(enabled: bool) {
    expect_current("set_grab_enabled", |ctx| ctx.grab_enabled = enabled);
}

pub fn push_tap(tap: Tap) {
    expect_current("push_tap", |ctx| ctx.taps.push(tap));
}

pub fn pop_tap() -> Option<Tap> {
    expect_current("pop_tap", |ctx| ctx.taps.pop())
}

/// Marks the current context as running on a constrained writer path,
/// which suppresses throttling on exit.
#[must_use]
pub struct WriteoutGuard {
    previous: bool,
    _not_send: PhantomData<*const ()>,
}

pub fn set_writeout(writeout: bool) {
    expect_current("set_writeout", |ctx| ctx.writeout = writeout);
}

pub fn writeout_scope() -> WriteoutGuard {
    let previous = expect_current("writeout_scope", |ctx| std::mem::replace(&mut ctx.writeout, true));
    WriteoutGuard {
        previous,
        _not_send: PhantomData,
    }
}

impl Drop for WriteoutGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        let _ = SLOTS.try_with(|slots| {
            if let Ok(mut slots) = slots.try_borrow_mut() {
                if let Some(Slot::Fs(ctx)) = slots.last_mut() {
                    ctx.writeout = previous;
                }
            }
        });
    }
}

/// Read the current context's lock counters without insisting on the slot
/// borrow; `None` outside a context or while the slot stack is busy.
pub(crate) fn try_with_current_counters<R>(f: impl FnOnce(&LockCounters) -> R) -> Option<R> {
    SLOTS
        .try_with(|slots| {
            let slots = slots.try_borrow().ok()?;
            match slots.last() {
                Some(Slot::Fs(ctx)) => Some(f(&ctx.lock_counters)),
                _ => None,
            }
        })
        .ok()
        .flatten()
}

pub(crate) fn try_current_lock_snapshot() -> Option<LockSnapshot> {
    try_with_current_counters(LockCounters::snapshot)
}

#[cfg(feature = "debug")]
pub(crate) fn try_first_error() -> Option<ErrorSite> {
    SLOTS
        .try_with(|slots| {
            let slots = slots.try_borrow().ok()?;
            match slots.last() {
                Some(Slot::Fs(ctx)) => ctx.first_error,
                _ => None,
            }
        })
        .ok()
        .flatten()
}
