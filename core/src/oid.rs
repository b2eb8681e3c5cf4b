//! Object-id allocator
//!
//! Ids are handed out from a single monotonic counter kept in the super
//! block; released ids are never reused, only the in-use count shrinks.
//! Exhaustion is reported by returning the volume's sentinel
//! (`config.oid.max_oid`), which callers must compare against.

use crate::context;
use crate::super_block::SuperBlock;
use crate::{R4Error, Result};

/// The "allocator exhausted" value of this volume.
pub fn oid_sentinel(sb: &SuperBlock) -> u64 {
    sb.config().oid.max_oid
}

/// Load the counters recovered from disk.
pub fn oid_init_allocator(sb: &SuperBlock, nr_files: u64, next: u64) -> Result<()> {
    let sentinel = oid_sentinel(sb);
    if next > sentinel {
        return Err(R4Error::InvalidInput(format!(
            "{}: recovered next oid {} beyond {}",
            sb.name(),
            next,
            sentinel
        )));
    }
    let mut counters = sb.counters();
    counters.oids_in_use = nr_files;
    counters.next_oid = next;
    tracing::debug!("{}: oid allocator at {} with {} in use", sb.name(), next, nr_files);
    Ok(())
}

pub fn oid_allocate(sb: &SuperBlock) -> u64 {
    let sentinel = oid_sentinel(sb);
    let mut counters = sb.counters();
    if counters.next_oid == sentinel {
        return sentinel;
    }
    let oid = counters.next_oid;
    counters.next_oid += 1;
    counters.oids_in_use += 1;
    oid
}

pub fn oid_release(sb: &SuperBlock, _oid: u64) {
    let mut counters = sb.counters();
    crate::r4_assert!(counters.oids_in_use > 0, "{}: oid released with none in use", sb.name());
    counters.oids_in_use -= 1;
}

/// The id the next allocation would return.
pub fn oid_next(sb: &SuperBlock) -> u64 {
    sb.counters().next_oid
}

pub fn oids_used(sb: &SuperBlock) -> u64 {
    sb.counters().oids_in_use
}

pub fn oids_free(sb: &SuperBlock) -> u64 {
    let oid = &sb.config().oid;
    let next = sb.counters().next_oid;
    oid.max_oid
        .saturating_sub(oid.reserved_oids)
        .saturating_sub(next)
}

/// Attribute one object creation to the current transaction.
pub fn oid_count_allocated() {
    if context::with_current(|ctx| ctx.txnh_mut().note_oid_allocated()).is_none() {
        crate::r4_panic!("oid accounting outside of a filesystem context");
    }
}

/// Attribute one object deletion to the current transaction.
pub fn oid_count_released() {
    if context::with_current(|ctx| ctx.txnh_mut().note_oid_released()).is_none() {
        crate::r4_panic!("oid accounting outside of a filesystem context");
    }
}
