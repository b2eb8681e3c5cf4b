//! Interfaces consumed from the page cache.

use crate::super_block::SuperBlock;
use crate::txn::WritebackControl;
use crate::Result;
use std::sync::Arc;

pub trait Page: Send + Sync {
    fn index(&self) -> u64;
    fn mark_dirty(&self);
    fn unlock(&self);
    /// Ask reclaim to drop the page as soon as its write-back finishes.
    fn set_reclaim(&self);
    fn is_active(&self) -> bool;
}

pub trait PageCache: Send + Sync {
    /// Pull pages dirtied outside any transaction handle into the current atom.
    fn capture_anonymous_pages(&self, sb: &SuperBlock, wbc: &mut WritebackControl) -> Result<usize>;

    /// Throttle the calling thread after it dirtied `nr_dirtied` nodes.
    fn balance_dirty_pages(&self, sb: &Arc<SuperBlock>, nr_dirtied: u64);
}
