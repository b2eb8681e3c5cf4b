//! Interfaces consumed from the transaction manager.
//!
//! The atom machinery itself (capture, flush, commit write-out) lives
//! outside this crate; contexts and daemons only drive it through these
//! traits.

use crate::Result;
use serde::{Deserialize, Serialize};

/// Write-back control descriptor passed down the page write-out path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritebackControl {
    /// Pages still wanted; decremented by whoever writes
    pub nr_to_write: i64,
    pub for_reclaim: bool,
}

impl WritebackControl {
    pub fn new(nr_to_write: i64) -> Self {
        Self {
            nr_to_write,
            for_reclaim: false,
        }
    }

    pub fn for_reclaim(nr_to_write: i64) -> Self {
        Self {
            for_reclaim: true,
            ..Self::new(nr_to_write)
        }
    }
}

impl Default for WritebackControl {
    fn default() -> Self {
        Self::new(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushFlags {
    /// Submit the flushed blocks for I/O
    pub write_blocks: bool,
}

impl FlushFlags {
    pub const WRITE_BLOCKS: FlushFlags = FlushFlags {
        write_blocks: true,
    };
}

/// A thread's handle on the atom it is currently joined to.
pub trait TxnHandle: Send {
    /// Close the current atom association and open a fresh one.
    fn restart(&mut self) -> Result<()>;

    /// Close the handle, letting its atom proceed towards commit.
    fn end(self: Box<Self>) -> Result<()>;

    /// An object id was handed out inside this atom.
    fn note_oid_allocated(&mut self);

    /// An object id was given back inside this atom.
    fn note_oid_released(&mut self);
}

pub trait TxnManager: Send + Sync {
    fn begin(&self) -> Box<dyn TxnHandle>;

    /// Commit whatever atoms are eligible by the manager's own age/size policy.
    /// Returns the number of atoms committed.
    fn commit_some_atoms(&self) -> Result<usize>;

    /// Flush one atom's worth of dirty state. Returns the number of blocks submitted.
    fn flush_some_atom(&self, wbc: &mut WritebackControl, flags: FlushFlags) -> Result<usize>;
}
