//! Per-volume shared state.
//!
//! `guard` plays the part of the super block spinlock: it serialises the
//! object-id counters together with the free/grabbed block counters.

use crate::config::VolumeConfig;
use crate::page::PageCache;
use crate::txn::TxnManager;
use crate::{R4Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_VOLUME_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuperCounters {
    pub blocks_free: u64,
    pub blocks_grabbed: u64,
    pub next_oid: u64,
    pub oids_in_use: u64,
}

pub struct SuperBlock {
    id: u64,
    name: String,
    config: VolumeConfig,
    txn_mgr: Arc<dyn TxnManager>,
    page_cache: Arc<dyn PageCache>,
    guard: Mutex<SuperCounters>,
}

impl SuperBlock {
    pub fn new(
        name: impl Into<String>,
        config: VolumeConfig,
        txn_mgr: Arc<dyn TxnManager>,
        page_cache: Arc<dyn PageCache>,
        free_blocks: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_VOLUME_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            config,
            txn_mgr,
            page_cache,
            guard: Mutex::new(SuperCounters {
                blocks_free: free_blocks,
                ..SuperCounters::default()
            }),
        })
    }

    /// Unique per super block; identifies the volume for context nesting.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn txn_manager(&self) -> &Arc<dyn TxnManager> {
        &self.txn_mgr
    }

    pub fn page_cache(&self) -> &Arc<dyn PageCache> {
        &self.page_cache
    }

    pub(crate) fn counters(&self) -> MutexGuard<'_, SuperCounters> {
        self.guard.lock()
    }

    pub fn snapshot(&self) -> SuperCounters {
        *self.guard.lock()
    }

    pub fn free_blocks(&self) -> u64 {
        self.guard.lock().blocks_free
    }

    pub fn grabbed_blocks(&self) -> u64 {
        self.guard.lock().blocks_grabbed
    }

    pub(crate) fn grab_blocks(&self, count: u64) -> Result<()> {
        let mut counters = self.guard.lock();
        if counters.blocks_free < count {
            return Err(R4Error::NoSpace(format!(
                "{}: wanted {} blocks, {} free",
                self.name, count, counters.blocks_free
            )));
        }
        counters.blocks_free -= count;
        counters.blocks_grabbed += count;
        Ok(())
    }

    pub(crate) fn release_grabbed(&self, count: u64) {
        let mut counters = self.guard.lock();
        crate::r4_assert!(
            counters.blocks_grabbed >= count,
            "{}: releasing {} grabbed blocks, only {} grabbed",
            self.name,
            count,
            counters.blocks_grabbed
        );
        counters.blocks_grabbed -= count;
        counters.blocks_free += count;
    }
}

impl fmt::Debug for SuperBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuperBlock")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("counters", &self.snapshot())
            .finish()
    }
}
