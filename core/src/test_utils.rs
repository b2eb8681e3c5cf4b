/// In-memory collaborators for exercising contexts and daemons without a
/// real transaction manager or page cache
use crate::config::VolumeConfig;
use crate::page::{Page, PageCache};
use crate::super_block::SuperBlock;
use crate::txn::{FlushFlags, TxnHandle, TxnManager, WritebackControl};
use crate::{R4Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Free blocks given to volumes built by [`mock_super_block`].
pub const MOCK_FREE_BLOCKS: u64 = 1 << 20;

type Hook = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockTxnStats {
    pub begins: u64,
    pub restarts: u64,
    pub ends: u64,
    pub commit_calls: u64,
    pub flush_calls: u64,
    pub oids_allocated: u64,
    pub oids_released: u64,
}

/// Mock transaction manager - counts every call, commits nothing
#[derive(Default)]
pub struct MockTxnManager {
    stats: Arc<Mutex<MockTxnStats>>,
    blocks_per_flush: AtomicU64,
    fail_flush: AtomicBool,
    fail_commit: AtomicBool,
    on_commit: Mutex<Option<Hook>>,
    on_flush: Mutex<Option<Hook>>,
}

impl MockTxnManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flush_failure() -> Self {
        let mgr = Self::new();
        mgr.set_flush_failure(true);
        mgr
    }

    pub fn stats(&self) -> MockTxnStats {
        self.stats.lock().clone()
    }

    pub fn set_blocks_per_flush(&self, blocks: u64) {
        self.blocks_per_flush.store(blocks, Ordering::Relaxed);
    }

    pub fn set_flush_failure(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::Relaxed);
    }

    pub fn set_commit_failure(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::Relaxed);
    }

    /// Run `hook` at the start of every `commit_some_atoms` call.
    pub fn on_commit(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_commit.lock() = Some(Box::new(hook));
    }

    /// Run `hook` at the start of every `flush_some_atom` call.
    pub fn on_flush(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_flush.lock() = Some(Box::new(hook));
    }
}

impl TxnManager for MockTxnManager {
    fn begin(&self) -> Box<dyn TxnHandle> {
        self.stats.lock().begins += 1;
        Box::new(MockTxnHandle {
            stats: Arc::clone(&self.stats),
        })
    }

    fn commit_some_atoms(&self) -> Result<usize> {
        if let Some(hook) = self.on_commit.lock().as_ref() {
            hook();
        }
        self.stats.lock().commit_calls += 1;
        if self.fail_commit.load(Ordering::Relaxed) {
            return Err(R4Error::Transaction("mock commit failure".to_string()));
        }
        Ok(0)
    }

    fn flush_some_atom(&self, wbc: &mut WritebackControl, _flags: FlushFlags) -> Result<usize> {
        if let Some(hook) = self.on_flush.lock().as_ref() {
            hook();
        }
        self.stats.lock().flush_calls += 1;
        if self.fail_flush.load(Ordering::Relaxed) {
            return Err(R4Error::Flush("mock flush failure".to_string()));
        }
        let blocks = self.blocks_per_flush.load(Ordering::Relaxed);
        wbc.nr_to_write -= blocks as i64;
        Ok(blocks as usize)
    }
}

/// Handle handed out by [`MockTxnManager::begin`]
pub struct MockTxnHandle {
    stats: Arc<Mutex<MockTxnStats>>,
}

impl TxnHandle for MockTxnHandle {
    fn restart(&mut self) -> Result<()> {
        self.stats.lock().restarts += 1;
        Ok(())
    }

    fn end(self: Box<Self>) -> Result<()> {
        self.stats.lock().ends += 1;
        Ok(())
    }

    fn note_oid_allocated(&mut self) {
        self.stats.lock().oids_allocated += 1;
    }

    fn note_oid_released(&mut self) {
        self.stats.lock().oids_released += 1;
    }
}

/// Mock page - just flags
#[derive(Debug, Default)]
pub struct MockPage {
    index: u64,
    dirty: AtomicBool,
    locked: AtomicBool,
    reclaim: AtomicBool,
    active: AtomicBool,
}

impl MockPage {
    /// A locked, clean, inactive page, as handed to a writepage path.
    pub fn new(index: u64) -> Arc<Self> {
        Arc::new(Self {
            index,
            locked: AtomicBool::new(true),
            ..Self::default()
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn is_reclaim(&self) -> bool {
        self.reclaim.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }
}

impl Page for MockPage {
    fn index(&self) -> u64 {
        self.index
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Relaxed);
    }

    fn set_reclaim(&self) {
        self.reclaim.store(true, Ordering::Relaxed);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockPageCacheStats {
    pub capture_calls: u64,
    pub balance_calls: u64,
    pub balanced_nodes: u64,
}

/// Mock page cache - records captures and throttling requests
#[derive(Default)]
pub struct MockPageCache {
    stats: Mutex<MockPageCacheStats>,
    on_balance: Mutex<Option<Hook>>,
}

impl MockPageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MockPageCacheStats {
        self.stats.lock().clone()
    }

    /// Run `hook` from inside `balance_dirty_pages`.
    pub fn on_balance(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_balance.lock() = Some(Box::new(hook));
    }
}

impl PageCache for MockPageCache {
    fn capture_anonymous_pages(&self, _sb: &SuperBlock, _wbc: &mut WritebackControl) -> Result<usize> {
        self.stats.lock().capture_calls += 1;
        Ok(0)
    }

    fn balance_dirty_pages(&self, _sb: &Arc<SuperBlock>, nr_dirtied: u64) {
        {
            let mut stats = self.stats.lock();
            stats.balance_calls += 1;
            stats.balanced_nodes += nr_dirtied;
        }
        if let Some(hook) = self.on_balance.lock().as_ref() {
            hook();
        }
    }
}

pub fn mock_super_block(name: &str) -> (Arc<SuperBlock>, Arc<MockTxnManager>, Arc<MockPageCache>) {
    mock_super_block_with(name, VolumeConfig::default())
}

pub fn mock_super_block_with(
    name: &str,
    config: VolumeConfig,
) -> (Arc<SuperBlock>, Arc<MockTxnManager>, Arc<MockPageCache>) {
    let txn = Arc::new(MockTxnManager::new());
    let cache = Arc::new(MockPageCache::new());
    let sb = SuperBlock::new(
        name,
        config,
        Arc::clone(&txn) as Arc<dyn TxnManager>,
        Arc::clone(&cache) as Arc<dyn PageCache>,
        MOCK_FREE_BLOCKS,
    );
    (sb, txn, cache)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_handle_reports_to_manager() {
        let mgr = MockTxnManager::new();
        let mut handle = mgr.begin();
        handle.restart().unwrap();
        handle.note_oid_allocated();
        handle.end().unwrap();

        let stats = mgr.stats();
        assert_eq!(stats.begins, 1);
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.ends, 1);
        assert_eq!(stats.oids_allocated, 1);
    }

    #[test]
    fn test_mock_flush_failure() {
        let mgr = MockTxnManager::with_flush_failure();
        let mut wbc = WritebackControl::new(8);
        assert!(mgr.flush_some_atom(&mut wbc, FlushFlags::WRITE_BLOCKS).is_err());

        mgr.set_flush_failure(false);
        mgr.set_blocks_per_flush(3);
        assert_eq!(mgr.flush_some_atom(&mut wbc, FlushFlags::WRITE_BLOCKS).unwrap(), 3);
        assert_eq!(wbc.nr_to_write, 5);
        assert_eq!(mgr.stats().flush_calls, 2);
    }

    #[test]
    fn test_mock_page_flags() {
        let page = MockPage::new(7);
        assert!(page.is_locked());
        assert!(!page.is_dirty());
        page.mark_dirty();
        page.unlock();
        assert!(page.is_dirty());
        assert!(!page.is_locked());
        assert_eq!(page.index(), 7);
    }
}
