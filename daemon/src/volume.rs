//! Mount-time glue: builds the super block, loads the object-id counters
//! recovered from disk and runs both daemons for the lifetime of the volume.

use crate::entd::{Entd, EntdStats};
use crate::ktxnmgrd::{Ktxnmgrd, TxnmgrdStats};
use r4_core::oid;
use r4_core::{MountOptions, PageCache, Result, SuperBlock, TxnManager};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub name: String,
    pub next_oid: u64,
    pub oids_used: u64,
    pub oids_free: u64,
    pub free_blocks: u64,
    pub entd: EntdStats,
    pub ktxnmgrd: TxnmgrdStats,
}

pub struct Volume {
    sb: Arc<SuperBlock>,
    entd: Entd,
    ktxnmgrd: Ktxnmgrd,
    mounted: AtomicBool,
}

impl Volume {
    pub fn mount(
        txn_mgr: Arc<dyn TxnManager>,
        page_cache: Arc<dyn PageCache>,
        options: MountOptions,
    ) -> Result<Self> {
        options.config.validate()?;
        let sb = SuperBlock::new(
            options.name,
            options.config,
            txn_mgr,
            page_cache,
            options.free_blocks,
        );
        oid::oid_init_allocator(&sb, options.recovered_oids_used, options.recovered_next_oid)?;

        // Entd is stopped by its Drop if the commit daemon fails to start.
        let entd = Entd::start(&sb)?;
        let ktxnmgrd = Ktxnmgrd::start(&sb)?;

        tracing::info!("{}: mounted", sb.name());
        Ok(Self {
            sb,
            entd,
            ktxnmgrd,
            mounted: AtomicBool::new(true),
        })
    }

    pub fn sb(&self) -> &Arc<SuperBlock> {
        &self.sb
    }

    pub fn entd(&self) -> &Entd {
        &self.entd
    }

    pub fn ktxnmgrd(&self) -> &Ktxnmgrd {
        &self.ktxnmgrd
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> VolumeStats {
        VolumeStats {
            name: self.sb.name().to_string(),
            next_oid: oid::oid_next(&self.sb),
            oids_used: oid::oids_used(&self.sb),
            oids_free: oid::oids_free(&self.sb),
            free_blocks: self.sb.free_blocks(),
            entd: self.entd.stats(),
            ktxnmgrd: self.ktxnmgrd.stats(),
        }
    }

    /// Stop the commit daemon, then the ent daemon. Idempotent.
    pub fn unmount(&self) {
        if !self.mounted.swap(false, Ordering::AcqRel) {
            return;
        }
        self.ktxnmgrd.stop();
        self.entd.stop();
        tracing::info!("{}: unmounted", self.sb.name());
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r4_core::config::VolumeConfig;
    use r4_core::test_utils::{MockPageCache, MockTxnManager};
    use r4_core::R4Error;

    fn collaborators() -> (Arc<MockTxnManager>, Arc<MockPageCache>) {
        (Arc::new(MockTxnManager::new()), Arc::new(MockPageCache::new()))
    }

    #[test]
    fn test_mount_loads_recovered_counters() {
        let (txn, cache) = collaborators();
        let options = MountOptions {
            name: "vol-recovered".to_string(),
            recovered_oids_used: 40,
            recovered_next_oid: 1000,
            ..MountOptions::default()
        };
        let volume = Volume::mount(txn, cache, options).unwrap();
        assert!(volume.is_mounted());
        assert!(volume.entd().is_running());
        assert!(volume.ktxnmgrd().is_running());

        let stats = volume.stats();
        assert_eq!(stats.next_oid, 1000);
        assert_eq!(stats.oids_used, 40);

        volume.unmount();
        assert!(!volume.is_mounted());
        assert!(!volume.entd().is_running());
        assert!(!volume.ktxnmgrd().is_running());
    }

    #[test]
    fn test_mount_rejects_invalid_config() {
        let (txn, cache) = collaborators();
        let mut config = VolumeConfig::default();
        config.ktxnmgrd.timeout_ms = 0;
        let options = MountOptions {
            config,
            ..MountOptions::default()
        };
        assert!(matches!(
            Volume::mount(txn, cache, options),
            Err(R4Error::Configuration(_))
        ));
    }

    #[test]
    fn test_mount_rejects_bad_recovered_oid() {
        let (txn, cache) = collaborators();
        let mut config = VolumeConfig::default();
        config.oid.max_oid = 100;
        config.oid.reserved_oids = 0;
        let options = MountOptions {
            config,
            recovered_next_oid: 101,
            ..MountOptions::default()
        };
        assert!(matches!(
            Volume::mount(txn, cache, options),
            Err(R4Error::InvalidInput(_))
        ));
    }
}
