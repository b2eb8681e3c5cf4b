pub mod completion;
pub mod config;
pub mod context;
pub mod debug;
pub mod error;
pub mod kcond;
pub mod oid;
pub mod page;
#[cfg(feature = "debug")]
pub mod registry;
pub mod super_block;
pub mod test_utils;
pub mod txn;

pub use completion::Completion;
pub use config::{EntdConfig, MountOptions, OidConfig, TxnmgrdConfig, VolumeConfig};
pub use context::{init_context, is_in_context, ContextGuard};
pub use debug::{AtomicSection, LockClass, ResultExt};
pub use error::{R4Error, Result};
pub use kcond::{CancelToken, KCond, WaitOutcome};
pub use page::{Page, PageCache};
pub use super_block::SuperBlock;
pub use txn::{FlushFlags, TxnHandle, TxnManager, WritebackControl};
