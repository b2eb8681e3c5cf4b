pub mod entd;
pub mod ktxnmgrd;
pub mod volume;

pub use entd::{Entd, EntdStats, FlushGuard, Submission};
pub use ktxnmgrd::{Ktxnmgrd, TxnmgrdStats};
pub use volume::{Volume, VolumeStats};
