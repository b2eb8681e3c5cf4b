use thiserror::Error;

/// Kernel-style error codes reported by [`R4Error::errno`].
pub const EIO: i32 = 5;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EINVAL: i32 = 22;
pub const ENOSPC: i32 = 28;

#[derive(Debug, Error)]
pub enum R4Error {
    #[error("No space left: {0}")]
    NoSpace(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Flush failed: {0}")]
    Flush(String),

    #[error("Daemon not running: {0}")]
    DaemonNotRunning(String),

    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl R4Error {
    /// Negative errno equivalent, used when recording where an error chain started.
    pub fn errno(&self) -> i32 {
        let code = match self {
            R4Error::ThreadSpawn(_) => ENOMEM,
            R4Error::NoSpace(_) => ENOSPC,
            R4Error::Transaction(_) | R4Error::Flush(_) | R4Error::IoError(_) => EIO,
            R4Error::DaemonNotRunning(_) => EAGAIN,
            R4Error::Configuration(_)
            | R4Error::InvalidInput(_)
            | R4Error::SerializationError(_)
            | R4Error::Other(_) => EINVAL,
        };
        -code
    }
}

pub type Result<T> = std::result::Result<T, R4Error>;
