mod db;
mod memory;

pub use db::Db;
pub use memory::Memory;

use bytes::Bytes;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error as ThisError;

/// The storage engine as seen by the connection pipeline.
///
/// Implementations are shared by every connection, so all operations must be safe to call
/// concurrently. Each `put` and `get` is atomic from the caller's point of view.
pub trait Storage: Send + Sync {
    /// Stores `value` under `key` unless the key already holds a live value, in which case
    /// `Error::KeyExists` is returned and nothing is written.
    fn put(&self, key: Bytes, value: Bytes) -> Result<(), Error>;

    /// Returns the live value for `key` or `Error::KeyNotFound`.
    fn get(&self, key: &[u8]) -> Result<(Bytes, Meta), Error>;

    fn info(&self) -> Info;

    /// Flushes and releases the storage. Calling it more than once is not an error.
    fn close(&self) -> Result<(), Error>;
}

pub type SharedStorage = Arc<dyn Storage>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("key already exists")]
    KeyExists,
    #[error("key does not exist")]
    KeyNotFound,
    #[error("database is closed")]
    Closed,
    /// The on-disk state may no longer be consistent. Nothing else should be written.
    #[error("fatal database error: {0}")]
    Fatal(String),
    #[error("corrupt chunk {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

/// Metadata kept alongside a value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Meta {
    pub written_at: SystemTime,
}

/// Point-in-time counters describing the storage layout.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Info {
    /// Sealed chunks that are only read from.
    pub read_chunks: u64,
    /// Size in bytes of all read chunks.
    pub total_read_log_size: u64,
    pub write_log_keys: u64,
    pub read_log_keys: u64,
    pub total_keys: u64,
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read_chunks:{} total_read_log_size:{} write_log_keys:{} read_log_keys:{} total_keys:{}",
            self.read_chunks,
            self.total_read_log_size,
            self.write_log_keys,
            self.read_log_keys,
            self.total_keys
        )
    }
}
