//! Ordered byte-keyed persistence for record and replay.
//!
//! Record writes each packet under a big-endian `u32` counter, replay scans
//! in ascending key order, so packets come back in arrival order. A store is
//! only ever written or read by one task at a time.

use std::{fmt, io, ops::ControlFlow, path::PathBuf};

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Store`] implementations.
pub enum Error {
    /// IO against the store's files failed
    #[error("Store IO on {path} failed: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The database rejected an operation
    #[error("Store database failed: {0}")]
    Db(#[source] Box<redb::Error>),
}

/// An ordered map from byte keys to byte values.
pub trait Store: fmt::Debug + Send {
    /// Insert or replace the value under `key`.
    ///
    /// # Errors
    ///
    /// Fails if the value cannot be written.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Visit every entry in ascending key order until `visitor` breaks.
    ///
    /// # Errors
    ///
    /// Fails if a value cannot be read back.
    fn scan(&mut self, visitor: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>) -> Result<(), Error>;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Whether the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push buffered writes to durable storage.
    ///
    /// # Errors
    ///
    /// Fails if buffered writes cannot be flushed.
    fn flush(&mut self) -> Result<(), Error>;
}

/// Key for the `n`th recorded packet.
#[must_use]
pub fn sequence_key(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}
