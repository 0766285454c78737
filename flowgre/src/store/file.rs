//! On-disk store backed by `redb`.
//!
//! The store is a directory holding one database file with a single table
//! of byte keys to byte values. Every `put` is its own write transaction,
//! so a failed write leaves the table exactly as it was. Most commits skip
//! the fsync; every [`SYNC_EVERY`] puts, and on `flush`, a durable commit
//! makes everything before it crash safe.

use std::{
    fmt, fs,
    ops::ControlFlow,
    path::{Path, PathBuf},
};

use redb::{
    Database, Durability, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction,
};
use tracing::debug;

use super::{Error, Store};

const DB_FILE: &str = "flows.redb";

const FLOWS: TableDefinition<'static, &'static [u8], &'static [u8]> = TableDefinition::new("flows");

/// Puts between durable commits
pub const SYNC_EVERY: u32 = 1024;

fn db_error<E>(err: E) -> Error
where
    E: Into<redb::Error>,
{
    Error::Db(Box::new(err.into()))
}

/// A [`Store`] persisted to a directory on disk.
pub struct FileStore {
    path: PathBuf,
    db: Database,
    len: usize,
    unsynced: u32,
}

impl fmt::Debug for FileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("unsynced", &self.unsynced)
            .finish_non_exhaustive()
    }
}

impl FileStore {
    /// Open the store in `dir`, creating the directory and database if
    /// needed.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created, or the database cannot be
    /// opened, for instance because another store holds it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| Error::Io {
            path: dir.to_path_buf(),
            source: Box::new(source),
        })?;
        let path = dir.join(DB_FILE);
        let db = Database::create(&path).map_err(db_error)?;

        // create the table up front so readers never find it missing
        let txn = db.begin_write().map_err(db_error)?;
        let len = {
            let table = txn.open_table(FLOWS).map_err(db_error)?;
            table.len().map_err(db_error)?
        };
        txn.commit().map_err(db_error)?;

        debug!("opened {} with {len} entries", path.display());
        Ok(Self {
            path,
            db,
            len: usize::try_from(len).unwrap_or(usize::MAX),
            unsynced: 0,
        })
    }

    /// Path of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn begin_write(&mut self) -> Result<WriteTransaction, Error> {
        let mut txn = self.db.begin_write().map_err(db_error)?;
        if self.unsynced + 1 < SYNC_EVERY {
            txn.set_durability(Durability::None);
        }
        Ok(txn)
    }

    fn committed(&mut self, durable: bool) {
        if durable {
            self.unsynced = 0;
        } else {
            self.unsynced += 1;
        }
    }
}

impl Store for FileStore {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let durable = self.unsynced + 1 >= SYNC_EVERY;
        let txn = self.begin_write()?;
        // an early return drops, and so aborts, the transaction
        let len = {
            let mut table = txn.open_table(FLOWS).map_err(db_error)?;
            table.insert(key, value).map_err(db_error)?;
            table.len().map_err(db_error)?
        };
        txn.commit().map_err(db_error)?;

        self.committed(durable);
        self.len = usize::try_from(len).unwrap_or(usize::MAX);
        Ok(())
    }

    fn scan(&mut self, visitor: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>) -> Result<(), Error> {
        let txn = self.db.begin_read().map_err(db_error)?;
        let table = txn.open_table(FLOWS).map_err(db_error)?;
        for entry in table.iter().map_err(db_error)? {
            let (key, value) = entry.map_err(db_error)?;
            if visitor(key.value(), value.value()).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.len
    }

    fn flush(&mut self) -> Result<(), Error> {
        if self.unsynced == 0 {
            return Ok(());
        }
        // a durable commit persists every non-durable commit before it
        let txn = self.db.begin_write().map_err(db_error)?;
        txn.commit().map_err(db_error)?;
        self.committed(true);
        Ok(())
    }
}
