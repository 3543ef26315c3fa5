//! Transactional key-value interface
//!
//! The registry is written against these traits rather than a concrete
//! engine. An engine provides named tables of byte-string keys and values,
//! with:
//!
//! - **Single writer**: at most one write transaction is open at a time;
//!   `begin_write` blocks until the current writer finishes
//! - **Snapshot reads**: a read transaction sees the state as of its start
//! - **Abort on drop**: a write transaction dropped without `commit` leaves
//!   no trace

use crate::error::StorageResult;

/// A transactional byte-table store
pub trait KvEngine: Send + Sync {
    /// Open a snapshot read transaction
    fn begin_read(&self) -> StorageResult<Box<dyn KvTransaction + '_>>;

    /// Open the write transaction, waiting for any current writer
    fn begin_write(&self) -> StorageResult<Box<dyn KvTransaction + '_>>;
}

/// One open transaction
///
/// Mutating calls on a read transaction fail with
/// [`StorageError::ReadOnly`](crate::StorageError::ReadOnly).
pub trait KvTransaction {
    /// Whether this transaction rejects writes
    fn is_read_only(&self) -> bool;

    /// Read a value
    fn get(&self, table: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Insert or replace a value
    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Remove a key, returning whether it existed
    fn delete(&mut self, table: &str, key: &[u8]) -> StorageResult<bool>;

    /// All keys of a table, in ascending order
    fn scan_keys(&self, table: &str) -> StorageResult<Vec<Vec<u8>>>;

    /// Remove a table and everything in it
    fn drop_table(&mut self, table: &str) -> StorageResult<()>;

    /// Make the transaction's writes visible
    fn commit(self: Box<Self>) -> StorageResult<()>;
}
