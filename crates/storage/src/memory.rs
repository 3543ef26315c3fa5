//! MemoryEngine: reference KV engine
//!
//! Committed state is an immutable `Arc<Tables>`; readers clone the `Arc`
//! and never block writers. A write transaction works on its own copy of the
//! table map, where each table is itself behind an `Arc` and is only cloned
//! when first modified. Commit swaps the new map in under a short write lock.
//!
//! # Design Notes
//!
//! - **Single writer**: a `Mutex<bool>` + `Condvar` gate admits one write
//!   transaction at a time; the gate is released when the transaction is
//!   dropped, whether or not it committed
//! - **Optional file image**: `MemoryEngine::open(path)` loads the image at
//!   startup and rewrites it atomically (temp file, fsync, rename) before each
//!   commit becomes visible; a failed write fails the commit
//! - **Image format**: 4-byte magic, u32 LE format version, MessagePack body

use crate::error::{StorageError, StorageResult};
use crate::kv::{KvEngine, KvTransaction};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;
type Tables = BTreeMap<String, Arc<Table>>;

const IMAGE_MAGIC: &[u8; 4] = b"GPKV";
const IMAGE_VERSION: u32 = 1;

/// In-memory transactional engine with optional persistence
#[derive(Debug)]
pub struct MemoryEngine {
    committed: RwLock<Arc<Tables>>,
    writer_active: Mutex<bool>,
    writer_released: Condvar,
    image_path: Option<PathBuf>,
}

impl MemoryEngine {
    /// Create an empty, purely in-memory engine
    pub fn new() -> Self {
        Self::with_state(Tables::new(), None)
    }

    /// Open an engine backed by an image file
    ///
    /// The file is created on the first commit if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let tables = read_image(&path)?;
            info!(
                target: "graphproc::storage",
                path = %path.display(),
                tables = tables.len(),
                "Loaded registry image"
            );
            tables
        } else {
            Tables::new()
        };
        Ok(Self::with_state(tables, Some(path)))
    }

    fn with_state(tables: Tables, image_path: Option<PathBuf>) -> Self {
        MemoryEngine {
            committed: RwLock::new(Arc::new(tables)),
            writer_active: Mutex::new(false),
            writer_released: Condvar::new(),
            image_path,
        }
    }

    /// Path of the backing image, if any
    pub fn image_path(&self) -> Option<&Path> {
        self.image_path.as_deref()
    }

    fn snapshot(&self) -> Arc<Tables> {
        Arc::clone(&self.committed.read())
    }

    fn acquire_writer(&self) {
        let mut active = self.writer_active.lock();
        while *active {
            self.writer_released.wait(&mut active);
        }
        *active = true;
    }

    fn release_writer(&self) {
        *self.writer_active.lock() = false;
        self.writer_released.notify_one();
    }

    fn install(&self, tables: Tables) -> StorageResult<()> {
        if let Some(path) = &self.image_path {
            write_image(path, &tables)?;
        }
        *self.committed.write() = Arc::new(tables);
        Ok(())
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine for MemoryEngine {
    fn begin_read(&self) -> StorageResult<Box<dyn KvTransaction + '_>> {
        Ok(Box::new(ReadTxn {
            snapshot: self.snapshot(),
        }))
    }

    fn begin_write(&self) -> StorageResult<Box<dyn KvTransaction + '_>> {
        self.acquire_writer();
        let working = (*self.snapshot()).clone();
        Ok(Box::new(WriteTxn {
            engine: self,
            working,
            committed: false,
        }))
    }
}

struct ReadTxn {
    snapshot: Arc<Tables>,
}

impl KvTransaction for ReadTxn {
    fn is_read_only(&self) -> bool {
        true
    }

    fn get(&self, table: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(lookup(&self.snapshot, table, key))
    }

    fn put(&mut self, _table: &str, _key: &[u8], _value: &[u8]) -> StorageResult<()> {
        Err(StorageError::ReadOnly)
    }

    fn delete(&mut self, _table: &str, _key: &[u8]) -> StorageResult<bool> {
        Err(StorageError::ReadOnly)
    }

    fn scan_keys(&self, table: &str) -> StorageResult<Vec<Vec<u8>>> {
        Ok(keys(&self.snapshot, table))
    }

    fn drop_table(&mut self, _table: &str) -> StorageResult<()> {
        Err(StorageError::ReadOnly)
    }

    fn commit(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

struct WriteTxn<'a> {
    engine: &'a MemoryEngine,
    working: Tables,
    committed: bool,
}

impl KvTransaction for WriteTxn<'_> {
    fn is_read_only(&self) -> bool {
        false
    }

    fn get(&self, table: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(lookup(&self.working, table, key))
    }

    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let t = self.working.entry(table.to_string()).or_default();
        Arc::make_mut(t).insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &[u8]) -> StorageResult<bool> {
        match self.working.get_mut(table) {
            Some(t) if t.contains_key(key) => Ok(Arc::make_mut(t).remove(key).is_some()),
            _ => Ok(false),
        }
    }

    fn scan_keys(&self, table: &str) -> StorageResult<Vec<Vec<u8>>> {
        Ok(keys(&self.working, table))
    }

    fn drop_table(&mut self, table: &str) -> StorageResult<()> {
        self.working.remove(table);
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> StorageResult<()> {
        let tables = std::mem::take(&mut self.working);
        self.engine.install(tables)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.committed {
            debug!(target: "graphproc::storage", "Write transaction aborted");
        }
        self.engine.release_writer();
    }
}

fn lookup(tables: &Tables, table: &str, key: &[u8]) -> Option<Vec<u8>> {
    tables.get(table).and_then(|t| t.get(key)).cloned()
}

fn keys(tables: &Tables, table: &str) -> Vec<Vec<u8>> {
    tables
        .get(table)
        .map(|t| t.keys().cloned().collect())
        .unwrap_or_default()
}

fn write_image(path: &Path, tables: &Tables) -> StorageResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let payload = rmp_serde::to_vec(tables)?;
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(IMAGE_MAGIC);
    buf.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
    buf.extend_from_slice(&payload);

    let tmp_path = path.with_extension("image.tmp");
    let written = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    })();
    if let Err(e) = written {
        warn!(
            target: "graphproc::storage",
            path = %tmp_path.display(),
            error = %e,
            "Registry image write failed, removing temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

fn read_image(path: &Path) -> StorageResult<Tables> {
    let buf = std::fs::read(path)?;
    if buf.len() < 8 || &buf[0..4] != IMAGE_MAGIC {
        return Err(StorageError::Corruption(format!(
            "{} is not a registry image",
            path.display()
        )));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&buf[4..8]);
    let version = u32::from_le_bytes(version);
    if version != IMAGE_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported registry image version {}",
            version
        )));
    }
    Ok(rmp_serde::from_slice(&buf[8..])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    const T: &str = "procs";

    #[test]
    fn test_commit_makes_writes_visible() {
        let engine = MemoryEngine::new();
        let mut txn = engine.begin_write().unwrap();
        txn.put(T, b"k", b"v").unwrap();
        assert_eq!(txn.get(T, b"k").unwrap(), Some(b"v".to_vec()));
        txn.commit().unwrap();

        let read = engine.begin_read().unwrap();
        assert_eq!(read.get(T, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_drop_aborts() {
        let engine = MemoryEngine::new();
        {
            let mut txn = engine.begin_write().unwrap();
            txn.put(T, b"k", b"v").unwrap();
        }
        let read = engine.begin_read().unwrap();
        assert_eq!(read.get(T, b"k").unwrap(), None);
        // The gate was released by the drop.
        let txn = engine.begin_write().unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_reader_keeps_its_snapshot() {
        let engine = MemoryEngine::new();
        let mut txn = engine.begin_write().unwrap();
        txn.put(T, b"k", b"old").unwrap();
        txn.commit().unwrap();

        let read = engine.begin_read().unwrap();
        let mut txn = engine.begin_write().unwrap();
        txn.put(T, b"k", b"new").unwrap();
        txn.commit().unwrap();

        assert_eq!(read.get(T, b"k").unwrap(), Some(b"old".to_vec()));
        let fresh = engine.begin_read().unwrap();
        assert_eq!(fresh.get(T, b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_read_txn_rejects_writes() {
        let engine = MemoryEngine::new();
        let mut read = engine.begin_read().unwrap();
        assert!(read.is_read_only());
        assert!(matches!(read.put(T, b"k", b"v"), Err(StorageError::ReadOnly)));
        assert!(matches!(read.delete(T, b"k"), Err(StorageError::ReadOnly)));
        assert!(matches!(read.drop_table(T), Err(StorageError::ReadOnly)));
    }

    #[test]
    fn test_delete_and_scan() {
        let engine = MemoryEngine::new();
        let mut txn = engine.begin_write().unwrap();
        txn.put(T, b"b", b"2").unwrap();
        txn.put(T, b"a", b"1").unwrap();
        txn.put(T, b"c", b"3").unwrap();
        assert!(txn.delete(T, b"b").unwrap());
        assert!(!txn.delete(T, b"b").unwrap());
        assert!(!txn.delete("missing", b"b").unwrap());
        assert_eq!(txn.scan_keys(T).unwrap(), vec![b"a".to_vec(), b"c".to_vec()]);
        txn.drop_table(T).unwrap();
        assert!(txn.scan_keys(T).unwrap().is_empty());
    }

    #[test]
    fn test_single_writer() {
        let engine = Arc::new(MemoryEngine::new());
        let second_started = Arc::new(AtomicBool::new(false));

        let txn = engine.begin_write().unwrap();
        let handle = {
            let engine = Arc::clone(&engine);
            let second_started = Arc::clone(&second_started);
            thread::spawn(move || {
                let txn = engine.begin_write().unwrap();
                second_started.store(true, Ordering::SeqCst);
                txn.commit().unwrap();
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!second_started.load(Ordering::SeqCst));
        drop(txn);
        handle.join().unwrap();
        assert!(second_started.load(Ordering::SeqCst));
    }

    #[test]
    fn test_image_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.gpkv");
        {
            let engine = MemoryEngine::open(&path).unwrap();
            let mut txn = engine.begin_write().unwrap();
            txn.put(T, b"_proc_echo", b"meta").unwrap();
            txn.put(T, b"@so__proc_echo", &[0u8, 1, 2, 255]).unwrap();
            txn.commit().unwrap();
        }
        let engine = MemoryEngine::open(&path).unwrap();
        let read = engine.begin_read().unwrap();
        assert_eq!(read.get(T, b"_proc_echo").unwrap(), Some(b"meta".to_vec()));
        assert_eq!(
            read.get(T, b"@so__proc_echo").unwrap(),
            Some(vec![0u8, 1, 2, 255])
        );
    }

    #[test]
    fn test_aborted_txn_does_not_touch_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.gpkv");
        let engine = MemoryEngine::open(&path).unwrap();
        {
            let mut txn = engine.begin_write().unwrap();
            txn.put(T, b"k", b"v").unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.gpkv");
        std::fs::write(&path, b"NOPE0000garbage").unwrap();
        assert!(matches!(
            MemoryEngine::open(&path),
            Err(StorageError::Corruption(_))
        ));
    }
}
