//! Key/value stores fed by change-log replay.
//!
//! Both implementations keep entries in an ordered map shared with any
//! number of [`StoreReader`]s, so other threads can serve reads while the
//! loop thread applies updates.
//!
//! # Snapshot Format
//!
//! [`SnapshotStore`] persists its map on `flush`:
//!
//! ```text
//! +----------+----------+----------+------------------------------+----------+
//! |  Magic   | Version  |  Count   | Entries                      |  CRC32   |
//! | (4 bytes)| (2 bytes)| (8 bytes)| key_len u32, key, val_len u32, val | (4 bytes)|
//! +----------+----------+----------+------------------------------+----------+
//! ```
//!
//! The CRC covers everything before it. Integers are little-endian. The
//! file is written to a temporary path and renamed into place.

#![allow(clippy::significant_drop_tightening)]

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Magic bytes at the start of every snapshot ("KEEL").
const SNAPSHOT_MAGIC: u32 = 0x4B45_454C;
/// Snapshot format version.
const SNAPSHOT_VERSION: u16 = 1;
/// Header size: magic + version + count.
const SNAPSHOT_HEADER_SIZE: usize = 4 + 2 + 8;
/// Trailer size: CRC32.
const SNAPSHOT_TRAILER_SIZE: usize = 4;

type Entries = Arc<RwLock<BTreeMap<Bytes, Bytes>>>;

/// A materialized key/value store.
pub trait KeyValueStore: Send {
    /// Returns the store name.
    fn name(&self) -> &str;

    /// Returns true if the store survives a restart.
    fn persistent(&self) -> bool;

    /// Returns the value for `key`.
    ///
    /// # Errors
    /// Returns an error if the store is closed.
    fn get(&self, key: &[u8]) -> StoreResult<Option<Bytes>>;

    /// Inserts or overwrites `key`.
    ///
    /// # Errors
    /// Returns an error if the store is closed or full.
    fn put(&mut self, key: Bytes, value: Bytes) -> StoreResult<()>;

    /// Removes `key`, returning its previous value.
    ///
    /// # Errors
    /// Returns an error if the store is closed.
    fn delete(&mut self, key: &[u8]) -> StoreResult<Option<Bytes>>;

    /// Returns the number of entries.
    fn len(&self) -> usize;

    /// Returns true if the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a read-only view that can be used from other threads.
    fn reader(&self) -> StoreReader;

    /// Makes all applied updates durable.
    ///
    /// # Errors
    /// Returns an error if persisting fails.
    fn flush(&mut self) -> StoreResult<()>;

    /// Flushes and closes the store. Closing twice is a no-op.
    ///
    /// # Errors
    /// Returns an error if the final flush fails.
    fn close(&mut self) -> StoreResult<()>;
}

/// Read-only, cloneable view of a store.
#[derive(Debug, Clone)]
pub struct StoreReader {
    name: Arc<str>,
    entries: Entries,
}

impl StoreReader {
    /// Returns the store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value for `key`.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        read_entries(&self.entries).get(key).cloned()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        read_entries(&self.entries).len()
    }

    /// Returns true if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry, for state that was wiped from disk.
    pub(crate) fn clear(&self) {
        write_entries(&self.entries).clear();
    }
}

/// # Panics
///
/// Panics if the lock is poisoned.
fn read_entries(entries: &Entries) -> RwLockReadGuard<'_, BTreeMap<Bytes, Bytes>> {
    entries.read().expect("store entries lock poisoned")
}

/// # Panics
///
/// Panics if the lock is poisoned.
fn write_entries(entries: &Entries) -> RwLockWriteGuard<'_, BTreeMap<Bytes, Bytes>> {
    entries.write().expect("store entries lock poisoned")
}

/// Map, limits and open/closed state shared by both store kinds.
#[derive(Debug)]
struct StoreCore {
    name: Arc<str>,
    entries: Entries,
    max_entries: u64,
    closed: bool,
}

impl StoreCore {
    fn new(name: &str, entries: BTreeMap<Bytes, Bytes>, max_entries: u64) -> Self {
        Self {
            name: Arc::from(name),
            entries: Arc::new(RwLock::new(entries)),
            max_entries,
            closed: false,
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::Closed {
                name: self.name.to_string(),
            });
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<Bytes>> {
        self.ensure_open()?;
        Ok(read_entries(&self.entries).get(key).cloned())
    }

    fn put(&mut self, key: Bytes, value: Bytes) -> StoreResult<()> {
        self.ensure_open()?;
        let mut entries = write_entries(&self.entries);
        let count = entries.len() as u64;
        if count >= self.max_entries && !entries.contains_key(&key) {
            return Err(StoreError::TooManyEntries {
                name: self.name.to_string(),
                count,
                max: self.max_entries,
            });
        }
        entries.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> StoreResult<Option<Bytes>> {
        self.ensure_open()?;
        Ok(write_entries(&self.entries).remove(key))
    }

    fn len(&self) -> usize {
        read_entries(&self.entries).len()
    }

    fn reader(&self) -> StoreReader {
        StoreReader {
            name: Arc::clone(&self.name),
            entries: Arc::clone(&self.entries),
        }
    }
}

/// Store that lives only in memory. Every restart begins empty.
#[derive(Debug)]
pub struct MemoryStore {
    core: StoreCore,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(name: &str, max_entries: u64) -> Self {
        Self {
            core: StoreCore::new(name, BTreeMap::new(), max_entries),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn persistent(&self) -> bool {
        false
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<Bytes>> {
        self.core.get(key)
    }

    fn put(&mut self, key: Bytes, value: Bytes) -> StoreResult<()> {
        self.core.put(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> StoreResult<Option<Bytes>> {
        self.core.delete(key)
    }

    fn len(&self) -> usize {
        self.core.len()
    }

    fn reader(&self) -> StoreReader {
        self.core.reader()
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.core.ensure_open()
    }

    fn close(&mut self) -> StoreResult<()> {
        self.core.closed = true;
        Ok(())
    }
}

/// Store persisted as a checksummed snapshot file.
#[derive(Debug)]
pub struct SnapshotStore {
    core: StoreCore,
    path: PathBuf,
    /// Whether updates were applied since the last flush.
    dirty: bool,
    /// Whether to fsync snapshots before renaming them into place.
    sync_on_flush: bool,
}

impl SnapshotStore {
    /// Returns the snapshot path of store `name` in `dir`.
    #[must_use]
    pub fn snapshot_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.snapshot"))
    }

    /// Opens store `name` in `dir`, loading its snapshot if one exists.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be read or is corrupt.
    pub fn open(dir: &Path, name: &str, max_entries: u64) -> StoreResult<Self> {
        let path = Self::snapshot_path(dir, name);
        let entries = match fs::read(&path) {
            Ok(data) => decode_snapshot(&path, Bytes::from(data), max_entries)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(io_error("read_snapshot", &e)),
        };

        debug!(store = name, entries = entries.len(), "Opened snapshot store");

        Ok(Self {
            core: StoreCore::new(name, entries, max_entries),
            path,
            dirty: false,
            sync_on_flush: true,
        })
    }

    /// Skips fsync on flush, for tests.
    #[must_use]
    pub const fn without_sync(mut self) -> Self {
        self.sync_on_flush = false;
        self
    }

    /// Returns the snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_snapshot(&self) -> StoreResult<()> {
        let data = encode_snapshot(&read_entries(&self.core.entries));
        let tmp = self.path.with_extension("snapshot.tmp");

        {
            let mut file = fs::File::create(&tmp).map_err(|e| io_error("create_snapshot", &e))?;
            file.write_all(&data)
                .map_err(|e| io_error("write_snapshot", &e))?;
            if self.sync_on_flush {
                file.sync_all().map_err(|e| io_error("sync_snapshot", &e))?;
            }
        }

        fs::rename(&tmp, &self.path).map_err(|e| io_error("rename_snapshot", &e))
    }
}

impl KeyValueStore for SnapshotStore {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn persistent(&self) -> bool {
        true
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<Bytes>> {
        self.core.get(key)
    }

    fn put(&mut self, key: Bytes, value: Bytes) -> StoreResult<()> {
        self.core.put(key, value)?;
        self.dirty = true;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> StoreResult<Option<Bytes>> {
        let previous = self.core.delete(key)?;
        self.dirty = true;
        Ok(previous)
    }

    fn len(&self) -> usize {
        self.core.len()
    }

    fn reader(&self) -> StoreReader {
        self.core.reader()
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.core.ensure_open()?;
        if !self.dirty {
            return Ok(());
        }

        self.write_snapshot()?;
        self.dirty = false;
        debug!(store = %self.core.name, entries = self.core.len(), "Flushed snapshot");
        Ok(())
    }

    fn close(&mut self) -> StoreResult<()> {
        if self.core.closed {
            return Ok(());
        }
        let result = self.flush();
        self.core.closed = true;
        result
    }
}

fn io_error(operation: &'static str, e: &io::Error) -> StoreError {
    StoreError::Io {
        operation,
        message: e.to_string(),
    }
}

#[allow(clippy::cast_possible_truncation)] // Key and value sizes bounded by limits.
fn encode_snapshot(entries: &BTreeMap<Bytes, Bytes>) -> Bytes {
    let body: usize = entries.iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
    let mut buf = BytesMut::with_capacity(SNAPSHOT_HEADER_SIZE + body + SNAPSHOT_TRAILER_SIZE);

    buf.put_u32_le(SNAPSHOT_MAGIC);
    buf.put_u16_le(SNAPSHOT_VERSION);
    buf.put_u64_le(entries.len() as u64);
    for (key, value) in entries {
        buf.put_u32_le(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value);
    }

    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf.freeze()
}

fn decode_snapshot(
    path: &Path,
    data: Bytes,
    max_entries: u64,
) -> StoreResult<BTreeMap<Bytes, Bytes>> {
    let corrupt = |reason| StoreError::Corruption {
        path: path.to_path_buf(),
        reason,
    };

    if data.len() < SNAPSHOT_HEADER_SIZE + SNAPSHOT_TRAILER_SIZE {
        return Err(corrupt("file too small"));
    }

    let body_len = data.len() - SNAPSHOT_TRAILER_SIZE;
    let expected = (&data[body_len..]).get_u32_le();
    let actual = crc32fast::hash(&data[..body_len]);
    if expected != actual {
        return Err(StoreError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }

    let mut buf = data.slice(..body_len);
    if buf.get_u32_le() != SNAPSHOT_MAGIC {
        return Err(corrupt("bad magic"));
    }
    if buf.get_u16_le() != SNAPSHOT_VERSION {
        return Err(corrupt("unsupported version"));
    }
    let count = buf.get_u64_le();
    if count > max_entries {
        return Err(corrupt("entry count exceeds limit"));
    }

    let mut entries = BTreeMap::new();
    // Bounded loop: count was checked against max_entries.
    for _ in 0..count {
        let key = read_chunk(&mut buf).ok_or_else(|| corrupt("truncated key"))?;
        let value = read_chunk(&mut buf).ok_or_else(|| corrupt("truncated value"))?;
        entries.insert(key, value);
    }

    if buf.has_remaining() {
        return Err(corrupt("trailing bytes after entries"));
    }

    Ok(entries)
}

fn read_chunk(buf: &mut Bytes) -> Option<Bytes> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return None;
    }
    Some(buf.split_to(len))
}
