//! File-backed storage engine.
//!
//! The engine keeps named, timestamp-ordered maps in memory and persists all
//! of them, together with a small set of metadata blobs, as one snapshot file.
//! A commit writes the snapshot only when something changed since the last
//! commit. The snapshot is always complete: every map is re-encoded and the
//! whole file rewritten, so a commit costs O(total entries) regardless of how
//! few entries changed.
//!
//! # File Format
//!
//! ```text
//! [0..4)     Magic "TDMK"
//! [4..8)     Format version (u32 LE)
//! [8..16)    Body length in bytes (u64 LE)
//! [16..20)   CRC32 of the body (u32 LE)
//! [20..24)   Reserved
//! [24..)     Body: bincode-encoded snapshot
//! ```
//!
//! With transactions enabled the snapshot is written to a sibling temporary
//! file, synced, and renamed over the database file, so a crash leaves either
//! the old or the new snapshot in place. Without transactions the file is
//! overwritten in place.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StorageError};

/// Magic bytes identifying a Tidemark database file.
const FILE_MAGIC: [u8; 4] = *b"TDMK";

/// Current file format version.
const FILE_VERSION: u32 = 1;

/// Size of the file header in bytes.
const HEADER_SIZE: usize = 24;

/// A value type that can live in an [`OrderedMap`].
///
/// `CODEC` is recorded next to every persisted map so a map written with one
/// value type is never decoded as another.
pub trait MapValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable name of the value codec.
    const CODEC: &'static str;
}

impl MapValue for f64 {
    const CODEC: &'static str = "f64";
}

impl MapValue for i32 {
    const CODEC: &'static str = "i32";
}

impl MapValue for i64 {
    const CODEC: &'static str = "i64";
}

impl MapValue for f32 {
    const CODEC: &'static str = "f32";
}

/// Options controlling how the engine reads and writes its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageOptions {
    /// Read the file through a memory map on open.
    pub memory_mapping: bool,
    /// Commit through a temporary file and an atomic rename.
    pub transactions: bool,
    /// Number of lock stripes for the map directory.
    pub concurrency_scale: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            memory_mapping: true,
            transactions: true,
            concurrency_scale: 16,
        }
    }
}

/// State shared between the engine and every map it hands out.
#[derive(Debug, Default)]
struct Shared {
    /// Bumped on every mutation.
    generation: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed.into());
        }
        Ok(())
    }

    fn touch(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// A named map from timestamp to value, ordered by timestamp.
///
/// Handles are shared: every caller opening the same name gets the same map.
/// Each operation holds the map's lock for its whole duration, so a reader
/// never observes half of a [`put_all`](Self::put_all).
#[derive(Debug)]
pub struct OrderedMap<V> {
    name: String,
    entries: RwLock<BTreeMap<i64, V>>,
    shared: Arc<Shared>,
}

impl<V: MapValue> OrderedMap<V> {
    fn new(name: String, entries: BTreeMap<i64, V>, shared: Arc<Shared>) -> Self {
        Self {
            name,
            entries: RwLock::new(entries),
            shared,
        }
    }

    /// Returns the map name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value stored at `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] once the engine is closed.
    pub fn get(&self, timestamp: i64) -> Result<Option<V>> {
        self.shared.ensure_open()?;
        Ok(self.entries.read().get(&timestamp).cloned())
    }

    /// Inserts or replaces the value at `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] once the engine is closed.
    pub fn put(&self, timestamp: i64, value: V) -> Result<()> {
        self.shared.ensure_open()?;
        self.entries.write().insert(timestamp, value);
        self.shared.touch();
        Ok(())
    }

    /// Inserts every entry under a single lock acquisition.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] once the engine is closed.
    pub fn put_all(&self, batch: BTreeMap<i64, V>) -> Result<()> {
        self.shared.ensure_open()?;
        if batch.is_empty() {
            return Ok(());
        }
        self.entries.write().extend(batch);
        self.shared.touch();
        Ok(())
    }

    /// Returns the entries with `start <= timestamp <= end`, ascending.
    ///
    /// An inverted range yields no entries.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] once the engine is closed.
    pub fn range(&self, start: i64, end: i64) -> Result<Vec<(i64, V)>> {
        self.shared.ensure_open()?;
        if start > end {
            return Ok(Vec::new());
        }
        let entries = self.entries.read();
        Ok(entries
            .range(start..=end)
            .map(|(ts, value)| (*ts, value.clone()))
            .collect())
    }

    /// Returns the entry with the greatest timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] once the engine is closed.
    pub fn last_entry(&self) -> Result<Option<(i64, V)>> {
        self.shared.ensure_open()?;
        let entries = self.entries.read();
        Ok(entries
            .last_key_value()
            .map(|(ts, value)| (*ts, value.clone())))
    }

    /// Returns the entry with the greatest timestamp strictly below `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] once the engine is closed.
    pub fn lower_entry(&self, timestamp: i64) -> Result<Option<(i64, V)>> {
        self.shared.ensure_open()?;
        let entries = self.entries.read();
        Ok(entries
            .range(..timestamp)
            .next_back()
            .map(|(ts, value)| (*ts, value.clone())))
    }

    /// Removes every entry with `timestamp < cutoff`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] once the engine is closed.
    pub fn remove_before(&self, cutoff: i64) -> Result<usize> {
        self.shared.ensure_open()?;
        let mut entries = self.entries.write();
        let kept = entries.split_off(&cutoff);
        let removed = std::mem::replace(&mut *entries, kept).len();
        drop(entries);
        if removed > 0 {
            self.shared.touch();
        }
        Ok(removed)
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Kind-erased view of an [`OrderedMap`].
///
/// Used by the engine to persist maps of any value type and by retention to
/// trim them.
pub trait ErasedMap: Send + Sync + 'static {
    /// Returns the map name.
    fn name(&self) -> &str;

    /// Returns the value codec name.
    fn codec(&self) -> &'static str;

    /// Returns the number of entries.
    fn entry_count(&self) -> usize;

    /// Removes every entry with `timestamp < cutoff`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] once the engine is closed.
    fn remove_before(&self, cutoff: i64) -> Result<usize>;

    /// Encodes the entries for the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Codec`] if encoding fails.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Upcasts to [`Any`] for typed downcasts.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<V: MapValue> ErasedMap for OrderedMap<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn codec(&self) -> &'static str {
        V::CODEC
    }

    fn entry_count(&self) -> usize {
        self.len()
    }

    fn remove_before(&self, cutoff: i64) -> Result<usize> {
        OrderedMap::remove_before(self, cutoff)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let entries = self.entries.read();
        bincode::serialize(&*entries).map_err(|source| {
            StorageError::Codec {
                name: self.name.clone(),
                source,
            }
            .into()
        })
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A persisted map that has not been opened in this session.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMap {
    name: String,
    codec: String,
    payload: Vec<u8>,
}

/// Everything persisted in one file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    maps: Vec<StoredMap>,
    meta: BTreeMap<String, Vec<u8>>,
}

type Directory = HashMap<String, Arc<dyn ErasedMap>>;

/// The storage engine.
///
/// Opening a path that does not exist creates an empty database file there.
pub struct Storage {
    path: PathBuf,
    options: StorageOptions,
    /// Open maps, striped by name hash.
    stripes: Box<[RwLock<Directory>]>,
    /// Maps loaded from disk but not yet opened.
    dormant: Mutex<HashMap<String, StoredMap>>,
    meta: RwLock<BTreeMap<String, Vec<u8>>>,
    shared: Arc<Shared>,
    /// Generation captured by the last successful commit.
    committed: AtomicU64,
    commit_lock: Mutex<()>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("options", &self.options)
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Opens the database file at `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file cannot be read or created and
    /// [`StorageError::Corrupted`] if it fails header or checksum validation.
    pub fn open(path: impl AsRef<Path>, options: StorageOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let snapshot = if path.exists() {
            read_snapshot(&path, options.memory_mapping)?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
            }
            let empty = Snapshot::default();
            write_file(&path, &encode_snapshot(&empty)?, options.transactions)?;
            empty
        };

        let stripe_count = options.concurrency_scale.max(1).next_power_of_two();
        let stripes = (0..stripe_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(
            path = %path.display(),
            maps = snapshot.maps.len(),
            stripes = stripe_count,
            "storage opened"
        );

        let dormant = snapshot
            .maps
            .into_iter()
            .map(|map| (map.name.clone(), map))
            .collect();

        Ok(Self {
            path,
            options,
            stripes,
            dormant: Mutex::new(dormant),
            meta: RwLock::new(snapshot.meta),
            shared: Arc::new(Shared::default()),
            committed: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
        })
    }

    /// Returns the path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the options the engine was opened with.
    pub fn options(&self) -> StorageOptions {
        self.options
    }

    /// Opens (or creates) the map called `name` holding values of type `V`.
    ///
    /// Repeated calls with the same name return the same handle.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CodecMismatch`] if the map exists with another
    /// value type, [`StorageError::Codec`] if its persisted payload cannot be
    /// decoded, and [`StorageError::Closed`] once the engine is closed.
    pub fn open_map<V: MapValue>(&self, name: &str) -> Result<Arc<OrderedMap<V>>> {
        self.shared.ensure_open()?;
        let mut stripe = self.stripe(name).write();

        if let Some(existing) = stripe.get(name) {
            return downcast_map::<V>(name, existing);
        }

        let mut dormant = self.dormant.lock();
        let entries = match dormant.get(name) {
            Some(stored) if stored.codec != V::CODEC => {
                return Err(StorageError::CodecMismatch {
                    name: name.to_string(),
                    stored: stored.codec.clone(),
                    requested: V::CODEC.to_string(),
                }
                .into());
            }
            Some(stored) => bincode::deserialize::<BTreeMap<i64, V>>(&stored.payload).map_err(
                |source| StorageError::Codec {
                    name: name.to_string(),
                    source,
                },
            )?,
            None => {
                self.shared.touch();
                BTreeMap::new()
            }
        };
        dormant.remove(name);
        drop(dormant);

        let map = Arc::new(OrderedMap::new(
            name.to_string(),
            entries,
            Arc::clone(&self.shared),
        ));
        stripe.insert(name.to_string(), Arc::clone(&map) as Arc<dyn ErasedMap>);
        debug!(map = name, codec = V::CODEC, "map opened");
        Ok(map)
    }

    /// Stores a metadata blob under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] once the engine is closed.
    pub fn put_meta(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.shared.ensure_open()?;
        self.meta.write().insert(key.to_string(), value);
        self.shared.touch();
        Ok(())
    }

    /// Returns the metadata blob stored under `key`.
    pub fn meta(&self, key: &str) -> Option<Vec<u8>> {
        self.meta.read().get(key).cloned()
    }

    /// Returns `true` if there are changes not yet committed.
    pub fn is_dirty(&self) -> bool {
        self.shared.generation.load(Ordering::Acquire) != self.committed.load(Ordering::Acquire)
    }

    /// Persists all maps and metadata.
    ///
    /// Returns `false` without touching the file when nothing changed since the
    /// last commit.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file cannot be written and
    /// [`StorageError::Closed`] once the engine is closed.
    pub fn commit(&self) -> Result<bool> {
        self.shared.ensure_open()?;
        self.commit_inner()
    }

    fn commit_inner(&self) -> Result<bool> {
        let _guard = self.commit_lock.lock();
        let generation = self.shared.generation.load(Ordering::Acquire);
        if generation == self.committed.load(Ordering::Acquire) {
            return Ok(false);
        }

        let snapshot = self.snapshot()?;
        let bytes = encode_snapshot(&snapshot)?;
        write_file(&self.path, &bytes, self.options.transactions)?;
        self.committed.store(generation, Ordering::Release);

        debug!(
            path = %self.path.display(),
            maps = snapshot.maps.len(),
            bytes = bytes.len(),
            "storage committed"
        );
        Ok(true)
    }

    /// Commits pending changes and closes the engine.
    ///
    /// Every later operation on the engine or its maps fails with
    /// [`StorageError::Closed`]. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the error of the final commit. The engine is closed either way.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let result = self.commit_inner().map(|_| ());
        self.shared.closed.store(true, Ordering::Release);
        debug!(path = %self.path.display(), "storage closed");
        result
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Returns the size of the database file in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file metadata cannot be read.
    pub fn file_size(&self) -> Result<u64> {
        fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|source| io_error(&self.path, source))
    }

    fn stripe(&self, name: &str) -> &RwLock<Directory> {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        // Stripe count is a power of two; only the low bits are kept.
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() as usize) & (self.stripes.len() - 1);
        &self.stripes[index]
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let mut maps = Vec::new();
        for stripe in self.stripes.iter() {
            for map in stripe.read().values() {
                maps.push(StoredMap {
                    name: map.name().to_string(),
                    codec: map.codec().to_string(),
                    payload: map.encode()?,
                });
            }
        }
        maps.extend(self.dormant.lock().values().cloned());
        maps.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Snapshot {
            maps,
            meta: self.meta.read().clone(),
        })
    }
}

fn downcast_map<V: MapValue>(name: &str, map: &Arc<dyn ErasedMap>) -> Result<Arc<OrderedMap<V>>> {
    let codec = map.codec();
    Arc::clone(map)
        .into_any()
        .downcast::<OrderedMap<V>>()
        .map_err(|_| {
            StorageError::CodecMismatch {
                name: name.to_string(),
                stored: codec.to_string(),
                requested: V::CODEC.to_string(),
            }
            .into()
        })
}

fn io_error(path: &Path, source: std::io::Error) -> crate::error::TidemarkError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
    .into()
}

fn corrupted(path: &Path, reason: impl Into<String>) -> crate::error::TidemarkError {
    StorageError::Corrupted {
        path: path.display().to_string(),
        reason: reason.into(),
    }
    .into()
}

fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>> {
    let body = bincode::serialize(snapshot).map_err(|source| StorageError::Codec {
        name: "snapshot".to_string(),
        source,
    })?;

    let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len());
    bytes.extend_from_slice(&FILE_MAGIC);
    bytes.extend_from_slice(&FILE_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(body.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    bytes.extend_from_slice(&[0; 4]);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn read_snapshot(path: &Path, memory_mapping: bool) -> Result<Snapshot> {
    if memory_mapping {
        let file = File::open(path).map_err(|source| io_error(path, source))?;
        let len = file
            .metadata()
            .map_err(|source| io_error(path, source))?
            .len();
        if len == 0 {
            return Ok(Snapshot::default());
        }
        // SAFETY: The file is opened read-only and only this process writes
        // database files, always by replacing or rewriting them from a commit
        // that holds no mapping. The mapping is dropped before this returns.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| io_error(path, source))?;
        decode_snapshot(path, &mmap)
    } else {
        let bytes = fs::read(path).map_err(|source| io_error(path, source))?;
        if bytes.is_empty() {
            return Ok(Snapshot::default());
        }
        decode_snapshot(path, &bytes)
    }
}

fn decode_snapshot(path: &Path, bytes: &[u8]) -> Result<Snapshot> {
    if bytes.len() < HEADER_SIZE {
        return Err(corrupted(
            path,
            format!("file is {} bytes, header needs {HEADER_SIZE}", bytes.len()),
        ));
    }
    if bytes[0..4] != FILE_MAGIC {
        return Err(corrupted(path, "bad magic bytes"));
    }

    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FILE_VERSION {
        return Err(corrupted(
            path,
            format!("unsupported format version {version}"),
        ));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[8..16]);
    let body_len = u64::from_le_bytes(len_bytes);
    let expected_crc = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);

    let body = &bytes[HEADER_SIZE..];
    if body.len() as u64 != body_len {
        return Err(corrupted(
            path,
            format!("body is {} bytes, header says {body_len}", body.len()),
        ));
    }
    if crc32fast::hash(body) != expected_crc {
        return Err(corrupted(path, "checksum mismatch"));
    }

    bincode::deserialize(body).map_err(|source| {
        StorageError::Codec {
            name: "snapshot".to_string(),
            source,
        }
        .into()
    })
}

fn write_file(path: &Path, bytes: &[u8], transactional: bool) -> Result<()> {
    if transactional {
        let mut tmp: OsString = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = File::create(&tmp).map_err(|source| io_error(&tmp, source))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|source| io_error(&tmp, source))?;
        drop(file);
        fs::rename(&tmp, path).map_err(|source| io_error(path, source))?;
    } else {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| io_error(path, source))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|source| io_error(path, source))?;
    }
    Ok(())
}
