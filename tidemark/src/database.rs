//! The database facade.
//!
//! [`Database`] ties the storage engine, the source registry, the typed
//! stores and the retention sweeper together and owns their lifecycle from
//! open to close.
//!
//! # Design
//!
//! - The registry and the typed stores sit behind one lock. Declaring a
//!   source and opening its map happen under the write side, so a reader that
//!   resolves a source always finds its map.
//! - Reads and writes take the read side only long enough to clone the
//!   source's map handle; the map has its own lock.
//! - The declared sources are persisted in the database file, so
//!   [`Database::open_existing`] can recover them.
//! - [`Database::commit`] is database-wide. A commit issued by one thread also
//!   persists uncommitted writes made by every other thread. Each commit
//!   rewrites the whole file, so [`Database::put_batch`],
//!   [`Database::put_and_commit`] and every sweep pass cost time proportional
//!   to the total number of stored points, plus a sync.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use tidemark::{Database, DataPoint, ScalarKind};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::builder()
//!     .path("./metrics.tdm")
//!     .add_source("cpu.usage", ScalarKind::Float64, Some("CPU utilisation"))
//!     .add_int64_source("requests")
//!     .retention_days(7)
//!     .build()?;
//!
//! db.put("cpu.usage", 1_700_000_000_000, 42.5)?;
//! db.put_batch(
//!     "requests",
//!     (0..10).map(|i| DataPoint::new(1_700_000_000_000 + i * 1000, i)),
//! )?;
//! db.commit()?;
//!
//! let recent = db.latest::<i64>("requests", 3)?;
//! assert_eq!(recent.len(), 3);
//! db.close()?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::batch;
use crate::config::{DatabaseConfig, SECONDS_PER_DAY};
use crate::error::{QueryError, Result, SourceError};
use crate::kind::{DataPoint, Scalar, ScalarKind};
use crate::object::{FromObject, ObjectValue};
use crate::registry::{CATALOG_KEY, SourceDescriptor, SourceRegistry};
use crate::retention::{self, SHUTDOWN_GRACE, SweepReport, Sweeper};
use crate::storage::{ErasedMap, Storage};
use crate::typed::{Stores, TypedSeries};

/// Registry and stores, kept in lock-step.
#[derive(Debug, Default)]
struct Catalog {
    registry: SourceRegistry,
    stores: Stores,
}

#[derive(Debug)]
struct Inner {
    storage: Storage,
    catalog: RwLock<Catalog>,
    config: DatabaseConfig,
}

impl Inner {
    fn declare(&self, descriptor: SourceDescriptor) -> Result<bool> {
        let mut catalog = self.catalog.write();
        let Catalog { registry, stores } = &mut *catalog;
        let added = registry.declare(descriptor, |d| stores.open(&self.storage, d))?;
        if added {
            self.storage.put_meta(CATALOG_KEY, registry.to_bytes()?)?;
        }
        Ok(added)
    }

    /// Resolves a source for writing. Unknown sources are an error.
    fn writable<T: Scalar>(&self, id: &str) -> Result<TypedSeries<T>> {
        self.readable::<T>(id)?.ok_or_else(|| {
            SourceError::NotFound {
                id: id.to_string(),
            }
            .into()
        })
    }

    /// Resolves a source for reading. Unknown sources resolve to `None`.
    fn readable<T: Scalar>(&self, id: &str) -> Result<Option<TypedSeries<T>>> {
        let catalog = self.catalog.read();
        match catalog.registry.resolve(id) {
            None => Ok(None),
            Some(declared) if declared != T::KIND => Err(SourceError::TypeMismatch {
                id: id.to_string(),
                declared,
                requested: T::KIND,
            }
            .into()),
            Some(_) => Ok(catalog.stores.typed::<T>().series(id)),
        }
    }

    fn sweep_targets(&self) -> Vec<(String, Arc<dyn ErasedMap>)> {
        let catalog = self.catalog.read();
        catalog
            .registry
            .list()
            .filter_map(|d| {
                catalog
                    .stores
                    .erased(d.kind, &d.id)
                    .map(|map| (d.id.clone(), map))
            })
            .collect()
    }

    fn sweep(&self, cancel: &AtomicBool) -> Result<SweepReport> {
        let cutoff = retention::now_millis().saturating_sub(self.config.retention_millis());
        retention::sweep(&self.storage, self.sweep_targets(), cutoff, cancel)
    }
}

/// An embedded, typed, multi-source time-series database.
///
/// Sources are declared up front, or added later on a database opened in
/// dynamic mode. Every source accepts exactly one [`ScalarKind`]; the typed
/// methods take the Rust type of that kind and fail with
/// [`SourceError::TypeMismatch`] when used against a source of another kind.
///
/// Writes are buffered in memory until [`commit`](Self::commit) (or a batch
/// write, or [`put_and_commit`](Self::put_and_commit)) persists them. Closing
/// the database commits once more. After [`close`](Self::close) every
/// operation fails with a storage error.
///
/// `Database` is `Send + Sync`; share it between threads with an [`Arc`].
#[derive(Debug)]
pub struct Database {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<Sweeper>>,
    dynamic: bool,
}

impl Database {
    /// Returns a builder for a new database.
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::default()
    }

    /// Opens the database described by `config` with a fixed set of sources.
    ///
    /// Sources persisted in the file are recovered and merged with `sources`.
    ///
    /// # Arguments
    ///
    /// * `config` - Database configuration
    /// * `sources` - Sources to declare; each must agree with any persisted
    ///   declaration of the same id
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the configuration is invalid
    /// - the file cannot be opened or is corrupted
    /// - a source id is empty or conflicts with a persisted declaration
    /// - no source is declared or recovered
    pub fn open(
        config: DatabaseConfig,
        sources: impl IntoIterator<Item = SourceDescriptor>,
    ) -> Result<Self> {
        Self::open_with(config, sources, false)
    }

    /// Opens the database in dynamic mode, where sources can be added later
    /// with [`add_source`](Self::add_source).
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open), except that opening without sources is
    /// allowed.
    pub fn open_dynamic(
        config: DatabaseConfig,
        sources: impl IntoIterator<Item = SourceDescriptor>,
    ) -> Result<Self> {
        Self::open_with(config, sources, true)
    }

    /// Opens an existing database file with default settings, recovering its
    /// sources.
    ///
    /// # Errors
    ///
    /// Fails like [`open`](Self::open); in particular a file with no
    /// persisted sources is rejected with [`SourceError::NoSources`].
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(DatabaseConfig::new(path.as_ref()), Vec::<SourceDescriptor>::new())
    }

    /// Opens an existing database file in dynamic mode, recovering its sources.
    ///
    /// # Errors
    ///
    /// Fails like [`open_dynamic`](Self::open_dynamic).
    pub fn open_existing_dynamic(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_dynamic(DatabaseConfig::new(path.as_ref()), Vec::<SourceDescriptor>::new())
    }

    fn open_with(
        config: DatabaseConfig,
        sources: impl IntoIterator<Item = SourceDescriptor>,
        dynamic: bool,
    ) -> Result<Self> {
        config.validate()?;
        let sources: Vec<SourceDescriptor> = sources.into_iter().collect();
        // Nothing can be recovered from a missing file; fail before creating it.
        if !dynamic && sources.is_empty() && !config.path.exists() {
            return Err(SourceError::NoSources.into());
        }
        let storage = Storage::open(&config.path, config.storage_options())?;
        let inner = Inner {
            storage,
            catalog: RwLock::new(Catalog::default()),
            config,
        };

        let mut recovered = 0;
        if let Some(bytes) = inner.storage.meta(CATALOG_KEY) {
            for descriptor in SourceRegistry::descriptors_from_bytes(&bytes)? {
                inner.declare(descriptor)?;
                recovered += 1;
            }
        }
        for descriptor in sources {
            inner.declare(descriptor)?;
        }

        let source_count = inner.catalog.read().registry.len();
        if !dynamic && source_count == 0 {
            return Err(SourceError::NoSources.into());
        }
        inner.storage.commit()?;

        let inner = Arc::new(inner);
        let sweeper = start_sweeper(&inner)?;

        info!(
            path = %inner.config.path.display(),
            sources = source_count,
            recovered,
            dynamic,
            "database opened"
        );

        Ok(Self {
            inner,
            sweeper: Mutex::new(Some(sweeper)),
            dynamic,
        })
    }

    /// Declares a new source on a dynamic database.
    ///
    /// Once this returns the source is fully usable. Declaring an existing
    /// source with the same kind is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotDynamic`] if the database was not opened in
    /// dynamic mode, [`SourceError::EmptyId`] for a blank id and
    /// [`SourceError::TypeConflict`] if the id exists with another kind.
    pub fn add_source(
        &self,
        id: impl Into<String>,
        kind: ScalarKind,
        description: Option<&str>,
    ) -> Result<()> {
        let id = id.into();
        if !self.dynamic {
            return Err(SourceError::NotDynamic { id }.into());
        }

        let mut descriptor = SourceDescriptor::new(id, kind);
        descriptor.description = description.map(str::to_string);
        let id = descriptor.id.clone();
        if self.inner.declare(descriptor)? {
            info!(source = %id, kind = %kind, "source added");
        }
        Ok(())
    }

    /// Writes one point. The write is persisted by the next commit.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotFound`] for an undeclared source,
    /// [`SourceError::TypeMismatch`] if the source is not of kind `T::KIND`,
    /// and a [`WriteError`](crate::error::WriteError) for a negative timestamp
    /// or a null opaque value.
    pub fn put<T: Scalar>(&self, id: &str, timestamp: i64, value: T) -> Result<()> {
        self.inner.writable::<T>(id)?.put(timestamp, value)
    }

    /// Writes one point and commits.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put), plus storage errors from the commit.
    pub fn put_and_commit<T: Scalar>(&self, id: &str, timestamp: i64, value: T) -> Result<()> {
        self.put(id, timestamp, value)?;
        self.commit()
    }

    /// Writes one value to an opaque source.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put).
    pub fn put_object(&self, id: &str, timestamp: i64, value: impl Into<ObjectValue>) -> Result<()> {
        self.put(id, timestamp, value.into())
    }

    /// Writes a batch of points and commits once.
    ///
    /// Every point is validated before anything is written, so an invalid
    /// point leaves the source untouched. Later points win over earlier points
    /// with the same timestamp. An empty batch does nothing. Returns the
    /// number of distinct timestamps written.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::InvalidBatchPoint`](crate::error::WriteError::InvalidBatchPoint)
    /// for the first invalid point, plus the errors of [`put`](Self::put).
    pub fn put_batch<T: Scalar>(
        &self,
        id: &str,
        points: impl IntoIterator<Item = DataPoint<T>>,
    ) -> Result<usize> {
        let series = self.inner.writable::<T>(id)?;
        batch::write(&self.inner.storage, &series, points)
    }

    /// Returns the value at exactly `timestamp`.
    ///
    /// Returns `None` if there is no value there or the source does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::TypeMismatch`] if the source is not of kind
    /// `T::KIND`.
    pub fn get<T: Scalar>(&self, id: &str, timestamp: i64) -> Result<Option<T>> {
        match self.inner.readable::<T>(id)? {
            Some(series) => series.get(timestamp),
            None => Ok(None),
        }
    }

    /// Returns the value of an opaque source at `timestamp`, down-cast to `U`.
    ///
    /// Returns `None` if there is no value, the source does not exist, or the
    /// value holds another type.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::TypeMismatch`] if the source is not opaque.
    pub fn get_as<U: FromObject>(&self, id: &str, timestamp: i64) -> Result<Option<U>> {
        match self.inner.readable::<ObjectValue>(id)? {
            Some(series) => series.get_as(timestamp),
            None => Ok(None),
        }
    }

    /// Returns the points with `start <= timestamp <= end`, ascending.
    ///
    /// An unknown source yields an empty result.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidTimeRange`] if `start > end` and
    /// [`SourceError::TypeMismatch`] if the source is not of kind `T::KIND`.
    pub fn range<T: Scalar>(&self, id: &str, start: i64, end: i64) -> Result<Vec<DataPoint<T>>> {
        check_range(start, end)?;
        match self.inner.readable::<T>(id)? {
            Some(series) => series.range(start, end),
            None => Ok(Vec::new()),
        }
    }

    /// Returns the points of an opaque source in `[start, end]` whose values
    /// down-cast to `U`. Points of other types are skipped.
    ///
    /// # Errors
    ///
    /// Same as [`range`](Self::range).
    pub fn range_as<U: FromObject>(
        &self,
        id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<DataPoint<U>>> {
        check_range(start, end)?;
        match self.inner.readable::<ObjectValue>(id)? {
            Some(series) => series.range_as(start, end),
            None => Ok(Vec::new()),
        }
    }

    /// Returns up to `count` of the most recent points, newest first.
    ///
    /// An unknown source yields an empty result.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidCount`] if `count` is zero and
    /// [`SourceError::TypeMismatch`] if the source is not of kind `T::KIND`.
    pub fn latest<T: Scalar>(&self, id: &str, count: usize) -> Result<Vec<DataPoint<T>>> {
        if count == 0 {
            return Err(QueryError::InvalidCount.into());
        }
        match self.inner.readable::<T>(id)? {
            Some(series) => series.latest(count),
            None => Ok(Vec::new()),
        }
    }

    /// Returns a handle to a source for repeated access.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotFound`] or [`SourceError::TypeMismatch`].
    pub fn series<T: Scalar>(&self, id: &str) -> Result<TypedSeries<T>> {
        self.inner.writable::<T>(id)
    }

    /// Persists every pending write of every source.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file cannot be written or the database
    /// is closed.
    pub fn commit(&self) -> Result<()> {
        self.inner.storage.commit()?;
        Ok(())
    }

    /// Runs one retention pass now, independent of the background schedule.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the pass cannot commit.
    pub fn sweep_now(&self) -> Result<SweepReport> {
        self.inner.sweep(&AtomicBool::new(false))
    }

    /// Returns the point count of every source, keyed `"<id> (<kind>)"`.
    pub fn statistics(&self) -> BTreeMap<String, usize> {
        let catalog = self.inner.catalog.read();
        catalog
            .registry
            .list()
            .map(|d| {
                let count = catalog
                    .stores
                    .erased(d.kind, &d.id)
                    .map_or(0, |map| map.entry_count());
                (format!("{} ({})", d.id, d.kind), count)
            })
            .collect()
    }

    /// Returns the total number of points across all sources.
    pub fn total_points(&self) -> usize {
        self.statistics().values().sum()
    }

    /// Returns the ids of all declared sources, sorted.
    pub fn source_ids(&self) -> Vec<String> {
        let catalog = self.inner.catalog.read();
        catalog.registry.list().map(|d| d.id.clone()).collect()
    }

    /// Returns the descriptor of a source.
    pub fn describe(&self, id: &str) -> Option<SourceDescriptor> {
        self.inner.catalog.read().registry.describe(id).cloned()
    }

    /// Returns the declared kind of a source.
    pub fn source_kind(&self, id: &str) -> Option<ScalarKind> {
        self.inner.catalog.read().registry.resolve(id)
    }

    /// Returns the size of the database file in bytes.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file metadata cannot be read.
    pub fn storage_size(&self) -> Result<u64> {
        self.inner.storage.file_size()
    }

    /// Returns `true` if sources can be added after open.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Returns the configuration the database was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Returns the path of the database file.
    pub fn path(&self) -> &Path {
        self.inner.storage.path()
    }

    /// Stops the sweeper, commits and closes the file.
    ///
    /// The sweeper gets a few seconds to finish a running pass before it is
    /// cancelled and detached. Calling `close` again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the error of the final commit; the database is closed either way.
    pub fn close(&self) -> Result<()> {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop(SHUTDOWN_GRACE);
        }
        if self.inner.storage.is_closed() {
            return Ok(());
        }
        self.inner.storage.close()?;
        info!(path = %self.inner.config.path.display(), "database closed");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "failed to close database on drop");
        }
    }
}

fn check_range(start: i64, end: i64) -> Result<()> {
    if start > end {
        return Err(QueryError::InvalidTimeRange { start, end }.into());
    }
    Ok(())
}

fn start_sweeper(inner: &Arc<Inner>) -> Result<Sweeper> {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    Sweeper::start(inner.config.cleanup_interval, move |cancel| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match inner.sweep(cancel) {
            Ok(report) => debug!(
                removed = report.total_removed(),
                failures = report.failures.len(),
                "scheduled sweep finished"
            ),
            Err(e) => warn!(error = %e, "scheduled sweep failed"),
        }
    })
}

/// Builder for [`Database`].
///
/// Errors are reported by [`build`](Self::build) and
/// [`build_dynamic`](Self::build_dynamic), not by the setters.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use tidemark::Database;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let db = Database::builder()
///     .path("./sensors.tdm")
///     .add_float32_source("temperature")
///     .add_object_source("events")
///     .cleanup_interval(Duration::from_secs(600))
///     .build_dynamic()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct DatabaseBuilder {
    path: Option<PathBuf>,
    sources: Vec<SourceDescriptor>,
    retention: Option<Duration>,
    cleanup_interval: Option<Duration>,
    concurrency_scale: Option<usize>,
    memory_mapping: Option<bool>,
    transactions: Option<bool>,
}

macro_rules! kind_shortcut {
    ($(#[$doc:meta])* $name:ident, $kind:ident) => {
        $(#[$doc])*
        pub fn $name(self, id: impl Into<String>) -> Self {
            self.add_source(id, ScalarKind::$kind, None)
        }
    };
}

impl DatabaseBuilder {
    /// Sets the path of the database file.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Declares a source.
    pub fn add_source(
        mut self,
        id: impl Into<String>,
        kind: ScalarKind,
        description: Option<&str>,
    ) -> Self {
        let mut descriptor = SourceDescriptor::new(id, kind);
        descriptor.description = description.map(str::to_string);
        self.sources.push(descriptor);
        self
    }

    kind_shortcut!(
        /// Declares a `float64` source.
        add_float64_source,
        Float64
    );
    kind_shortcut!(
        /// Declares an `int32` source.
        add_int32_source,
        Int32
    );
    kind_shortcut!(
        /// Declares an `int64` source.
        add_int64_source,
        Int64
    );
    kind_shortcut!(
        /// Declares a `float32` source.
        add_float32_source,
        Float32
    );
    kind_shortcut!(
        /// Declares an opaque source.
        add_object_source,
        Object
    );

    /// Sets the retention period in whole days.
    pub fn retention_days(mut self, days: u64) -> Self {
        self.retention = Some(Duration::from_secs(days.saturating_mul(SECONDS_PER_DAY)));
        self
    }

    /// Sets the retention period.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Sets the interval between retention sweeps.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Sets the storage lock-striping hint.
    pub fn concurrency_scale(mut self, scale: usize) -> Self {
        self.concurrency_scale = Some(scale);
        self
    }

    /// Enables or disables memory-mapped reads.
    pub fn memory_mapping(mut self, enabled: bool) -> Self {
        self.memory_mapping = Some(enabled);
        self
    }

    /// Enables or disables transactional commits.
    pub fn transactions(mut self, enabled: bool) -> Self {
        self.transactions = Some(enabled);
        self
    }

    /// Returns the configuration this builder would open with.
    pub fn config(&self) -> DatabaseConfig {
        let mut config = DatabaseConfig::new(self.path.clone().unwrap_or_default());
        if let Some(retention) = self.retention {
            config.retention = retention;
        }
        if let Some(interval) = self.cleanup_interval {
            config.cleanup_interval = interval;
        }
        if let Some(scale) = self.concurrency_scale {
            config.concurrency_scale = scale;
        }
        if let Some(enabled) = self.memory_mapping {
            config.memory_mapping = enabled;
        }
        if let Some(enabled) = self.transactions {
            config.transactions = enabled;
        }
        config
    }

    /// Opens a database with a fixed set of sources.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](crate::error::ConfigError) for a missing path or
    /// invalid settings, [`SourceError::NoSources`] if no source is declared or
    /// recovered, and any error of [`Database::open`].
    pub fn build(self) -> Result<Database> {
        Database::open(self.config(), self.sources)
    }

    /// Opens a database in dynamic mode.
    ///
    /// # Errors
    ///
    /// Same as [`build`](Self::build), except that no source is required.
    pub fn build_dynamic(self) -> Result<Database> {
        Database::open_dynamic(self.config(), self.sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, ErrorKind, TidemarkError, WriteError};
    use tempfile::tempdir;

    fn open_cpu(dir: &Path) -> Database {
        Database::builder()
            .path(dir.join("db.tdm"))
            .add_float64_source("cpu")
            .build()
            .unwrap()
    }

    #[test]
    fn test_put_get() {
        let dir = tempdir().unwrap();
        let db = open_cpu(dir.path());

        db.put("cpu", 1000, 42.5).unwrap();
        db.commit().unwrap();
        assert_eq!(db.get::<f64>("cpu", 1000).unwrap(), Some(42.5));
        assert_eq!(db.get::<f64>("cpu", 2000).unwrap(), None);
        assert_eq!(db.get::<f64>("missing", 1000).unwrap(), None);
    }

    #[test]
    fn test_put_to_unknown_source() {
        let dir = tempdir().unwrap();
        let db = open_cpu(dir.path());

        let err = db.put("mem", 1000, 1.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceNotFound);
    }

    #[test]
    fn test_type_mismatch() {
        let dir = tempdir().unwrap();
        let db = open_cpu(dir.path());

        let err = db.put("cpu", 1000, 5_i32).unwrap_err();
        assert!(matches!(
            err,
            TidemarkError::Source(SourceError::TypeMismatch {
                declared: ScalarKind::Float64,
                requested: ScalarKind::Int32,
                ..
            })
        ));
        assert_eq!(db.get::<i32>("cpu", 1000).unwrap_err().kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn test_builder_requires_sources() {
        let dir = tempdir().unwrap();
        let err = Database::builder()
            .path(dir.path().join("db.tdm"))
            .build()
            .unwrap_err();
        assert!(matches!(err, TidemarkError::Source(SourceError::NoSources)));
        assert!(!dir.path().join("db.tdm").exists());

        let db = Database::builder()
            .path(dir.path().join("db.tdm"))
            .build_dynamic()
            .unwrap();
        assert!(db.source_ids().is_empty());
    }

    #[test]
    fn test_open_existing_missing_file_leaves_no_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("typo.tdm");
        let err = Database::open_existing(&path).unwrap_err();
        assert!(matches!(err, TidemarkError::Source(SourceError::NoSources)));
        assert!(!path.exists());
    }

    #[test]
    fn test_huge_cleanup_interval_closes_promptly() {
        let dir = tempdir().unwrap();
        let db = Database::builder()
            .path(dir.path().join("db.tdm"))
            .add_float64_source("cpu")
            .cleanup_interval(Duration::from_secs(u64::MAX))
            .build()
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let started = std::time::Instant::now();
        db.close().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_builder_requires_path() {
        let err = Database::builder()
            .add_float64_source("cpu")
            .build()
            .unwrap_err();
        assert!(matches!(err, TidemarkError::Config(ConfigError::EmptyPath)));
    }

    #[test]
    fn test_builder_config() {
        let config = Database::builder()
            .path("x.tdm")
            .retention_days(2)
            .cleanup_interval(Duration::from_secs(60))
            .concurrency_scale(4)
            .memory_mapping(false)
            .transactions(false)
            .config();
        assert_eq!(config.retention, Duration::from_secs(2 * 86_400));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.concurrency_scale, 4);
        assert!(!config.memory_mapping);
        assert!(!config.transactions);
    }

    #[test]
    fn test_builder_retention_days_saturates() {
        let config = Database::builder().path("x.tdm").retention_days(u64::MAX).config();
        assert_eq!(config.retention, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_add_source_requires_dynamic() {
        let dir = tempdir().unwrap();
        let db = open_cpu(dir.path());

        let err = db.add_source("mem", ScalarKind::Int64, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(db.source_kind("mem"), None);
    }

    #[test]
    fn test_add_source_dynamic() {
        let dir = tempdir().unwrap();
        let db = Database::builder()
            .path(dir.path().join("db.tdm"))
            .build_dynamic()
            .unwrap();

        db.add_source("mem", ScalarKind::Int64, Some("resident bytes"))
            .unwrap();
        db.add_source("mem", ScalarKind::Int64, None).unwrap();
        db.put("mem", 5, 1024_i64).unwrap();

        assert_eq!(db.get::<i64>("mem", 5).unwrap(), Some(1024));
        assert_eq!(
            db.describe("mem").and_then(|d| d.description),
            Some("resident bytes".to_string())
        );

        let err = db.add_source("mem", ScalarKind::Float64, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeConflict);
    }

    #[test]
    fn test_range_validation_on_unknown_source() {
        let dir = tempdir().unwrap();
        let db = open_cpu(dir.path());

        assert!(db.range::<f64>("nope", 0, 10).unwrap().is_empty());
        assert!(matches!(
            db.range::<f64>("nope", 10, 0),
            Err(TidemarkError::Query(QueryError::InvalidTimeRange { .. }))
        ));
        assert!(matches!(
            db.latest::<f64>("nope", 0),
            Err(TidemarkError::Query(QueryError::InvalidCount))
        ));
        assert!(db.latest::<f64>("nope", 3).unwrap().is_empty());
    }

    #[test]
    fn test_put_batch_rejects_invalid_points() {
        let dir = tempdir().unwrap();
        let db = open_cpu(dir.path());

        let err = db
            .put_batch("cpu", vec![DataPoint::new(1, 1.0), DataPoint::new(-1, 2.0)])
            .unwrap_err();
        assert!(matches!(
            err,
            TidemarkError::Write(WriteError::InvalidBatchPoint { index: 1, .. })
        ));
        assert_eq!(db.total_points(), 0);
    }

    #[test]
    fn test_statistics_keys() {
        let dir = tempdir().unwrap();
        let db = Database::builder()
            .path(dir.path().join("db.tdm"))
            .add_float64_source("cpu")
            .add_object_source("log")
            .build()
            .unwrap();

        db.put("cpu", 1, 0.5).unwrap();
        db.put("cpu", 2, 0.6).unwrap();
        db.put_object("log", 1, "started").unwrap();

        let stats = db.statistics();
        assert_eq!(stats.get("cpu (float64)"), Some(&2));
        assert_eq!(stats.get("log (object)"), Some(&1));
        assert_eq!(db.total_points(), 3);
        assert_eq!(db.source_ids(), ["cpu", "log"]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = open_cpu(dir.path());
        db.put("cpu", 1, 1.0).unwrap();

        db.close().unwrap();
        db.close().unwrap();

        let err = db.put("cpu", 2, 2.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_put_and_commit() {
        let dir = tempdir().unwrap();
        let db = open_cpu(dir.path());
        db.put_and_commit("cpu", 7, 0.7).unwrap();
        assert!(!db.inner.storage.is_dirty());
    }
}
