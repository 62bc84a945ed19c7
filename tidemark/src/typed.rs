//! Typed stores.
//!
//! There is one [`TypedStore`] per [`ScalarKind`], each owning the physical
//! maps of the sources declared with that kind. A resolved source is handed
//! out as a [`TypedSeries`], which carries the write validation and the read
//! queries for one source.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{QueryError, Result, WriteError};
use crate::kind::{DataPoint, Scalar, ScalarKind};
use crate::object::{FromObject, ObjectValue};
use crate::registry::SourceDescriptor;
use crate::storage::{ErasedMap, OrderedMap, Storage};

/// Returns the name of the physical map backing a source.
pub(crate) fn map_name(kind: ScalarKind, id: &str) -> String {
    format!("{kind}:{id}")
}

/// Rejects timestamps below zero.
pub(crate) fn check_timestamp(timestamp: i64) -> std::result::Result<(), WriteError> {
    if timestamp < 0 {
        return Err(WriteError::NegativeTimestamp { timestamp });
    }
    Ok(())
}

/// Validates a single point for writing.
pub(crate) fn check_point<T: Scalar>(
    timestamp: i64,
    value: &T,
) -> std::result::Result<(), WriteError> {
    check_timestamp(timestamp)?;
    value.check(timestamp)
}

/// The maps of every source of kind `T::KIND`.
#[derive(Debug)]
pub struct TypedStore<T: Scalar> {
    maps: HashMap<String, Arc<OrderedMap<T>>>,
}

impl<T: Scalar> Default for TypedStore<T> {
    fn default() -> Self {
        Self {
            maps: HashMap::new(),
        }
    }
}

impl<T: Scalar> TypedStore<T> {
    /// Opens the map for `id`. Opening an already open source is a no-op.
    pub(crate) fn open(&mut self, storage: &Storage, id: &str) -> Result<()> {
        if self.maps.contains_key(id) {
            return Ok(());
        }
        let map = storage.open_map::<T>(&map_name(T::KIND, id))?;
        self.maps.insert(id.to_string(), map);
        Ok(())
    }

    /// Returns the series for `id`, if that source is open in this store.
    pub fn series(&self, id: &str) -> Option<TypedSeries<T>> {
        self.maps.get(id).map(|map| TypedSeries {
            id: id.to_string(),
            map: Arc::clone(map),
        })
    }

    /// Returns the number of sources in this store.
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Returns `true` if no source of this kind is open.
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    fn erased(&self, id: &str) -> Option<Arc<dyn ErasedMap>> {
        self.maps
            .get(id)
            .map(|map| Arc::clone(map) as Arc<dyn ErasedMap>)
    }
}

/// One typed store per scalar kind.
#[derive(Debug, Default)]
pub struct Stores {
    pub(crate) float64: TypedStore<f64>,
    pub(crate) int32: TypedStore<i32>,
    pub(crate) int64: TypedStore<i64>,
    pub(crate) float32: TypedStore<f32>,
    pub(crate) object: TypedStore<ObjectValue>,
}

impl Stores {
    /// Opens the map for a declared source in the store of its kind.
    pub(crate) fn open(&mut self, storage: &Storage, descriptor: &SourceDescriptor) -> Result<()> {
        let id = descriptor.id.as_str();
        match descriptor.kind {
            ScalarKind::Float64 => self.float64.open(storage, id),
            ScalarKind::Int32 => self.int32.open(storage, id),
            ScalarKind::Int64 => self.int64.open(storage, id),
            ScalarKind::Float32 => self.float32.open(storage, id),
            ScalarKind::Object => self.object.open(storage, id),
        }
    }

    /// Returns the store for `T`.
    pub fn typed<T: Scalar>(&self) -> &TypedStore<T> {
        T::store(self)
    }

    /// Returns the kind-erased map of a source.
    pub(crate) fn erased(&self, kind: ScalarKind, id: &str) -> Option<Arc<dyn ErasedMap>> {
        match kind {
            ScalarKind::Float64 => self.float64.erased(id),
            ScalarKind::Int32 => self.int32.erased(id),
            ScalarKind::Int64 => self.int64.erased(id),
            ScalarKind::Float32 => self.float32.erased(id),
            ScalarKind::Object => self.object.erased(id),
        }
    }
}

/// A handle to one source's data.
///
/// Handles are cheap to clone and stay valid for the life of the database;
/// every operation fails with a storage error once it is closed.
#[derive(Debug, Clone)]
pub struct TypedSeries<T: Scalar> {
    id: String,
    map: Arc<OrderedMap<T>>,
}

impl<T: Scalar> TypedSeries<T> {
    /// Returns the source id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Writes one point, replacing any value at the same timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::NegativeTimestamp`] for `timestamp < 0`,
    /// [`WriteError::NullValue`] for a null opaque value, and a storage error
    /// if the database is closed.
    pub fn put(&self, timestamp: i64, value: T) -> Result<()> {
        check_point(timestamp, &value)?;
        self.map.put(timestamp, value)
    }

    /// Writes already validated points in one step.
    pub(crate) fn put_all(&self, points: BTreeMap<i64, T>) -> Result<()> {
        self.map.put_all(points)
    }

    /// Returns the value at exactly `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database is closed.
    pub fn get(&self, timestamp: i64) -> Result<Option<T>> {
        self.map.get(timestamp)
    }

    /// Returns the points with `start <= timestamp <= end`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidTimeRange`] if `start > end`.
    pub fn range(&self, start: i64, end: i64) -> Result<Vec<DataPoint<T>>> {
        if start > end {
            return Err(QueryError::InvalidTimeRange { start, end }.into());
        }
        Ok(self
            .map
            .range(start, end)?
            .into_iter()
            .map(DataPoint::from)
            .collect())
    }

    /// Returns up to `count` points with the greatest timestamps, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidCount`] if `count` is zero.
    pub fn latest(&self, count: usize) -> Result<Vec<DataPoint<T>>> {
        if count == 0 {
            return Err(QueryError::InvalidCount.into());
        }

        let mut points = Vec::new();
        let mut cursor = self.map.last_entry()?;
        while let Some((timestamp, value)) = cursor {
            points.push(DataPoint::new(timestamp, value));
            if points.len() == count {
                break;
            }
            cursor = self.map.lower_entry(timestamp)?;
        }
        Ok(points)
    }

    /// Returns the number of stored points.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the source holds no points.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl TypedSeries<ObjectValue> {
    /// Returns the value at `timestamp` down-cast to `U`.
    ///
    /// `None` if there is no value or it holds another type.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database is closed.
    pub fn get_as<U: FromObject>(&self, timestamp: i64) -> Result<Option<U>> {
        Ok(self.get(timestamp)?.and_then(|value| U::from_object(&value)))
    }

    /// Returns the points in `[start, end]` whose values down-cast to `U`.
    ///
    /// Points holding another type are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidTimeRange`] if `start > end`.
    pub fn range_as<U: FromObject>(&self, start: i64, end: i64) -> Result<Vec<DataPoint<U>>> {
        Ok(self
            .range(start, end)?
            .into_iter()
            .filter_map(|point| {
                U::from_object(&point.value).map(|value| DataPoint::new(point.timestamp, value))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TidemarkError;
    use crate::storage::StorageOptions;
    use tempfile::tempdir;

    fn series<T: Scalar>(storage: &Storage, id: &str) -> TypedSeries<T> {
        let mut stores = Stores::default();
        stores
            .open(storage, &SourceDescriptor::new(id, T::KIND))
            .unwrap();
        stores.typed::<T>().series(id).unwrap()
    }

    #[test]
    fn test_put_get() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db"), StorageOptions::default()).unwrap();
        let cpu = series::<f64>(&storage, "cpu");

        cpu.put(1000, 42.5).unwrap();
        cpu.put(1000, 43.0).unwrap();
        assert_eq!(cpu.get(1000).unwrap(), Some(43.0));
        assert_eq!(cpu.get(999).unwrap(), None);
        assert_eq!(cpu.len(), 1);
    }

    #[test]
    fn test_negative_timestamp_rejected() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db"), StorageOptions::default()).unwrap();
        let count = series::<i32>(&storage, "count");

        let err = count.put(-1, 5).unwrap_err();
        assert!(matches!(
            err,
            TidemarkError::Write(WriteError::NegativeTimestamp { timestamp: -1 })
        ));
        assert!(count.is_empty());

        count.put(0, 5).unwrap();
        assert_eq!(count.get(0).unwrap(), Some(5));
    }

    #[test]
    fn test_range_inclusive_and_ordered() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db"), StorageOptions::default()).unwrap();
        let mem = series::<i64>(&storage, "mem");

        for i in (0..10).rev() {
            mem.put(i * 1000, i).unwrap();
        }

        let points = mem.range(2000, 8000).unwrap();
        assert_eq!(points.len(), 7);
        assert_eq!(points.first().map(|p| p.timestamp), Some(2000));
        assert_eq!(points.last().map(|p| p.timestamp), Some(8000));
        assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        assert!(mem.range(100, 100).unwrap().is_empty());
        assert_eq!(mem.range(3000, 3000).unwrap(), vec![DataPoint::new(3000, 3)]);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db"), StorageOptions::default()).unwrap();
        let mem = series::<i64>(&storage, "mem");

        let err = mem.range(10, 5).unwrap_err();
        assert!(matches!(
            err,
            TidemarkError::Query(QueryError::InvalidTimeRange { start: 10, end: 5 })
        ));
    }

    #[test]
    fn test_latest_descending() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db"), StorageOptions::default()).unwrap();
        let temp = series::<f32>(&storage, "temp");

        for i in 0..10 {
            temp.put(100 + i, i as f32).unwrap();
        }

        let stamps: Vec<i64> = temp.latest(5).unwrap().iter().map(|p| p.timestamp).collect();
        assert_eq!(stamps, vec![109, 108, 107, 106, 105]);
        assert_eq!(temp.latest(50).unwrap().len(), 10);
        assert!(matches!(
            temp.latest(0),
            Err(TidemarkError::Query(QueryError::InvalidCount))
        ));
    }

    #[test]
    fn test_latest_on_empty_source() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db"), StorageOptions::default()).unwrap();
        let temp = series::<f32>(&storage, "temp");
        assert!(temp.latest(3).unwrap().is_empty());
    }

    #[test]
    fn test_object_downcasts() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db"), StorageOptions::default()).unwrap();
        let events = series::<ObjectValue>(&storage, "events");

        events.put(1, ObjectValue::from("boot")).unwrap();
        events.put(2, ObjectValue::from(7_i64)).unwrap();
        events.put(3, ObjectValue::from("ready")).unwrap();

        assert_eq!(events.get_as::<String>(1).unwrap(), Some("boot".to_string()));
        assert_eq!(events.get_as::<f64>(1).unwrap(), None);

        let texts: Vec<String> = events
            .range_as::<String>(0, 10)
            .unwrap()
            .into_iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(texts, ["boot", "ready"]);

        let err = events
            .put(4, ObjectValue::Json(serde_json::Value::Null))
            .unwrap_err();
        assert!(matches!(
            err,
            TidemarkError::Write(WriteError::NullValue { timestamp: 4 })
        ));
    }

    #[test]
    fn test_map_names_are_kind_scoped() {
        assert_eq!(map_name(ScalarKind::Int32, "errors"), "int32:errors");
    }
}
