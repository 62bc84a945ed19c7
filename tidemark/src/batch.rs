//! Batch ingestion.
//!
//! A batch is validated in full before anything is written. Valid points are
//! collected into a timestamp-keyed map, so the last point for a repeated
//! timestamp wins, inserted into the source's map in one step, and followed by
//! a single commit.
//!
//! The commit covers the whole database. A batch commit may therefore also
//! persist writes other threads have made to other sources and not yet
//! committed themselves.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Result, WriteError};
use crate::kind::{DataPoint, Scalar};
use crate::storage::Storage;
use crate::typed::{TypedSeries, check_point};

/// Validates every point and deduplicates by timestamp.
///
/// # Errors
///
/// Returns [`WriteError::InvalidBatchPoint`] naming the first invalid point.
pub(crate) fn prepare<T, I>(points: I) -> std::result::Result<BTreeMap<i64, T>, WriteError>
where
    T: Scalar,
    I: IntoIterator<Item = DataPoint<T>>,
{
    let mut batch = BTreeMap::new();
    for (index, point) in points.into_iter().enumerate() {
        check_point(point.timestamp, &point.value).map_err(|source| {
            WriteError::InvalidBatchPoint {
                index,
                source: Box::new(source),
            }
        })?;
        batch.insert(point.timestamp, point.value);
    }
    Ok(batch)
}

/// Writes a batch to `series` and commits `storage`.
///
/// Returns the number of distinct timestamps written. An empty batch writes
/// nothing and does not commit.
pub(crate) fn write<T, I>(storage: &Storage, series: &TypedSeries<T>, points: I) -> Result<usize>
where
    T: Scalar,
    I: IntoIterator<Item = DataPoint<T>>,
{
    let batch = prepare(points)?;
    if batch.is_empty() {
        return Ok(0);
    }

    let written = batch.len();
    series.put_all(batch)?;
    storage.commit()?;

    debug!(source = series.id(), kind = %T::KIND, points = written, "batch written");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TidemarkError;
    use crate::object::ObjectValue;
    use crate::registry::SourceDescriptor;
    use crate::storage::StorageOptions;
    use crate::typed::Stores;
    use tempfile::tempdir;

    fn setup<T: Scalar>(dir: &std::path::Path) -> (Storage, TypedSeries<T>) {
        let storage = Storage::open(dir.join("db"), StorageOptions::default()).unwrap();
        let mut stores = Stores::default();
        stores
            .open(&storage, &SourceDescriptor::new("s", T::KIND))
            .unwrap();
        let series = stores.typed::<T>().series("s").unwrap();
        (storage, series)
    }

    #[test]
    fn test_prepare_last_duplicate_wins() {
        let batch = prepare(vec![
            DataPoint::new(10, 1.0),
            DataPoint::new(20, 2.0),
            DataPoint::new(10, 3.0),
        ])
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.get(&10), Some(&3.0));
    }

    #[test]
    fn test_prepare_reports_offending_index() {
        let err = prepare(vec![
            DataPoint::new(1, 1_i32),
            DataPoint::new(2, 2),
            DataPoint::new(-3, 3),
        ])
        .unwrap_err();
        match err {
            WriteError::InvalidBatchPoint { index, source } => {
                assert_eq!(index, 2);
                assert!(matches!(
                    *source,
                    WriteError::NegativeTimestamp { timestamp: -3 }
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_batch_leaves_store_unmodified() {
        let dir = tempdir().unwrap();
        let (storage, series) = setup::<ObjectValue>(dir.path());

        let err = write(
            &storage,
            &series,
            vec![
                DataPoint::new(1, ObjectValue::from("a")),
                DataPoint::new(2, ObjectValue::Json(serde_json::Value::Null)),
            ],
        )
        .unwrap_err();

        assert!(matches!(
            err,
            TidemarkError::Write(WriteError::InvalidBatchPoint { index: 1, .. })
        ));
        assert!(series.is_empty());
    }

    #[test]
    fn test_write_commits_once() {
        let dir = tempdir().unwrap();
        let (storage, series) = setup::<i64>(dir.path());
        storage.commit().unwrap();

        let points: Vec<DataPoint<i64>> = (0..100).map(|i| DataPoint::new(i, i * 2)).collect();
        assert_eq!(write(&storage, &series, points).unwrap(), 100);
        assert!(!storage.is_dirty());
        assert_eq!(series.len(), 100);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let dir = tempdir().unwrap();
        let (storage, series) = setup::<f32>(dir.path());
        series.put(5, 1.0).unwrap();

        assert_eq!(write(&storage, &series, Vec::new()).unwrap(), 0);
        assert!(storage.is_dirty());
    }
}
