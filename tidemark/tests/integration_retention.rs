//! Integration tests for retention sweeping.
//!
//! These tests verify that a sweep removes exactly the points older than
//! `now - retention`, that it covers every kind of source, and that the
//! background sweeper runs on its own schedule and stops on close.

use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;
use tidemark::retention::now_millis;
use tidemark::{DataPoint, Database};

const HOUR_MS: i64 = 60 * 60 * 1000;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Routes sweeper logs to the test harness; set `RUST_LOG=tidemark=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn test_sweep_keeps_points_inside_retention() {
    init_tracing();
    let dir = tempdir().unwrap();
    let db = Database::builder()
        .path(dir.path().join("db.tdm"))
        .add_float64_source("temp")
        .retention_days(1)
        .build()
        .unwrap();

    let now = now_millis();
    db.put("temp", now - 2 * DAY_MS, 1.0).unwrap();
    db.put("temp", now - 12 * HOUR_MS, 2.0).unwrap();
    db.put("temp", now, 3.0).unwrap();
    db.commit().unwrap();

    let report = db.sweep_now().unwrap();
    assert_eq!(report.total_removed(), 1);
    assert!(report.failures.is_empty());

    let remaining: Vec<i64> = db
        .range::<f64>("temp", 0, i64::MAX)
        .unwrap()
        .iter()
        .map(|p| p.timestamp)
        .collect();
    assert_eq!(remaining, vec![now - 12 * HOUR_MS, now]);
}

#[test]
fn test_sweep_covers_every_kind() {
    let dir = tempdir().unwrap();
    let db = Database::builder()
        .path(dir.path().join("db.tdm"))
        .add_float64_source("a")
        .add_int32_source("b")
        .add_int64_source("c")
        .add_float32_source("d")
        .add_object_source("e")
        .retention_days(1)
        .build()
        .unwrap();

    let old = now_millis() - 3 * DAY_MS;
    db.put("a", old, 1.0_f64).unwrap();
    db.put("b", old, 1_i32).unwrap();
    db.put("c", old, 1_i64).unwrap();
    db.put("d", old, 1.0_f32).unwrap();
    db.put_object("e", old, "stale").unwrap();

    let report = db.sweep_now().unwrap();
    assert_eq!(report.removed.len(), 5);
    assert_eq!(report.total_removed(), 5);
    assert_eq!(db.total_points(), 0);
}

#[test]
fn test_sweep_on_empty_database_is_harmless() {
    let dir = tempdir().unwrap();
    let db = Database::builder()
        .path(dir.path().join("db.tdm"))
        .add_int64_source("c")
        .build()
        .unwrap();

    let report = db.sweep_now().unwrap();
    assert_eq!(report.total_removed(), 0);
    assert!(!report.cancelled);
}

#[test]
fn test_sweep_result_is_persisted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.tdm");
    let now = now_millis();

    {
        let db = Database::builder()
            .path(&path)
            .add_int32_source("hits")
            .retention_days(1)
            .build()
            .unwrap();
        db.put_batch(
            "hits",
            vec![
                DataPoint::new(now - 5 * DAY_MS, 1),
                DataPoint::new(now - HOUR_MS, 2),
            ],
        )
        .unwrap();
        db.sweep_now().unwrap();
    }

    let db = Database::open_existing(&path).unwrap();
    assert_eq!(db.statistics().get("hits (int32)"), Some(&1));
}

#[test]
fn test_background_sweeper_runs_on_schedule() {
    init_tracing();
    let dir = tempdir().unwrap();
    let db = Database::builder()
        .path(dir.path().join("db.tdm"))
        .add_float64_source("temp")
        .retention_days(1)
        .cleanup_interval(Duration::from_millis(20))
        .build()
        .unwrap();

    let now = now_millis();
    db.put("temp", now - 2 * DAY_MS, 1.0).unwrap();
    db.put("temp", now, 2.0).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while db.total_points() > 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(db.total_points(), 1);
    assert_eq!(db.get::<f64>("temp", now).unwrap(), Some(2.0));

    let started = Instant::now();
    db.close().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_close_with_idle_sweeper_is_prompt() {
    let dir = tempdir().unwrap();
    let db = Database::builder()
        .path(dir.path().join("db.tdm"))
        .add_float64_source("temp")
        .cleanup_interval(Duration::from_secs(3600))
        .build()
        .unwrap();

    let started = Instant::now();
    db.close().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}
