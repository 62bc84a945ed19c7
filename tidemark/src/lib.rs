//! # tidemark
//!
//! Embedded, typed, multi-source time-series store.
//!
//! tidemark is a library for keeping many independent named sources of
//! timestamped scalar readings in a single file inside the host process.
//! Each source is declared with one value kind, writes are checked against
//! that kind, and data older than the retention period is removed by a
//! background sweeper.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Five value kinds: `f64`, `i32`, `i64`, `f32` and an opaque [`ObjectValue`]
//! - Kind checks at run time, typed accessors at compile time
//! - Sources can be added while the database is live (dynamic mode)
//! - Validate-everything-first batch writes with a single commit
//! - Single-file persistence with checksummed, atomically replaced snapshots
//! - Background retention sweep, isolated per source
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tidemark::{Database, ObjectValue};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::builder()
//!     .path("./metrics.tdm")
//!     .add_float64_source("cpu.usage")
//!     .add_object_source("events")
//!     .retention_days(30)
//!     .build()?;
//!
//! db.put("cpu.usage", 1_700_000_000_000, 85.5)?;
//! db.put_object("events", 1_700_000_000_000, "deploy finished")?;
//! db.commit()?;
//!
//! for point in db.range::<f64>("cpu.usage", 0, i64::MAX)? {
//!     println!("{}: {}", point.timestamp, point.value);
//! }
//! let note: Option<String> = db.get_as("events", 1_700_000_000_000)?;
//! assert_eq!(note.as_deref(), Some("deploy finished"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Database`]: Top-level handle; opens a file, owns sources and the sweeper
//! - [`DatabaseConfig`]: Path, retention, sweep interval and storage options
//! - [`ScalarKind`] and [`Scalar`]: The closed set of value kinds
//! - [`DataPoint`]: A `(timestamp, value)` pair
//!
//! ## Modules
//!
//! - [`database`]: Lifecycle, typed reads and writes, dynamic sources
//! - [`config`]: Configuration and validation
//! - [`registry`]: Source declarations
//! - [`typed`]: Per-kind stores and series handles
//! - [`retention`]: Sweep passes and the background sweeper
//! - [`storage`]: File-backed ordered maps
//! - [`kind`] and [`object`]: Value kinds and opaque payloads
//! - [`error`]: Error types

mod batch;
pub mod config;
pub mod database;
pub mod error;
pub mod kind;
pub mod object;
pub mod registry;
pub mod retention;
pub mod storage;
pub mod typed;

// Re-export primary API types at crate root for convenience.
pub use config::DatabaseConfig;
pub use database::{Database, DatabaseBuilder};
pub use error::{ErrorKind, Result, TidemarkError};
pub use kind::{DataPoint, Scalar, ScalarKind};
pub use object::{FromObject, ObjectValue};
pub use registry::SourceDescriptor;
pub use retention::SweepReport;
pub use typed::TypedSeries;
