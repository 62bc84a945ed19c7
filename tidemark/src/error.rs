//! Error types for the Tidemark time-series store.

use std::time::Duration;

use thiserror::Error;

use crate::kind::ScalarKind;

/// The main error type for all Tidemark operations.
///
/// Each variant wraps the error enum of one area of the store. Use
/// [`TidemarkError::kind`] to classify an error without matching on the
/// nested enums.
#[derive(Error, Debug)]
pub enum TidemarkError {
    /// Invalid database configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error declaring, resolving, or addressing a source.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Error during a put or batch put (write path).
    #[error("write error: {0}")]
    Write(#[from] WriteError),

    /// Error during a range or latest query (read path).
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Error raised by the persistence layer.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Coarse classification of a [`TidemarkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A caller-supplied argument or configuration value was rejected.
    InvalidArgument,
    /// The operation named a source that was never declared.
    SourceNotFound,
    /// A typed accessor was used against a source of another kind.
    TypeMismatch,
    /// A source was re-declared with a different kind.
    TypeConflict,
    /// The operation is not permitted on this database instance.
    UnsupportedOperation,
    /// The persistence layer failed. Not retried by the store.
    Io,
}

impl TidemarkError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Write(_) | Self::Query(_) => ErrorKind::InvalidArgument,
            Self::Source(err) => match err {
                SourceError::EmptyId => ErrorKind::InvalidArgument,
                SourceError::NotFound { .. } => ErrorKind::SourceNotFound,
                SourceError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
                SourceError::TypeConflict { .. } => ErrorKind::TypeConflict,
                SourceError::NotDynamic { .. } => ErrorKind::UnsupportedOperation,
                SourceError::NoSources => ErrorKind::InvalidArgument,
            },
            Self::Storage(_) => ErrorKind::Io,
        }
    }
}

/// Errors raised while validating a [`DatabaseConfig`](crate::config::DatabaseConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The database path is empty or blank.
    #[error("database path cannot be empty")]
    EmptyPath,

    /// The retention period is zero.
    #[error("retention period must be > 0, got {retention:?}")]
    InvalidRetention {
        /// The rejected retention period.
        retention: Duration,
    },

    /// The cleanup interval is zero.
    #[error("cleanup interval must be > 0, got {interval:?}")]
    InvalidCleanupInterval {
        /// The rejected interval.
        interval: Duration,
    },

    /// The concurrency scale is zero.
    #[error("concurrency scale must be > 0, got {scale}")]
    InvalidConcurrencyScale {
        /// The rejected scale.
        scale: usize,
    },

    /// A config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// The config file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A config document could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors concerning source identity and declared kinds.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The source identifier is empty or blank.
    #[error("source id cannot be empty")]
    EmptyId,

    /// No source with this identifier has been declared.
    #[error("source '{id}' does not exist")]
    NotFound {
        /// The unknown source id.
        id: String,
    },

    /// The accessor's kind differs from the source's declared kind.
    #[error("source '{id}' holds {declared} values, accessor expects {requested}")]
    TypeMismatch {
        /// The source id.
        id: String,
        /// The kind the source was declared with.
        declared: ScalarKind,
        /// The kind of the accessor that was used.
        requested: ScalarKind,
    },

    /// The source already exists with a different kind.
    #[error("source '{id}' already declared as {existing}, cannot redeclare as {requested}")]
    TypeConflict {
        /// The source id.
        id: String,
        /// The kind already on record.
        existing: ScalarKind,
        /// The conflicting kind.
        requested: ScalarKind,
    },

    /// Sources can only be added after open on a dynamic database.
    #[error("cannot add source '{id}': database was not opened in dynamic mode")]
    NotDynamic {
        /// The source id that was rejected.
        id: String,
    },

    /// A non-dynamic database was opened without any source.
    #[error("at least one source must be declared")]
    NoSources,
}

/// Errors that can occur on the write path.
#[derive(Error, Debug)]
pub enum WriteError {
    /// The timestamp is negative.
    #[error("timestamp {timestamp} is negative")]
    NegativeTimestamp {
        /// The rejected timestamp.
        timestamp: i64,
    },

    /// The value is null (opaque kind only).
    #[error("value at timestamp {timestamp} is null")]
    NullValue {
        /// Timestamp of the rejected value.
        timestamp: i64,
    },

    /// One point of a batch failed validation; nothing was written.
    #[error("batch point {index} rejected: {source}")]
    InvalidBatchPoint {
        /// Position of the offending point in the batch.
        index: usize,
        /// Why the point was rejected.
        #[source]
        source: Box<WriteError>,
    },
}

/// Errors that can occur on the read path.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The time range is inverted.
    #[error("invalid time range: start {start} > end {end}")]
    InvalidTimeRange {
        /// The start of the range.
        start: i64,
        /// The end of the range.
        end: i64,
    },

    /// The requested number of points is zero.
    #[error("count must be > 0")]
    InvalidCount,
}

/// Errors raised by the file-backed storage engine.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Reading, writing, or syncing the database file failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// The file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The database file failed header or checksum validation.
    #[error("database file '{path}' is corrupted: {reason}")]
    Corrupted {
        /// The file path.
        path: String,
        /// Description of the corruption.
        reason: String,
    },

    /// Encoding or decoding a map payload failed.
    #[error("failed to encode or decode map '{name}': {source}")]
    Codec {
        /// The map name.
        name: String,
        /// The underlying bincode error.
        #[source]
        source: bincode::Error,
    },

    /// A stored map was written with a different value codec.
    #[error("map '{name}' was stored with codec '{stored}', requested '{requested}'")]
    CodecMismatch {
        /// The map name.
        name: String,
        /// The codec recorded in the file.
        stored: String,
        /// The codec of the requested handle.
        requested: String,
    },

    /// The storage has been closed.
    #[error("storage is closed")]
    Closed,
}

/// Type alias for `Result<T, TidemarkError>`.
pub type Result<T> = std::result::Result<T, TidemarkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let err: TidemarkError = SourceError::NotFound { id: "x".to_string() }.into();
        assert_eq!(err.kind(), ErrorKind::SourceNotFound);

        let err: TidemarkError = SourceError::TypeConflict {
            id: "x".to_string(),
            existing: ScalarKind::Float64,
            requested: ScalarKind::Int32,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::TypeConflict);

        let err: TidemarkError = SourceError::NotDynamic { id: "x".to_string() }.into();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);

        let err: TidemarkError = QueryError::InvalidCount.into();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err: TidemarkError = StorageError::Closed.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_batch_error_message_names_index() {
        let err = WriteError::InvalidBatchPoint {
            index: 3,
            source: Box::new(WriteError::NegativeTimestamp { timestamp: -5 }),
        };
        let msg = err.to_string();
        assert!(msg.contains("batch point 3"));
        assert!(msg.contains("-5"));
    }
}
