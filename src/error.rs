//! Error types for capflow.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::Generation;

/// Main error type for capflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Error starting or supervising a decoder subprocess
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Error reading the decoder's structural output
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Error reading or writing the persisted artifact cache
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// The loader's control task is gone
    #[error("Loader has shut down")]
    Shutdown,

    /// The request was superseded by a newer generation before it finished
    #[error("Generation {0} was superseded")]
    Superseded(Generation),

    /// The load was stopped on request; its generation is still current
    #[error("Generation {0} was stopped")]
    Stopped(Generation),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the process runner.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The binary could not be started (missing, not executable, ...)
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An empty pipeline was requested
    #[error("Pipeline has no stages")]
    EmptyPipeline,

    /// The operation needs a running process and there is none
    #[error("Process not started")]
    NotStarted,

    /// A stage exited with a failure status or was killed by a signal
    #[error("{program} exited abnormally ({status}): {stderr_tail}")]
    AbnormalExit {
        program: String,
        status: String,
        stderr_tail: String,
    },

    /// I/O error while waiting on or talking to a stage
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the structural parser.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The stream ended inside a record
    #[error("Stream ended inside a <{element}> record at byte {position}")]
    Truncated { element: String, position: usize },

    /// A record was not well-formed
    #[error("Malformed input at byte {position}: {reason}")]
    Malformed { position: usize, reason: String },

    /// Too many malformed fragments in a row to keep resynchronising
    #[error("Gave up after {count} consecutive errors at byte {position}")]
    TooManyErrors { count: usize, position: usize },

    /// I/O error reading the stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the persisted artifact cache.
///
/// None of these reach the user: the loader logs them and carries on with an
/// empty cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Missing magic or unknown format tag
    #[error("Unsupported cache format: {reason}")]
    Format { reason: String },

    /// The source changed since the cache was written
    #[error("Cache for {path} is stale")]
    Stale { path: PathBuf },

    /// A record could not be decoded
    #[error("Corrupt cache record: {0}")]
    Record(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// TOML syntax or type error
    #[error("Invalid config syntax: {0}")]
    Syntax(#[from] toml::de::Error),

    /// A value is out of range
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// I/O error
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
