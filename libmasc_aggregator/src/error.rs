use std::path::PathBuf;
use thiserror::Error;

use super::worker_status::WorkerStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BinWidthError {
    #[error("Bin width description is empty")]
    Empty,
    #[error("Bin width description {0:?} has a number with no h, m, or s unit")]
    MissingUnit(String),
    #[error("Bin width description {0:?} contains unit {1:?}; only h, m, and s are allowed")]
    BadUnit(String, char),
    #[error("Bin width description {0:?} contains an unparsable number {1:?}")]
    BadNumber(String, String),
    #[error("Bin width of {0} seconds is outside the range [1, 3600]")]
    OutOfRange(i64),
    #[error("Bin width of {0} seconds does not divide an hour (3600 seconds) exactly")]
    DoesNotDivideHour(u32),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("Config has invalid bin width: {0}")]
    BinWidth(#[from] BinWidthError),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Ingest failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Ingest could not open input file {0:?} because it does not exist")]
    BadFilePath(PathBuf),
    #[error("Ingest found {found} columns on line {line}; expected {expected}")]
    BadColumnCount {
        line: usize,
        found: usize,
        expected: usize,
    },
    #[error("Ingest failed to parse column {column} on line {line}: {value:?}")]
    BadValue {
        line: usize,
        column: &'static str,
        value: String,
    },
    #[error("Ingest failed to parse the capture time on line {line}: {source}")]
    BadTimestamp {
        line: usize,
        source: time::error::Parse,
    },
    #[error("Ingest found an empty input file (no header row)")]
    NoHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    #[error("Time bin centered at {center} used {filtered} particles but the feature average reports {reported}")]
    CountMismatch {
        center: String,
        filtered: usize,
        reported: usize,
    },
    #[error("Time bin centered at {center} could not average its particles: {reason}")]
    AverageRejected { center: String, reason: String },
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Record formatting failed to format a timestamp: {0}")]
    TimestampFormat(#[from] time::error::Format),
}

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("OrderedWriter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("OrderedWriter received index {0} more than once")]
    DuplicateIndex(usize),
    #[error("OrderedWriter timed out waiting for buffer space to submit index {index} (waiting on index {waiting_on})")]
    SubmitTimeout { index: usize, waiting_on: usize },
    #[error("OrderedWriter lock was poisoned by a panicking worker")]
    Poisoned,
    #[error("OrderedWriter is still shared and cannot be consumed")]
    StillShared,
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to Ingest error: {0}")]
    IngestError(#[from] IngestError),
    #[error("Processor failed due to Record error: {0}")]
    RecordError(#[from] RecordError),
    #[error("Processor failed due to OrderedWriter error: {0}")]
    WriterError(#[from] WriterError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Processor failed because worker {0} panicked")]
    WorkerPanicked(usize),
}
