use thiserror::Error;

/// Top-level domain error surfaced to the CLI.
#[derive(Debug, Error, Clone)]
pub enum AquaError {
    #[error("device error: {0}")]
    Device(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error("predictor error: {0}")]
    Predictor(String),
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),
    #[error("io error: {0}")]
    Io(String),
}

/// Failures while decoding a telemetry or command line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty line")]
    Empty,
    #[error("crc mismatch: line carries {received:#04x}, computed {computed:#04x}")]
    Crc { received: u8, computed: u8 },
    #[error("malformed line: {0}")]
    Malformed(String),
    #[error("group {0} is missing")]
    MissingGroup(char),
    #[error("field {group}{index} is missing")]
    MissingField { group: char, index: usize },
    #[error("field {group}{index} does not fit its type: {value:#x}")]
    Overflow { group: char, index: usize, value: u64 },
    #[error("invalid hex digits: {0:?}")]
    BadHex(String),
}

/// Dataset store failures.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("episode with close time {0} already stored")]
    Duplicate(i64),
    #[error("dataset io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset document is corrupt: {0}")]
    Corrupt(String),
    #[error("dataset schema version {found} is newer than supported {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
