use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("serial port {port}: {reason}")]
    Serial { port: String, reason: String },
    #[error("link is not open")]
    NotOpen,
    #[error("short write: {written} of {len} bytes")]
    ShortWrite { written: usize, len: usize },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
