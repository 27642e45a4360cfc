use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TruncatedHeader,
    TruncatedTable,
    BufferTooSmall,
    FrameDataTooSmall,
    IndexOutOfRange,
    InvalidGeometry,
    UnsupportedFileType,
    CodecInitFailure,
    Busy,
    Io,
    WorkerLost,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Truncated header: {0}")]
    TruncatedHeader(String),

    #[error("Truncated frame table: {0}")]
    TruncatedTable(String),

    #[error("Buffer too small: {0}")]
    BufferTooSmall(String),

    #[error("Frame data too small: {0}")]
    FrameDataTooSmall(String),

    #[error("Frame index out of range: {0}")]
    IndexOutOfRange(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Codec init failure: {0}")]
    CodecInitFailure(String),

    #[error("Loader busy: {0}")]
    Busy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker lost: {0}")]
    WorkerLost(String),
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecodeError::TruncatedHeader(_) => ErrorKind::TruncatedHeader,
            DecodeError::TruncatedTable(_) => ErrorKind::TruncatedTable,
            DecodeError::BufferTooSmall(_) => ErrorKind::BufferTooSmall,
            DecodeError::FrameDataTooSmall(_) => ErrorKind::FrameDataTooSmall,
            DecodeError::IndexOutOfRange(_) => ErrorKind::IndexOutOfRange,
            DecodeError::InvalidGeometry(_) => ErrorKind::InvalidGeometry,
            DecodeError::UnsupportedFileType(_) => ErrorKind::UnsupportedFileType,
            DecodeError::CodecInitFailure(_) => ErrorKind::CodecInitFailure,
            DecodeError::Busy(_) => ErrorKind::Busy,
            DecodeError::Io(_) => ErrorKind::Io,
            DecodeError::WorkerLost(_) => ErrorKind::WorkerLost,
        }
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;
