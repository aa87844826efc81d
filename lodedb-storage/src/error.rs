use std::array::TryFromSliceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid state")]
    InvalidState,
    #[error("Invalid format")]
    InvalidFormat,
    #[error("IO Error")]
    IOError,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    // log errors
    #[error("log data corrupted at address {0}")]
    DataCorrupted(u64),
    #[error("loggable is larger than log segment")]
    TooBigLoggable,
    // tree errors
    #[error("invariant violated: {0}")]
    InvariantViolation(&'static str),
    #[error("{0} not supported")]
    NotSupported(&'static str),
}

impl Error {
    /// Returns whether this error signals damaged log data.
    #[inline]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::DataCorrupted(_))
    }
}

impl From<TryFromSliceError> for Error {
    #[inline]
    fn from(_src: TryFromSliceError) -> Error {
        Error::InvalidFormat
    }
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(_src: std::io::Error) -> Self {
        Error::IOError
    }
}

impl From<toml::de::Error> for Error {
    #[inline]
    fn from(src: toml::de::Error) -> Self {
        Error::InvalidConfig(src.message().to_string())
    }
}

impl From<hex::FromHexError> for Error {
    #[inline]
    fn from(src: hex::FromHexError) -> Self {
        Error::InvalidConfig(format!("cipher key: {src}"))
    }
}
