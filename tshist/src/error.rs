use std::fmt;

/// Crate-wide result alias.
pub type CResult<T> = std::result::Result<T, Error>;

/// All errors surfaced by the engine.
///
/// Reader operations on missing series mostly return `None` instead of
/// erroring; `interval` is the one exception and raises `UnknownSeries`.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Malformed caller input: duplicated index entries, reserved bytes in
    /// string values, empty diffs where one is required.
    BadInput(String),

    /// Insertion value/index type does not match the registered metadata.
    TypeMismatch(String),

    /// The insertion would delete every remaining point of a series.
    /// Full erasure must go through `delete`.
    EmptyErasure,

    /// Operation on a series that does not exist.
    UnknownSeries(String),

    /// Stored bytes failed to decode (chunk payloads, row records).
    Corrupt(String),

    /// The transaction handle has already been committed or rolled back.
    TxRequired,

    /// Unexpected internal failure (I/O, encoding, poisoned lock).
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadInput(msg) => write!(f, "bad input: {}", msg),
            Error::TypeMismatch(msg) => write!(f, "type mismatch: {}", msg),
            Error::EmptyErasure => {
                write!(f, "complete erasure of a series is forbidden, use delete")
            }
            Error::UnknownSeries(name) => write!(f, "no such series: {}", name),
            Error::Corrupt(msg) => write!(f, "corrupt data: {}", msg),
            Error::TxRequired => write!(f, "a live transaction is required"),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Corrupt(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::Internal("poisoned lock".into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            Error::UnknownSeries("prices".into()).to_string(),
            "no such series: prices"
        );
        assert_eq!(
            Error::TxRequired.to_string(),
            "a live transaction is required"
        );
    }
}
