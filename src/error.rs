use std::fmt::Display;

/// Au errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Malformed stream data: bad frame bytes, truncated varints, length
    /// prefixes that overrun the stream, out-of-range dictionary references.
    Parse(String),
    /// An IO error from the underlying stream.
    Io(String),
    /// The working buffer could not be grown.
    Grow(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Parse(msg) => write!(f, "parse error: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Grow(msg) => write!(f, "allocation error: {msg}"),
        }
    }
}

/// Constructs an Error::Parse for the given format string.
#[macro_export]
macro_rules! errparse {
    ($($args:tt)*) => { $crate::error::Error::Parse(format!($($args)*)).into() };
}

/// An Au Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}
