//! Crate-wide error handling.
//!
//! Errors are represented as a single flat enum, constructed either directly
//! or via the [`errdata!`](crate::errdata) and [`errinput!`](crate::errinput)
//! macros. All fallible functions return [`Result`].

/// A walletcore error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Invalid data, e.g. corrupt on-disk state or decoding errors.
    InvalidData(String),
    /// Invalid user input or parameters.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// A write was attempted on a read-only database.
    ReadOnly,
    /// The key has neither a secret nor a public component to work with.
    MissingKey,
    /// An error reported by the cryptographic backend.
    Crypto(String),
}

/// A walletcore result, returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidData(message) => write!(f, "invalid data: {message}"),
            Error::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Error::IO(message) => write!(f, "io error: {message}"),
            Error::ReadOnly => write!(f, "read-only database"),
            Error::MissingKey => write!(f, "no key material available"),
            Error::Crypto(message) => write!(f, "crypto error: {message}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string, as an Err.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidData(format!($($args)*))) };
}

/// Constructs an Error::InvalidInput for the given format string, as an Err.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidInput(format!($($args)*))) };
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<secp256k1::Error> for Error {
    fn from(err: secp256k1::Error) -> Self {
        Error::Crypto(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(format!("lock poisoned: {err}"))
    }
}

impl From<std::fs::TryLockError> for Error {
    fn from(err: std::fs::TryLockError) -> Self {
        Error::IO(err.to_string())
    }
}
