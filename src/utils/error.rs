//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::num;
use std::string;

/// Category of a `SafeleaseError`. Lease outcomes that are expected under
/// contention (`Busy`, `Lost`) are kept distinguishable from I/O failures.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ErrorKind {
    /// Read/write syscall failure or short transfer.
    Io,

    /// An operation or the whole lease exceeded its time budget.
    TimedOut,

    /// Another owner holds the tag and non-blocking mode was requested.
    Busy,

    /// Optimistic acquisition raced with another contender and lost.
    Lost,

    /// Renew found a different owner already holding the tag.
    LeaseLost,

    /// Owner id too long, empty, or colliding with the free sentinel.
    InvalidOwnerId,

    /// Timing or offset constraint violation.
    InvalidParameters,

    /// Sector holds something that is neither free nor a decodable tag.
    Corrupted,

    /// Anything else (config parsing, channels, task joins, ...).
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::Io => "io error",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::Busy => "busy",
            ErrorKind::Lost => "lost",
            ErrorKind::LeaseLost => "lease lost",
            ErrorKind::InvalidOwnerId => "invalid owner id",
            ErrorKind::InvalidParameters => "invalid parameters",
            ErrorKind::Corrupted => "corrupted",
            ErrorKind::Other => "error",
        };
        write!(f, "{}", name)
    }
}

/// Customized error type for safelease.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SafeleaseError {
    kind: ErrorKind,
    msg: String,
}

impl SafeleaseError {
    pub fn new(kind: ErrorKind, msg: impl ToString) -> Self {
        SafeleaseError {
            kind,
            msg: msg.to_string(),
        }
    }

    pub fn msg(msg: impl ToString) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// True if this error is an expected contention outcome of `acquire`
    /// rather than a failure of the storage path.
    pub fn is_contention(&self) -> bool {
        matches!(self.kind, ErrorKind::Busy | ErrorKind::Lost)
    }
}

impl fmt::Display for SafeleaseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.kind == ErrorKind::Other {
            write!(f, "{}", self.msg) // do not display literal quotes
        } else {
            write!(f, "{}: {}", self.kind, self.msg)
        }
    }
}

impl error::Error for SafeleaseError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `SafeleaseError`.
macro_rules! impl_from_error {
    ($error:ty => $kind:expr) => {
        impl From<$error> for SafeleaseError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                SafeleaseError::new($kind, e)
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `SafeleaseError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for SafeleaseError {
            fn from(e: $error) -> SafeleaseError {
                SafeleaseError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error => ErrorKind::Io);
impl_from_error!(string::FromUtf8Error => ErrorKind::Corrupted);
impl_from_error!(num::ParseIntError => ErrorKind::InvalidParameters);
impl_from_error!(toml::de::Error => ErrorKind::Other);
impl_from_error!(ctrlc::Error => ErrorKind::Other);
impl_from_error!(tokio::task::JoinError => ErrorKind::Other);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = SafeleaseError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
        let e = SafeleaseError::new(ErrorKind::Busy, "held by host1");
        assert_eq!(format!("{}", e), String::from("busy: held by host1"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = SafeleaseError::from(io_error);
        assert_eq!(e.kind(), ErrorKind::Io);
        assert!(e.msg.contains("oh no!"));
    }

    #[test]
    fn contention_kinds() {
        assert!(SafeleaseError::new(ErrorKind::Busy, "").is_contention());
        assert!(SafeleaseError::new(ErrorKind::Lost, "").is_contention());
        assert!(!SafeleaseError::new(ErrorKind::Io, "").is_contention());
        assert!(!SafeleaseError::new(ErrorKind::TimedOut, "").is_contention());
    }
}
