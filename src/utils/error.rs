//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for Steppe.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SteppeError(pub String);

impl SteppeError {
    /// Creates an error from anything displayable.
    pub fn msg(m: impl fmt::Display) -> Self {
        SteppeError(m.to_string())
    }
}

impl fmt::Display for SteppeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for SteppeError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `SteppeError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for SteppeError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                SteppeError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(sqlx::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(
    tokio::sync::watch::error::SendError<Option<tokio::time::Instant>>
);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SteppeError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SteppeError(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = SteppeError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = SteppeError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}
