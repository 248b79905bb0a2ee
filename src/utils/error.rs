//! Customized unified error type.

use std::fmt;
use std::io;

/// Customized error type for mirrorlog.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MirrorlogError(pub String);

impl fmt::Display for MirrorlogError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for MirrorlogError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `MirrorlogError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for MirrorlogError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                MirrorlogError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::sync::watch::error::RecvError);
impl_from_error!(tokio::task::JoinError);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = MirrorlogError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = MirrorlogError::from(io_error);
        assert_eq!(format!("{}", e), String::from("oh no!"));
    }
}
