//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for Squall. Most errors are plain message
/// strings; the explicitly-tagged variants drive distinct termination
/// policies in the coordination core.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum SquallError {
    /// Generic error described by a message string.
    Msg(String),

    /// A node already exists at the given store path.
    NodeExists(String),

    /// No node exists at the given store path.
    NoNode(String),

    /// A live processor already holds this registration.
    DuplicateProcessor(String),

    /// The coordination store session was lost or is unusable.
    Connection(String),

    /// Unexpected store content where an invariant demands presence.
    UnexpectedStore(String),

    /// Bolts loaded snapshots at divergent clocks.
    BadStartup(String),

    /// Bolts saved snapshots at divergent clocks.
    BadClusterState(String),
}

impl SquallError {
    /// Wraps a message string as a generic error.
    pub fn msg(msg: impl ToString) -> Self {
        SquallError::Msg(msg.to_string())
    }
}

impl fmt::Display for SquallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SquallError::Msg(s) => write!(f, "{}", s),
            SquallError::NodeExists(path) => {
                write!(f, "node already exists: {}", path)
            }
            SquallError::NoNode(path) => write!(f, "no such node: {}", path),
            SquallError::DuplicateProcessor(id) => {
                write!(f, "duplicate processor registration: {}", id)
            }
            SquallError::Connection(s) => {
                write!(f, "store connection error: {}", s)
            }
            SquallError::UnexpectedStore(s) => {
                write!(f, "unexpected store state: {}", s)
            }
            SquallError::BadStartup(s) => {
                write!(f, "bad startup state: {}", s)
            }
            SquallError::BadClusterState(s) => {
                write!(f, "bad cluster state: {}", s)
            }
        }
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `SquallError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for SquallError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                SquallError::Msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(std::string::FromUtf8Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::task::JoinError);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = SquallError::msg("out of thin air");
        assert_eq!(format!("{}", e), String::from("out of thin air"));
        let e = SquallError::DuplicateProcessor("agg-0".into());
        assert_eq!(
            format!("{}", e),
            String::from("duplicate processor registration: agg-0")
        );
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = SquallError::from(io_error);
        assert!(matches!(e, SquallError::Msg(ref s) if s.contains("oh no!")));
    }
}
