//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for dagmaster. Transport timeouts and errors
/// returned by a remote peer are kept apart from local failures so that
/// callers can tell them apart without parsing messages.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum DagError {
    /// Local failure: I/O, corruption, invalid request, etc.
    Msg(String),

    /// Transport-level timeout.
    TimedOut(String),

    /// Application-level error returned by the remote side of a call.
    Remote(String),
}

impl DagError {
    pub fn msg(msg: impl ToString) -> Self {
        DagError::Msg(msg.to_string())
    }

    pub fn timeout(msg: impl ToString) -> Self {
        DagError::TimedOut(msg.to_string())
    }

    pub fn remote(msg: impl ToString) -> Self {
        DagError::Remote(msg.to_string())
    }

    /// True if this is a transport-level timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DagError::TimedOut(_))
    }

    /// True if this error was produced by the remote peer.
    pub fn is_remote(&self) -> bool {
        matches!(self, DagError::Remote(_))
    }
}

impl fmt::Display for DagError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DagError::Msg(msg) => write!(f, "{}", msg), // no literal quotes
            DagError::TimedOut(msg) => write!(f, "timed out: {}", msg),
            DagError::Remote(msg) => write!(f, "remote error: {}", msg),
        }
    }
}

impl error::Error for DagError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `DagError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for DagError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                DagError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `DagError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for DagError {
            fn from(e: $error) -> DagError {
                DagError::msg(e.to_string())
            }
        }
    };
}

impl From<io::Error> for DagError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            DagError::TimedOut(e.to_string())
        } else {
            DagError::Msg(e.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for DagError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        DagError::TimedOut(e.to_string())
    }
}

impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
