//! Unified error type for the coordinator crate.

use std::fmt;
use std::io;

use crate::cluster::ConsistencyLevel;
use crate::messaging::WriteType;

/// Errors surfaced by coordinator operations. The structured variants map
/// one-to-one onto the client-visible request failure taxonomy; everything
/// infrastructural collapses into `Internal`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum CoordError {
    /// Fewer live replicas than the consistency level requires, detected
    /// before any message was sent.
    Unavailable {
        consistency: ConsistencyLevel,
        required: u32,
        alive: u32,
    },

    /// Insufficient write acknowledgements before the deadline.
    WriteTimeout {
        write_type: WriteType,
        consistency: ConsistencyLevel,
        received: u32,
        block_for: u32,
    },

    /// One or more replicas reported an explicit write failure.
    WriteFailure {
        write_type: WriteType,
        consistency: ConsistencyLevel,
        received: u32,
        block_for: u32,
        failures: u32,
    },

    /// Insufficient read responses before the deadline. `data_present`
    /// distinguishes a missed digest quorum from a missed data replica.
    ReadTimeout {
        consistency: ConsistencyLevel,
        received: u32,
        block_for: u32,
        data_present: bool,
    },

    /// One or more replicas reported an explicit read failure.
    ReadFailure {
        consistency: ConsistencyLevel,
        received: u32,
        block_for: u32,
        failures: u32,
        data_present: bool,
    },

    /// Hint backpressure cap breached.
    Overloaded(String),

    /// Malformed or unsupported request.
    InvalidRequest(String),

    /// Reads for non-system keyspaces refused while bootstrapping.
    IsBootstrapping,

    /// Local storage scanned too many tombstones; surfaced unchanged.
    TombstoneOverwhelming(String),

    /// Anything infrastructural (io, channels, codec, config).
    Internal(String),
}

impl CoordError {
    /// Shorthand for internal errors from a printable message.
    pub fn msg(m: impl ToString) -> Self {
        CoordError::Internal(m.to_string())
    }
}

impl fmt::Display for CoordError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CoordError::Unavailable {
                consistency,
                required,
                alive,
            } => write!(
                f,
                "unavailable: cl {:?} requires {} but only {} alive",
                consistency, required, alive
            ),
            CoordError::WriteTimeout {
                write_type,
                consistency,
                received,
                block_for,
            } => write!(
                f,
                "write timeout ({:?} at {:?}): received {} of {}",
                write_type, consistency, received, block_for
            ),
            CoordError::WriteFailure {
                write_type,
                consistency,
                received,
                block_for,
                failures,
            } => write!(
                f,
                "write failure ({:?} at {:?}): received {} of {}, {} failed",
                write_type, consistency, received, block_for, failures
            ),
            CoordError::ReadTimeout {
                consistency,
                received,
                block_for,
                data_present,
            } => write!(
                f,
                "read timeout ({:?}): received {} of {}, data {}",
                consistency,
                received,
                block_for,
                if *data_present { "present" } else { "absent" }
            ),
            CoordError::ReadFailure {
                consistency,
                received,
                block_for,
                failures,
                ..
            } => write!(
                f,
                "read failure ({:?}): received {} of {}, {} failed",
                consistency, received, block_for, failures
            ),
            CoordError::Overloaded(m) => write!(f, "overloaded: {}", m),
            CoordError::InvalidRequest(m) => {
                write!(f, "invalid request: {}", m)
            }
            CoordError::IsBootstrapping => {
                write!(f, "node is bootstrapping")
            }
            CoordError::TombstoneOverwhelming(m) => {
                write!(f, "tombstone overwhelming: {}", m)
            }
            CoordError::Internal(m) => write!(f, "{}", m),
        }
    }
}

impl std::error::Error for CoordError {}

// Helper macro saving boiler-plate `impl From<T>`s for transparent
// conversion from common error types into `CoordError::Internal`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for CoordError {
            fn from(e: $error) -> Self {
                CoordError::Internal(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::time::error::Elapsed);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CoordError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CoordError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = CoordError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = CoordError::from(io_error);
        assert!(format!("{}", e).contains("oh no!"));
    }

    #[test]
    fn unavailable_display() {
        let e = CoordError::Unavailable {
            consistency: ConsistencyLevel::Quorum,
            required: 2,
            alive: 1,
        };
        assert!(format!("{}", e).contains("requires 2"));
    }
}
