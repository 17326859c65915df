//! Error types for host-side operations

use rexec_device::{DeviceError, ProtocolError};

use crate::buffer::Location;

/// Result type for host-side operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by sessions, executors and the compiler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device could not be reached, the handshake failed, or the
    /// transport broke mid-session
    #[error("connection error: {0}")]
    Connection(String),

    /// The device refused to load an artifact
    #[error("staging error: {0}")]
    Staging(String),

    #[error("out of {location} memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory {
        location: Location,
        requested: usize,
        available: usize,
    },

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("unknown input `{0}`")]
    UnknownInput(String),

    #[error("shape mismatch for input `{input}`: expected {expected}, got {actual}")]
    ShapeMismatch {
        input: String,
        expected: String,
        actual: String,
    },

    /// A fault reported by the device while running; never retried
    #[error("runtime execution error: {0}")]
    RuntimeExecution(#[source] DeviceError),

    #[error("compilation error: {0}")]
    Compilation(String),

    #[error("input `{0}` is not bound")]
    UnboundInput(String),

    #[error("unknown entry point `{0}`")]
    UnknownEntryPoint(String),

    /// Outputs are only readable after a successful run
    #[error("output unavailable: {0}")]
    OutputUnavailable(String),

    #[error("invalid tensor: {0}")]
    InvalidTensor(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Which session operation a device error came back from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Handshake,
    Transfer,
    Stage,
    Run,
}

impl Error {
    pub(crate) fn compilation(msg: impl Into<String>) -> Self {
        Error::Compilation(msg.into())
    }

    pub(crate) fn invalid_tensor(msg: impl Into<String>) -> Self {
        Error::InvalidTensor(msg.into())
    }

    /// Translate a device error into the host taxonomy.
    pub(crate) fn from_device(phase: Phase, err: DeviceError) -> Self {
        match (phase, err) {
            (_, DeviceError::Protocol(msg)) => Error::Connection(msg),
            (Phase::Handshake, other) => Error::Connection(other.to_string()),
            (Phase::Stage, other) => Error::Staging(other.to_string()),
            (Phase::Run, DeviceError::UnknownEntryPoint(entry)) => Error::UnknownEntryPoint(entry),
            (Phase::Run, other) => Error::RuntimeExecution(other),
            (
                Phase::Transfer,
                DeviceError::OutOfMemory {
                    scope,
                    requested,
                    available,
                },
            ) => Error::OutOfMemory {
                location: Location::from(scope),
                requested,
                available,
            },
            (Phase::Transfer, other) => Error::Transfer(other.to_string()),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_device::{BufferHandle, DeviceFault, MemoryScope};

    #[test]
    fn test_device_errors_map_by_phase() {
        let oom = DeviceError::OutOfMemory {
            scope: MemoryScope::Scratch,
            requested: 64,
            available: 8,
        };
        assert!(matches!(
            Error::from_device(Phase::Transfer, oom.clone()),
            Error::OutOfMemory {
                location: Location::DeviceScratch,
                requested: 64,
                available: 8
            }
        ));
        assert!(matches!(Error::from_device(Phase::Stage, oom), Error::Staging(_)));

        let fault = DeviceError::Fault(DeviceFault::IllegalMemoryAccess("buf1".into()));
        let Error::RuntimeExecution(inner) = Error::from_device(Phase::Run, fault.clone()) else {
            panic!("faults during run must surface verbatim");
        };
        assert_eq!(inner, fault);

        assert!(matches!(
            Error::from_device(Phase::Transfer, DeviceError::InvalidBuffer(BufferHandle(3))),
            Error::Transfer(_)
        ));
        assert!(matches!(
            Error::from_device(Phase::Run, DeviceError::Protocol("bye".into())),
            Error::Connection(_)
        ));
    }
}
