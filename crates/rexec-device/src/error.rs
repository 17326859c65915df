//! Error types for device operations
//!
//! Both enums cross the wire, so they carry only serializable payloads.

use serde::{Deserialize, Serialize};

use crate::types::{BufferHandle, DType, MemoryScope, ModuleId};

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// A failure raised while a staged module is executing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum DeviceFault {
    /// A kernel touched memory it does not own
    #[error("illegal memory access: {0}")]
    IllegalMemoryAccess(String),

    /// Operand shapes are incompatible
    #[error("shape error: {0}")]
    Shape(String),

    /// Operand dtype is unsupported or inconsistent
    #[error("dtype error in `{kernel}`: {dtype}")]
    DType { kernel: String, dtype: DType },

    #[error("wrong argument count for `{function}`: expected {expected}, got {actual}")]
    ArgumentCount {
        function: String,
        expected: usize,
        actual: usize,
    },

    /// VM register read before being written
    #[error("register r{0} is not initialized")]
    UninitializedRegister(usize),

    /// Symbolic shape expression cannot be evaluated
    #[error("shape expression error: {0}")]
    ShapeExpr(String),

    #[error("kernel `{0}` is not linked")]
    UnknownKernel(String),

    #[error("invalid kernel attribute: {0}")]
    InvalidAttribute(String),
}

/// Errors reported by the device for a single request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum DeviceError {
    #[error("out of {scope} memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory {
        scope: MemoryScope,
        requested: usize,
        available: usize,
    },

    #[error("invalid buffer handle: {0}")]
    InvalidBuffer(BufferHandle),

    #[error("invalid module: {0}")]
    InvalidModule(ModuleId),

    #[error("buffer size mismatch on {handle}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        handle: BufferHandle,
        expected: usize,
        actual: usize,
    },

    /// The module image could not be loaded
    #[error("staging failed: {0}")]
    Staging(String),

    #[error("unknown entry point `{0}`")]
    UnknownEntryPoint(String),

    #[error("execution fault: {0}")]
    Fault(#[from] DeviceFault),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid device configuration: {0}")]
    Config(String),
}

impl DeviceError {
    pub fn staging(msg: impl Into<String>) -> Self {
        Self::Staging(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Fault(DeviceFault::Shape(msg.into()))
    }
}
