//! Core value types shared by the device and its host clients.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ================================================================================================
// Data Types
// ================================================================================================

/// Scalar element kind of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    pub const ALL: [DType; 12] = [
        DType::I8,
        DType::I16,
        DType::I32,
        DType::I64,
        DType::U8,
        DType::U16,
        DType::U32,
        DType::U64,
        DType::F16,
        DType::BF16,
        DType::F32,
        DType::F64,
    ];

    /// Size of one element in bytes
    pub const fn size_bytes(self) -> usize {
        match self {
            DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 | DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    pub const fn is_integer(self) -> bool {
        !self.is_float()
    }

    pub const fn name(self) -> &'static str {
        match self {
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::U32 => "uint32",
            DType::U64 => "uint64",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::F32 => "float32",
            DType::F64 => "float64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dtype = match s.trim().to_ascii_lowercase().as_str() {
            "i8" | "int8" => DType::I8,
            "i16" | "int16" => DType::I16,
            "i32" | "int32" => DType::I32,
            "i64" | "int64" => DType::I64,
            "u8" | "uint8" => DType::U8,
            "u16" | "uint16" => DType::U16,
            "u32" | "uint32" => DType::U32,
            "u64" | "uint64" => DType::U64,
            "f16" | "float16" => DType::F16,
            "bf16" | "bfloat16" => DType::BF16,
            "f32" | "float32" => DType::F32,
            "f64" | "float64" => DType::F64,
            other => return Err(format!("unknown dtype `{other}`")),
        };
        Ok(dtype)
    }
}

/// Number of elements in a row-major shape, `None` on overflow.
pub fn checked_num_elements(shape: &[usize]) -> Option<usize> {
    if shape.contains(&0) {
        return Some(0);
    }
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Byte length of a dense row-major tensor, `None` on overflow.
pub fn checked_byte_len(shape: &[usize], dtype: DType) -> Option<usize> {
    checked_num_elements(shape)?.checked_mul(dtype.size_bytes())
}

/// Number of elements in a row-major shape.
///
/// Saturates at `usize::MAX`.
pub fn num_elements(shape: &[usize]) -> usize {
    checked_num_elements(shape).unwrap_or(usize::MAX)
}

/// Byte length of a dense row-major tensor.
///
/// Saturates at `usize::MAX`, which no memory pool can satisfy, so an
/// overflowing shape fails as an out-of-memory allocation.
pub fn byte_len(shape: &[usize], dtype: DType) -> usize {
    checked_byte_len(shape, dtype).unwrap_or(usize::MAX)
}

// ================================================================================================
// Memory
// ================================================================================================

/// Device memory pool an allocation lives in.
///
/// `Scratch` is the small, fast on-chip pool. It never spills into `Default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryScope {
    Default,
    Scratch,
}

impl fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryScope::Default => f.write_str("global"),
            MemoryScope::Scratch => f.write_str("global.vtcm"),
        }
    }
}

/// Handle to a device allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferHandle(pub u64);

impl BufferHandle {
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// Handle to a staged module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u64);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mod{}", self.0)
    }
}

/// A device buffer interpreted as a dense tensor.
///
/// Device memory is untyped; shape and dtype travel with every reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorArg {
    pub handle: BufferHandle,
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorArg {
    pub fn new(handle: BufferHandle, dtype: DType, shape: Vec<usize>) -> Self {
        Self { handle, dtype, shape }
    }

    pub fn byte_len(&self) -> usize {
        byte_len(&self.shape, self.dtype)
    }
}

/// Static tensor type: dtype plus concrete dims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Vec<usize>) -> Self {
        Self { dtype, shape }
    }

    pub fn byte_len(&self) -> usize {
        byte_len(&self.shape, self.dtype)
    }

    pub fn matches(&self, arg: &TensorArg) -> bool {
        self.dtype == arg.dtype && self.shape == arg.shape
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.shape)
    }
}

// ================================================================================================
// Device identity
// ================================================================================================

/// What kind of machine executes a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Detached accelerator identified by its architecture revision (e.g. `v68`).
    Accelerator { arch: String },
    /// The host CPU, used for reference runs.
    HostCpu,
}

impl DeviceKind {
    pub fn accelerator(arch: impl Into<String>) -> Self {
        DeviceKind::Accelerator { arch: arch.into() }
    }

    /// Prefix of the kernel symbols this device exports.
    pub fn kernel_namespace(&self) -> &'static str {
        match self {
            DeviceKind::Accelerator { .. } => "accel",
            DeviceKind::HostCpu => "cpu",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Accelerator { arch } => write!(f, "accel({arch})"),
            DeviceKind::HostCpu => f.write_str("cpu"),
        }
    }
}

/// Returned by the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub protocol_version: u32,
    pub default_capacity: usize,
    pub scratch_capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::I8.size_bytes(), 1);
        assert_eq!(DType::BF16.size_bytes(), 2);
        assert_eq!(DType::F32.size_bytes(), 4);
        assert_eq!(DType::U64.size_bytes(), 8);
    }

    #[test]
    fn test_dtype_parse_and_display() {
        for dtype in DType::ALL {
            assert_eq!(dtype.to_string().parse::<DType>().unwrap(), dtype);
        }
        assert_eq!("f32".parse::<DType>().unwrap(), DType::F32);
        assert!("complex64".parse::<DType>().is_err());
    }

    #[test]
    fn test_byte_len_of_zero_sized_shape() {
        assert_eq!(byte_len(&[4, 0, 3], DType::F64), 0);
        assert_eq!(byte_len(&[], DType::F32), 4);
        assert_eq!(checked_byte_len(&[usize::MAX, 0], DType::F64), Some(0));
    }

    #[test]
    fn test_overflowing_shapes_saturate() {
        let huge = [usize::MAX / 2, 4];
        assert_eq!(checked_num_elements(&huge), None);
        assert_eq!(checked_byte_len(&[usize::MAX / 2], DType::F32), None);
        assert_eq!(byte_len(&huge, DType::F32), usize::MAX);
        let arg = TensorArg::new(BufferHandle(1), DType::F32, huge.to_vec());
        assert_eq!(arg.byte_len(), usize::MAX);
    }

    #[test]
    fn test_kernel_namespace() {
        assert_eq!(DeviceKind::accelerator("v68").kernel_namespace(), "accel");
        assert_eq!(DeviceKind::HostCpu.kernel_namespace(), "cpu");
    }
}
