//! Host-resident tensors
//!
//! [`HostTensor`] is the host array the harness moves to and from devices:
//! a dense row-major byte buffer tagged with its shape and dtype.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rexec_device::{byte_len, checked_byte_len, decode, num_elements, with_element_type, DType, Element};
use serde::{Deserialize, Serialize};

use crate::buffer::Location;
use crate::error::{Error, Result};

/// Dense row-major tensor in host memory.
///
/// The byte length always equals `product(shape) * dtype.size_bytes()`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<u8>,
}

impl HostTensor {
    /// Wrap raw little-endian bytes.
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = byte_len(&shape, dtype);
        if data.len() != expected {
            return Err(Error::invalid_tensor(format!(
                "{dtype}{shape:?} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    /// Build from typed values; the dtype follows `T`.
    pub fn from_vec<T: Element>(shape: Vec<usize>, values: Vec<T>) -> Result<Self> {
        Self::from_slice(shape, &values)
    }

    pub fn from_slice<T: Element>(shape: Vec<usize>, values: &[T]) -> Result<Self> {
        if values.len() != num_elements(&shape) {
            return Err(Error::invalid_tensor(format!(
                "shape {shape:?} holds {} elements, got {}",
                num_elements(&shape),
                values.len()
            )));
        }
        Ok(Self {
            shape,
            dtype: T::DTYPE,
            data: bytemuck::cast_slice(values).to_vec(),
        })
    }

    /// Build from `f64` values converted to `dtype`.
    pub fn from_f64(shape: Vec<usize>, dtype: DType, values: &[f64]) -> Result<Self> {
        with_element_type!(dtype, T => {
            let typed: Vec<T> = values.iter().map(|&value| <T as Element>::from_f64(value)).collect();
            Self::from_slice(shape, &typed)
        })
    }

    /// Zero-filled tensor. Panics if the shape cannot be allocated; use
    /// [`try_zeros`](Self::try_zeros) for untrusted shapes.
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let data = vec![0u8; byte_len(&shape, dtype)];
        Self { shape, dtype, data }
    }

    /// Zero-filled tensor, failing with [`Error::OutOfMemory`] when the byte
    /// length overflows or host memory cannot hold it.
    pub fn try_zeros(shape: Vec<usize>, dtype: DType) -> Result<Self> {
        let out_of_memory = |requested| Error::OutOfMemory {
            location: Location::Host,
            requested,
            available: 0,
        };
        let bytes = checked_byte_len(&shape, dtype).ok_or_else(|| out_of_memory(usize::MAX))?;
        let mut data = Vec::new();
        data.try_reserve_exact(bytes).map_err(|_| out_of_memory(bytes))?;
        data.resize(bytes, 0);
        Ok(Self { shape, dtype, data })
    }

    /// Deterministic pseudo-random contents.
    ///
    /// Floats are drawn from `[-1, 1)`. Integers from `[-8, 8)` for signed
    /// types and `[0, 16)` for unsigned ones, so sums and products of a few
    /// terms stay in range.
    pub fn random(shape: Vec<usize>, dtype: DType, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let count = num_elements(&shape);
        let values: Vec<f64> = match dtype {
            dtype if dtype.is_float() => (0..count).map(|_| rng.gen_range(-1.0..1.0)).collect(),
            DType::U8 | DType::U16 | DType::U32 | DType::U64 => {
                (0..count).map(|_| rng.gen_range(0u32..16) as f64).collect()
            }
            _ => (0..count).map(|_| rng.gen_range(-8i32..8) as f64).collect(),
        };
        let data = with_element_type!(dtype, T => {
            let typed: Vec<T> = values.iter().map(|&value| <T as Element>::from_f64(value)).collect();
            bytemuck::cast_slice::<T, u8>(&typed).to_vec()
        });
        Self { shape, dtype, data }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn num_elements(&self) -> usize {
        num_elements(&self.shape)
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Typed copy of the contents. Fails if `T` is not this tensor's dtype.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(Error::invalid_tensor(format!(
                "cannot read {} tensor as {}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(decode(&self.data))
    }

    /// Every element widened to `f64`, for numeric comparison.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_element_type!(self.dtype, T => {
            decode::<T>(&self.data).into_iter().map(Element::to_f64).collect()
        })
    }

    /// Same bytes under a new shape with the same element count.
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self> {
        if num_elements(&shape) != self.num_elements() {
            return Err(Error::invalid_tensor(format!(
                "cannot reshape {:?} into {shape:?}",
                self.shape
            )));
        }
        Ok(Self { shape, ..self })
    }
}

impl fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::{bf16, f16};

    #[test]
    fn test_typed_round_trip() {
        let tensor = HostTensor::from_vec(vec![2, 2], vec![1.5f32, -2.0, 0.0, 4.25]).unwrap();
        assert_eq!(tensor.dtype(), DType::F32);
        assert_eq!(tensor.byte_len(), 16);
        assert_eq!(tensor.to_vec::<f32>().unwrap(), vec![1.5, -2.0, 0.0, 4.25]);
        assert!(matches!(tensor.to_vec::<i32>(), Err(Error::InvalidTensor(_))));
    }

    #[test]
    fn test_construction_checks_lengths() {
        assert!(HostTensor::new(vec![3], DType::F32, vec![0; 8]).is_err());
        assert!(HostTensor::from_vec(vec![2, 3], vec![1i8; 5]).is_err());
        let empty = HostTensor::zeros(vec![0, 4], DType::F16);
        assert_eq!(empty.byte_len(), 0);
        assert!(empty.to_f64_vec().is_empty());
    }

    #[test]
    fn test_try_zeros_refuses_overflowing_shapes() {
        let zeros = HostTensor::try_zeros(vec![2, 3], DType::I16).unwrap();
        assert_eq!(zeros, HostTensor::zeros(vec![2, 3], DType::I16));
        assert!(matches!(
            HostTensor::try_zeros(vec![usize::MAX / 2, 4], DType::F32),
            Err(Error::OutOfMemory {
                location: Location::Host,
                requested: usize::MAX,
                ..
            })
        ));
    }

    #[test]
    fn test_random_is_seeded_and_in_range() {
        let a = HostTensor::random(vec![64], DType::F32, 7);
        let b = HostTensor::random(vec![64], DType::F32, 7);
        let c = HostTensor::random(vec![64], DType::F32, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.to_f64_vec().iter().all(|v| (-1.0..=1.0).contains(v)));

        let ints = HostTensor::random(vec![128], DType::I8, 1);
        assert!(ints.to_f64_vec().iter().all(|v| (-8.0..8.0).contains(v)));
        let unsigned = HostTensor::random(vec![128], DType::U16, 1);
        assert!(unsigned.to_f64_vec().iter().all(|v| (0.0..16.0).contains(v)));
    }

    #[test]
    fn test_half_precision_values() {
        let halves = HostTensor::from_vec(vec![2], vec![f16::from_f32(0.5), f16::from_f32(-3.0)]).unwrap();
        assert_eq!(halves.to_f64_vec(), vec![0.5, -3.0]);
        let brains = HostTensor::from_f64(vec![1], DType::BF16, &[2.0]).unwrap();
        assert_eq!(brains.to_vec::<bf16>().unwrap(), vec![bf16::from_f32(2.0)]);
    }

    #[test]
    fn test_reshape_keeps_bytes() {
        let tensor = HostTensor::from_vec(vec![6], (0..6).collect::<Vec<i32>>()).unwrap();
        let reshaped = tensor.clone().reshape(vec![2, 3]).unwrap();
        assert_eq!(reshaped.shape(), &[2, 3]);
        assert_eq!(reshaped.as_bytes(), tensor.as_bytes());
        assert!(tensor.reshape(vec![4]).is_err());
    }
}
