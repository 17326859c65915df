//! Scalar element trait implemented for every [`DType`].

use half::{bf16, f16};
use num_traits::{ToPrimitive, WrappingAdd, WrappingMul, WrappingSub, Zero};

use crate::types::DType;

/// Arithmetic needed by the kernel library.
///
/// Integer kinds wrap on overflow; floating kinds follow IEEE semantics.
pub trait Element: bytemuck::Pod + PartialOrd + Send + Sync + 'static {
    const DTYPE: DType;

    fn zero() -> Self;
    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_integer_element {
    ($($t:ty => $dtype:ident),+ $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: DType = DType::$dtype;

                fn zero() -> Self {
                    <$t as Zero>::zero()
                }

                fn add(self, rhs: Self) -> Self {
                    WrappingAdd::wrapping_add(&self, &rhs)
                }

                fn sub(self, rhs: Self) -> Self {
                    WrappingSub::wrapping_sub(&self, &rhs)
                }

                fn mul(self, rhs: Self) -> Self {
                    WrappingMul::wrapping_mul(&self, &rhs)
                }

                fn to_f64(self) -> f64 {
                    ToPrimitive::to_f64(&self).unwrap_or(f64::NAN)
                }

                fn from_f64(value: f64) -> Self {
                    // saturating float-to-int cast
                    value as $t
                }
            }
        )+
    };
}

impl_integer_element!(
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
);

macro_rules! impl_native_float_element {
    ($($t:ty => $dtype:ident),+ $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: DType = DType::$dtype;

                fn zero() -> Self {
                    0.0
                }

                fn add(self, rhs: Self) -> Self {
                    self + rhs
                }

                fn sub(self, rhs: Self) -> Self {
                    self - rhs
                }

                fn mul(self, rhs: Self) -> Self {
                    self * rhs
                }

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_f64(value: f64) -> Self {
                    value as $t
                }
            }
        )+
    };
}

impl_native_float_element!(f32 => F32, f64 => F64);

macro_rules! impl_half_element {
    ($($t:ty => $dtype:ident),+ $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: DType = DType::$dtype;

                fn zero() -> Self {
                    <$t>::ZERO
                }

                // Half types compute in f32 and round once.
                fn add(self, rhs: Self) -> Self {
                    <$t>::from_f32(self.to_f32() + rhs.to_f32())
                }

                fn sub(self, rhs: Self) -> Self {
                    <$t>::from_f32(self.to_f32() - rhs.to_f32())
                }

                fn mul(self, rhs: Self) -> Self {
                    <$t>::from_f32(self.to_f32() * rhs.to_f32())
                }

                fn to_f64(self) -> f64 {
                    <$t>::to_f64(self)
                }

                fn from_f64(value: f64) -> Self {
                    <$t>::from_f64(value)
                }
            }
        )+
    };
}

impl_half_element!(f16 => F16, bf16 => BF16);

/// Decode little-endian element bytes into a vector.
///
/// Device allocations are byte vectors with no alignment guarantee, so the
/// bytes are copied into a properly aligned buffer rather than cast in place.
pub fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    let count = bytes.len() / std::mem::size_of::<T>();
    let used = count * std::mem::size_of::<T>();
    let mut values = vec![T::zeroed(); count];
    bytemuck::cast_slice_mut::<T, u8>(&mut values).copy_from_slice(&bytes[..used]);
    values
}

/// Run `$body` with `$T` aliased to the Rust type of `$dtype`.
#[macro_export]
macro_rules! with_element_type {
    ($dtype:expr, $T:ident => $body:expr) => {
        match $dtype {
            $crate::DType::I8 => {
                type $T = i8;
                $body
            }
            $crate::DType::I16 => {
                type $T = i16;
                $body
            }
            $crate::DType::I32 => {
                type $T = i32;
                $body
            }
            $crate::DType::I64 => {
                type $T = i64;
                $body
            }
            $crate::DType::U8 => {
                type $T = u8;
                $body
            }
            $crate::DType::U16 => {
                type $T = u16;
                $body
            }
            $crate::DType::U32 => {
                type $T = u32;
                $body
            }
            $crate::DType::U64 => {
                type $T = u64;
                $body
            }
            $crate::DType::F16 => {
                type $T = ::half::f16;
                $body
            }
            $crate::DType::BF16 => {
                type $T = ::half::bf16;
                $body
            }
            $crate::DType::F32 => {
                type $T = f32;
                $body
            }
            $crate::DType::F64 => {
                type $T = f64;
                $body
            }
        }
    };
}
