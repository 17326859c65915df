//! Kernel library
//!
//! Kernels are plain functions looked up by symbol when a module is staged.
//! Every device exports the same operator set under its own namespace:
//!
//! | symbol suffix        | operation                                   |
//! |----------------------|---------------------------------------------|
//! | `add`, `subtract`, `multiply` | element-wise with numpy broadcasting |
//! | `relu`               | `max(x, 0)`                                 |
//! | `softmax`            | softmax over the innermost axis             |
//! | `matmul`             | `[m, k] x [k, n]`                           |
//! | `dense`              | `[m, k] x [n, k]^T`                         |
//! | `conv2d_nhwc_hwio`   | 2-D convolution, NHWC data, HWIO weights    |
//! | `copy`               | byte copy, used for reshapes and aliasing   |
//!
//! The `cpu.*` kernels are straightforward loops. The `accel.*` kernels for
//! the reduction-heavy operators tile their inner loops and fan rows out over
//! rayon, so their floating point results differ from the host's in the last
//! bits.

mod element;
mod elementwise;
mod nn;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::DeviceFault;
use crate::types::{num_elements, DType, DeviceKind};

pub use element::{decode, Element};

/// Read-only kernel operand.
#[derive(Debug, Clone, Copy)]
pub struct TensorRef<'a> {
    pub dtype: DType,
    pub shape: &'a [usize],
    pub data: &'a [u8],
}

impl<'a> TensorRef<'a> {
    pub fn num_elements(&self) -> usize {
        num_elements(self.shape)
    }

    /// Decode the operand as `T`, checking the declared dtype.
    pub fn elements<T: Element>(&self, kernel: &str) -> Result<Vec<T>, DeviceFault> {
        if self.dtype != T::DTYPE {
            return Err(DeviceFault::DType {
                kernel: kernel.to_string(),
                dtype: self.dtype,
            });
        }
        Ok(decode(self.data))
    }
}

/// Output operand. Kernels overwrite it completely.
#[derive(Debug)]
pub struct TensorMut<'a> {
    pub dtype: DType,
    pub shape: &'a [usize],
    pub data: &'a mut [u8],
}

impl<'a> TensorMut<'a> {
    pub fn num_elements(&self) -> usize {
        num_elements(self.shape)
    }

    pub fn store<T: Element>(&mut self, values: &[T]) -> Result<(), DeviceFault> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        if bytes.len() != self.data.len() {
            return Err(DeviceFault::IllegalMemoryAccess(format!(
                "kernel wrote {} bytes into a {} byte output",
                bytes.len(),
                self.data.len()
            )));
        }
        self.data.copy_from_slice(bytes);
        Ok(())
    }
}

/// Integer-list attributes attached to a kernel call (strides, padding...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelAttrs {
    values: BTreeMap<String, Vec<i64>>,
}

impl KernelAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, values: Vec<i64>) -> Self {
        self.values.insert(name.into(), values);
        self
    }

    pub fn get(&self, name: &str) -> Option<&[i64]> {
        self.values.get(name).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Read an attribute of exactly `N` non-negative entries, or `default`.
    pub fn usize_array<const N: usize>(&self, name: &str, default: [usize; N]) -> Result<[usize; N], DeviceFault> {
        let Some(values) = self.get(name) else {
            return Ok(default);
        };
        if values.len() != N {
            return Err(DeviceFault::InvalidAttribute(format!(
                "`{name}` expects {N} values, got {}",
                values.len()
            )));
        }
        let mut out = [0usize; N];
        for (slot, &value) in out.iter_mut().zip(values) {
            *slot = usize::try_from(value)
                .map_err(|_| DeviceFault::InvalidAttribute(format!("`{name}` must be non-negative, got {value}")))?;
        }
        Ok(out)
    }
}

/// Kernel entry point
pub type KernelFn = fn(&[TensorRef<'_>], &mut TensorMut<'_>, &KernelAttrs) -> Result<(), DeviceFault>;

/// Symbol table of the kernels a device can link against.
pub struct KernelRegistry {
    kernels: HashMap<String, KernelFn>,
}

impl KernelRegistry {
    /// Kernels exported by a device of the given kind.
    pub fn for_device(kind: &DeviceKind) -> Self {
        let namespace = kind.kernel_namespace();
        let mut registry = Self {
            kernels: HashMap::new(),
        };

        registry.register(namespace, "add", elementwise::add);
        registry.register(namespace, "subtract", elementwise::subtract);
        registry.register(namespace, "multiply", elementwise::multiply);
        registry.register(namespace, "relu", elementwise::relu);
        registry.register(namespace, "copy", elementwise::copy);
        registry.register(namespace, "softmax", nn::softmax);

        match kind {
            DeviceKind::Accelerator { .. } => {
                registry.register(namespace, "matmul", nn::matmul_blocked);
                registry.register(namespace, "dense", nn::dense_blocked);
                registry.register(namespace, "conv2d_nhwc_hwio", nn::conv2d_blocked);
            }
            DeviceKind::HostCpu => {
                registry.register(namespace, "matmul", nn::matmul_ref);
                registry.register(namespace, "dense", nn::dense_ref);
                registry.register(namespace, "conv2d_nhwc_hwio", nn::conv2d_ref);
            }
        }

        registry
    }

    fn register(&mut self, namespace: &str, op: &str, kernel: KernelFn) {
        self.kernels.insert(format!("{namespace}.{op}"), kernel);
    }

    pub fn resolve(&self, symbol: &str) -> Option<KernelFn> {
        self.kernels.get(symbol).copied()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.kernels.keys().map(String::as_str)
    }
}

pub(crate) fn shape_fault(kernel: &str, msg: impl std::fmt::Display) -> DeviceFault {
    DeviceFault::Shape(format!("{kernel}: {msg}"))
}

pub(crate) fn expect_arity(kernel: &str, inputs: &[TensorRef<'_>], arity: usize) -> Result<(), DeviceFault> {
    if inputs.len() != arity {
        return Err(DeviceFault::ArgumentCount {
            function: kernel.to_string(),
            expected: arity,
            actual: inputs.len(),
        });
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_namespaces() {
        let accel = KernelRegistry::for_device(&DeviceKind::accelerator("v68"));
        assert!(accel.resolve("accel.conv2d_nhwc_hwio").is_some());
        assert!(accel.resolve("cpu.conv2d_nhwc_hwio").is_none());

        let cpu = KernelRegistry::for_device(&DeviceKind::HostCpu);
        assert!(cpu.resolve("cpu.matmul").is_some());
        assert!(cpu.symbols().all(|symbol| symbol.starts_with("cpu.")));
    }

    #[test]
    fn test_usize_array_attribute() {
        let attrs = KernelAttrs::new().with("strides", vec![2, 1]);
        assert_eq!(attrs.usize_array("strides", [1, 1]).unwrap(), [2, 1]);
        assert_eq!(attrs.usize_array("padding", [0; 4]).unwrap(), [0; 4]);
        assert!(attrs.usize_array::<4>("strides", [0; 4]).is_err());

        let negative = KernelAttrs::new().with("strides", vec![-1, 1]);
        assert!(negative.usize_array("strides", [1, 1]).is_err());
    }
}
