//! Reduction-heavy kernels: softmax, matmul, dense and conv2d.
//!
//! `*_ref` variants are the host reference loops. `*_blocked` variants split
//! the reduction axis into tiles of [`TILE`] and parallelise over output rows.

use rayon::prelude::*;

use super::{expect_arity, shape_fault, Element, KernelAttrs, TensorMut, TensorRef};
use crate::error::DeviceFault;
use crate::with_element_type;

/// Reduction tile length of the blocked kernels.
const TILE: usize = 8;

// ================================================================================================
// Softmax
// ================================================================================================

fn softmax_typed<T: Element>(input: &TensorRef<'_>, out: &mut TensorMut<'_>) -> Result<(), DeviceFault> {
    let values: Vec<T> = input.elements("softmax")?;
    let axis_len = input.shape.last().copied().unwrap_or(1);
    let mut result = Vec::with_capacity(values.len());
    if axis_len > 0 {
        for row in values.chunks(axis_len) {
            let max = row.iter().map(|v| v.to_f64()).fold(f64::NEG_INFINITY, f64::max);
            let exps: Vec<f64> = row.iter().map(|v| (v.to_f64() - max).exp()).collect();
            let sum: f64 = exps.iter().sum();
            result.extend(exps.into_iter().map(|e| T::from_f64(e / sum)));
        }
    }
    out.store(&result)
}

pub fn softmax(inputs: &[TensorRef<'_>], out: &mut TensorMut<'_>, _attrs: &KernelAttrs) -> Result<(), DeviceFault> {
    expect_arity("softmax", inputs, 1)?;
    if !out.dtype.is_float() {
        return Err(DeviceFault::DType {
            kernel: "softmax".to_string(),
            dtype: out.dtype,
        });
    }
    if inputs[0].shape != out.shape {
        return Err(shape_fault(
            "softmax",
            format!("input {:?} vs output {:?}", inputs[0].shape, out.shape),
        ));
    }
    with_element_type!(out.dtype, T => softmax_typed::<T>(&inputs[0], out))
}

// ================================================================================================
// Matmul / dense
// ================================================================================================

/// Layout of the right-hand operand.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Rhs {
    /// `[k, n]`
    KxN,
    /// `[n, k]`, as used by dense layers
    NxK,
}

struct GemmDims {
    m: usize,
    k: usize,
    n: usize,
}

fn gemm_dims(kernel: &str, inputs: &[TensorRef<'_>], out: &TensorMut<'_>, rhs: Rhs) -> Result<GemmDims, DeviceFault> {
    expect_arity(kernel, inputs, 2)?;
    let (a, b) = (inputs[0].shape, inputs[1].shape);
    if a.len() != 2 || b.len() != 2 {
        return Err(shape_fault(kernel, format!("expected 2-D operands, got {a:?} and {b:?}")));
    }
    let (m, k) = (a[0], a[1]);
    let (kb, n) = match rhs {
        Rhs::KxN => (b[0], b[1]),
        Rhs::NxK => (b[1], b[0]),
    };
    if k != kb {
        return Err(shape_fault(kernel, format!("inner dimensions differ: {a:?} x {b:?}")));
    }
    if out.shape != [m, n] {
        return Err(shape_fault(kernel, format!("output {:?} should be [{m}, {n}]", out.shape)));
    }
    if inputs[0].dtype != out.dtype || inputs[1].dtype != out.dtype {
        return Err(DeviceFault::DType {
            kernel: kernel.to_string(),
            dtype: inputs[1].dtype,
        });
    }
    Ok(GemmDims { m, k, n })
}

#[inline]
fn rhs_at<T: Element>(b: &[T], rhs: Rhs, dims: &GemmDims, p: usize, j: usize) -> T {
    match rhs {
        Rhs::KxN => b[p * dims.n + j],
        Rhs::NxK => b[j * dims.k + p],
    }
}

fn gemm_ref<T: Element>(kernel: &str, inputs: &[TensorRef<'_>], out: &mut TensorMut<'_>, rhs: Rhs) -> Result<(), DeviceFault> {
    let dims = gemm_dims(kernel, inputs, out, rhs)?;
    let a: Vec<T> = inputs[0].elements(kernel)?;
    let b: Vec<T> = inputs[1].elements(kernel)?;

    let mut c = vec![T::zero(); dims.m * dims.n];
    for i in 0..dims.m {
        for j in 0..dims.n {
            let mut acc = T::zero();
            for p in 0..dims.k {
                acc = acc.add(a[i * dims.k + p].mul(rhs_at(&b, rhs, &dims, p, j)));
            }
            c[i * dims.n + j] = acc;
        }
    }
    out.store(&c)
}

fn gemm_blocked<T: Element>(
    kernel: &str,
    inputs: &[TensorRef<'_>],
    out: &mut TensorMut<'_>,
    rhs: Rhs,
) -> Result<(), DeviceFault> {
    let dims = gemm_dims(kernel, inputs, out, rhs)?;
    let a: Vec<T> = inputs[0].elements(kernel)?;
    let b: Vec<T> = inputs[1].elements(kernel)?;

    let mut c = vec![T::zero(); dims.m * dims.n];
    if dims.n > 0 {
        c.par_chunks_mut(dims.n).enumerate().for_each(|(i, row)| {
            let a_row = &a[i * dims.k..(i + 1) * dims.k];
            for tile_start in (0..dims.k).step_by(TILE) {
                let tile_end = (tile_start + TILE).min(dims.k);
                for (j, slot) in row.iter_mut().enumerate() {
                    let mut partial = T::zero();
                    for (p, &lhs) in a_row.iter().enumerate().take(tile_end).skip(tile_start) {
                        partial = partial.add(lhs.mul(rhs_at(&b, rhs, &dims, p, j)));
                    }
                    *slot = slot.add(partial);
                }
            }
        });
    }
    out.store(&c)
}

pub fn matmul_ref(inputs: &[TensorRef<'_>], out: &mut TensorMut<'_>, _attrs: &KernelAttrs) -> Result<(), DeviceFault> {
    with_element_type!(out.dtype, T => gemm_ref::<T>("matmul", inputs, out, Rhs::KxN))
}

pub fn matmul_blocked(inputs: &[TensorRef<'_>], out: &mut TensorMut<'_>, _attrs: &KernelAttrs) -> Result<(), DeviceFault> {
    with_element_type!(out.dtype, T => gemm_blocked::<T>("matmul", inputs, out, Rhs::KxN))
}

pub fn dense_ref(inputs: &[TensorRef<'_>], out: &mut TensorMut<'_>, _attrs: &KernelAttrs) -> Result<(), DeviceFault> {
    with_element_type!(out.dtype, T => gemm_ref::<T>("dense", inputs, out, Rhs::NxK))
}

pub fn dense_blocked(inputs: &[TensorRef<'_>], out: &mut TensorMut<'_>, _attrs: &KernelAttrs) -> Result<(), DeviceFault> {
    with_element_type!(out.dtype, T => gemm_blocked::<T>("dense", inputs, out, Rhs::NxK))
}

// ================================================================================================
// Conv2d (NHWC data, HWIO weights)
// ================================================================================================

struct ConvGeometry {
    batch: usize,
    in_h: usize,
    in_w: usize,
    in_c: usize,
    k_h: usize,
    k_w: usize,
    out_h: usize,
    out_w: usize,
    out_c: usize,
    stride: [usize; 2],
    /// top, left, bottom, right
    padding: [usize; 4],
}

impl ConvGeometry {
    fn new(inputs: &[TensorRef<'_>], out: &TensorMut<'_>, attrs: &KernelAttrs) -> Result<Self, DeviceFault> {
        const KERNEL: &str = "conv2d_nhwc_hwio";
        expect_arity(KERNEL, inputs, 2)?;
        let (data, weight) = (inputs[0].shape, inputs[1].shape);
        if data.len() != 4 || weight.len() != 4 {
            return Err(shape_fault(KERNEL, format!("expected 4-D operands, got {data:?} and {weight:?}")));
        }
        if data[3] != weight[2] {
            return Err(shape_fault(
                KERNEL,
                format!("input channels {} do not match weight channels {}", data[3], weight[2]),
            ));
        }
        if inputs[0].dtype != out.dtype || inputs[1].dtype != out.dtype {
            return Err(DeviceFault::DType {
                kernel: KERNEL.to_string(),
                dtype: inputs[1].dtype,
            });
        }

        let stride = attrs.usize_array("strides", [1, 1])?;
        let padding = attrs.usize_array("padding", [0, 0, 0, 0])?;
        if stride.contains(&0) {
            return Err(DeviceFault::InvalidAttribute("strides must be positive".to_string()));
        }

        let padded_h = data[1] + padding[0] + padding[2];
        let padded_w = data[2] + padding[1] + padding[3];
        if padded_h < weight[0] || padded_w < weight[1] {
            return Err(shape_fault(KERNEL, format!("kernel {weight:?} larger than padded input {data:?}")));
        }
        let geometry = Self {
            batch: data[0],
            in_h: data[1],
            in_w: data[2],
            in_c: data[3],
            k_h: weight[0],
            k_w: weight[1],
            out_h: (padded_h - weight[0]) / stride[0] + 1,
            out_w: (padded_w - weight[1]) / stride[1] + 1,
            out_c: weight[3],
            stride,
            padding,
        };

        let expected = [geometry.batch, geometry.out_h, geometry.out_w, geometry.out_c];
        if out.shape != expected {
            return Err(shape_fault(KERNEL, format!("output {:?} should be {expected:?}", out.shape)));
        }
        Ok(geometry)
    }

    /// Input coordinate for output position `o` and kernel tap `k` along one
    /// axis, or `None` when it falls into padding.
    #[inline]
    fn source(o: usize, k: usize, stride: usize, pad: usize, extent: usize) -> Option<usize> {
        (o * stride + k).checked_sub(pad).filter(|&x| x < extent)
    }

    #[inline]
    fn data_index(&self, n: usize, y: usize, x: usize, c: usize) -> usize {
        ((n * self.in_h + y) * self.in_w + x) * self.in_c + c
    }

    #[inline]
    fn weight_index(&self, ky: usize, kx: usize, c: usize, o: usize) -> usize {
        ((ky * self.k_w + kx) * self.in_c + c) * self.out_c + o
    }
}

fn conv2d_ref_typed<T: Element>(
    inputs: &[TensorRef<'_>],
    out: &mut TensorMut<'_>,
    attrs: &KernelAttrs,
) -> Result<(), DeviceFault> {
    let g = ConvGeometry::new(inputs, out, attrs)?;
    let data: Vec<T> = inputs[0].elements("conv2d_nhwc_hwio")?;
    let weight: Vec<T> = inputs[1].elements("conv2d_nhwc_hwio")?;

    let mut result = Vec::with_capacity(out.num_elements());
    for n in 0..g.batch {
        for oy in 0..g.out_h {
            for ox in 0..g.out_w {
                for o in 0..g.out_c {
                    let mut acc = T::zero();
                    for ky in 0..g.k_h {
                        let Some(y) = ConvGeometry::source(oy, ky, g.stride[0], g.padding[0], g.in_h) else {
                            continue;
                        };
                        for kx in 0..g.k_w {
                            let Some(x) = ConvGeometry::source(ox, kx, g.stride[1], g.padding[1], g.in_w) else {
                                continue;
                            };
                            for c in 0..g.in_c {
                                acc = acc.add(data[g.data_index(n, y, x, c)].mul(weight[g.weight_index(ky, kx, c, o)]));
                            }
                        }
                    }
                    result.push(acc);
                }
            }
        }
    }
    out.store(&result)
}

fn conv2d_blocked_typed<T: Element>(
    inputs: &[TensorRef<'_>],
    out: &mut TensorMut<'_>,
    attrs: &KernelAttrs,
) -> Result<(), DeviceFault> {
    let g = ConvGeometry::new(inputs, out, attrs)?;
    let data: Vec<T> = inputs[0].elements("conv2d_nhwc_hwio")?;
    let weight: Vec<T> = inputs[1].elements("conv2d_nhwc_hwio")?;

    let row_len = g.out_w * g.out_c;
    let mut result = vec![T::zero(); out.num_elements()];
    if row_len > 0 {
        // One output row (fixed n, oy) per task; each kernel row is summed
        // into a partial vector over all output channels before accumulating.
        result.par_chunks_mut(row_len).enumerate().for_each(|(row_index, row)| {
            let n = row_index / g.out_h;
            let oy = row_index % g.out_h;
            let mut partial = vec![T::zero(); g.out_c];
            for ky in 0..g.k_h {
                let Some(y) = ConvGeometry::source(oy, ky, g.stride[0], g.padding[0], g.in_h) else {
                    continue;
                };
                for ox in 0..g.out_w {
                    partial.iter_mut().for_each(|p| *p = T::zero());
                    for kx in 0..g.k_w {
                        let Some(x) = ConvGeometry::source(ox, kx, g.stride[1], g.padding[1], g.in_w) else {
                            continue;
                        };
                        for c in 0..g.in_c {
                            let value = data[g.data_index(n, y, x, c)];
                            let taps = &weight[g.weight_index(ky, kx, c, 0)..g.weight_index(ky, kx, c, 0) + g.out_c];
                            for (p, &w) in partial.iter_mut().zip(taps) {
                                *p = p.add(value.mul(w));
                            }
                        }
                    }
                    let outputs = &mut row[ox * g.out_c..(ox + 1) * g.out_c];
                    for (slot, &p) in outputs.iter_mut().zip(&partial) {
                        *slot = slot.add(p);
                    }
                }
            }
        });
    }
    out.store(&result)
}

pub fn conv2d_ref(inputs: &[TensorRef<'_>], out: &mut TensorMut<'_>, attrs: &KernelAttrs) -> Result<(), DeviceFault> {
    with_element_type!(out.dtype, T => conv2d_ref_typed::<T>(inputs, out, attrs))
}

pub fn conv2d_blocked(inputs: &[TensorRef<'_>], out: &mut TensorMut<'_>, attrs: &KernelAttrs) -> Result<(), DeviceFault> {
    with_element_type!(out.dtype, T => conv2d_blocked_typed::<T>(inputs, out, attrs))
}
