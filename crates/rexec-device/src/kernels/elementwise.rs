//! Element-wise kernels with numpy-style broadcasting.

use super::{expect_arity, shape_fault, Element, KernelAttrs, TensorMut, TensorRef};
use crate::error::DeviceFault;
use crate::with_element_type;

/// Broadcast two shapes, right-aligned.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for axis in 0..rank {
        let l = dim_from_right(lhs, rank - 1 - axis);
        let r = dim_from_right(rhs, rank - 1 - axis);
        out[axis] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return None,
        };
    }
    Some(out)
}

fn dim_from_right(shape: &[usize], from_right: usize) -> usize {
    if from_right < shape.len() {
        shape[shape.len() - 1 - from_right]
    } else {
        1
    }
}

/// Row-major strides of `shape` laid over `target`, zero on broadcast axes.
fn broadcast_strides(shape: &[usize], target: &[usize]) -> Vec<usize> {
    let offset = target.len() - shape.len();
    let mut strides = vec![0; target.len()];
    let mut stride = 1;
    for axis in (0..shape.len()).rev() {
        if shape[axis] != 1 {
            strides[axis + offset] = stride;
        }
        stride *= shape[axis];
    }
    strides
}

fn binary_typed<T: Element>(
    kernel: &str,
    inputs: &[TensorRef<'_>],
    out: &mut TensorMut<'_>,
    op: fn(T, T) -> T,
) -> Result<(), DeviceFault> {
    let (lhs, rhs) = (&inputs[0], &inputs[1]);
    let shape = broadcast_shape(lhs.shape, rhs.shape)
        .ok_or_else(|| shape_fault(kernel, format!("cannot broadcast {:?} with {:?}", lhs.shape, rhs.shape)))?;
    if shape != out.shape {
        return Err(shape_fault(
            kernel,
            format!("output shape {:?} does not match broadcast shape {:?}", out.shape, shape),
        ));
    }

    let a: Vec<T> = lhs.elements(kernel)?;
    let b: Vec<T> = rhs.elements(kernel)?;

    // Fast path: identical shapes need no index arithmetic.
    if lhs.shape == rhs.shape {
        let values: Vec<T> = a.iter().zip(&b).map(|(&x, &y)| op(x, y)).collect();
        return out.store(&values);
    }

    let a_strides = broadcast_strides(lhs.shape, &shape);
    let b_strides = broadcast_strides(rhs.shape, &shape);
    let total = out.num_elements();
    let mut index = vec![0usize; shape.len()];
    let mut values = Vec::with_capacity(total);
    for _ in 0..total {
        let a_off: usize = index.iter().zip(&a_strides).map(|(i, s)| i * s).sum();
        let b_off: usize = index.iter().zip(&b_strides).map(|(i, s)| i * s).sum();
        values.push(op(a[a_off], b[b_off]));

        for axis in (0..shape.len()).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    out.store(&values)
}

fn binary(
    kernel: &str,
    inputs: &[TensorRef<'_>],
    out: &mut TensorMut<'_>,
    select: fn(crate::DType, &str, &[TensorRef<'_>], &mut TensorMut<'_>) -> Result<(), DeviceFault>,
) -> Result<(), DeviceFault> {
    expect_arity(kernel, inputs, 2)?;
    if inputs[0].dtype != inputs[1].dtype || inputs[0].dtype != out.dtype {
        return Err(DeviceFault::DType {
            kernel: kernel.to_string(),
            dtype: inputs[1].dtype,
        });
    }
    select(out.dtype, kernel, inputs, out)
}

pub fn add(inputs: &[TensorRef<'_>], out: &mut TensorMut<'_>, _attrs: &KernelAttrs) -> Result<(), DeviceFault> {
    binary("add", inputs, out, |dtype, kernel, inputs, out| {
        with_element_type!(dtype, T => binary_typed::<T>(kernel, inputs, out, <T as Element>::add))
    })
}

pub fn subtract(inputs: &[TensorRef<'_>], out: &mut TensorMut<'_>, _attrs: &KernelAttrs) -> Result<(), DeviceFault> {
    binary("subtract", inputs, out, |dtype, kernel, inputs, out| {
        with_element_type!(dtype, T => binary_typed::<T>(kernel, inputs, out, <T as Element>::sub))
    })
}

pub fn multiply(inputs: &[TensorRef<'_>], out: &mut TensorMut<'_>, _attrs: &KernelAttrs) -> Result<(), DeviceFault> {
    binary("multiply", inputs, out, |dtype, kernel, inputs, out| {
        with_element_type!(dtype, T => binary_typed::<T>(kernel, inputs, out, <T as Element>::mul))
    })
}

fn relu_typed<T: Element>(input: &TensorRef<'_>, out: &mut TensorMut<'_>) -> Result<(), DeviceFault> {
    let zero = T::zero();
    let values: Vec<T> = input
        .elements::<T>("relu")?
        .into_iter()
        .map(|x| if x > zero { x } else { zero })
        .collect();
    out.store(&values)
}

pub fn relu(inputs: &[TensorRef<'_>], out: &mut TensorMut<'_>, _attrs: &KernelAttrs) -> Result<(), DeviceFault> {
    expect_arity("relu", inputs, 1)?;
    if inputs[0].shape != out.shape {
        return Err(shape_fault(
            "relu",
            format!("input {:?} vs output {:?}", inputs[0].shape, out.shape),
        ));
    }
    with_element_type!(out.dtype, T => relu_typed::<T>(&inputs[0], out))
}

/// Byte copy between tensors of equal size; the output may have a different
/// shape, which is how reshapes are lowered.
pub fn copy(inputs: &[TensorRef<'_>], out: &mut TensorMut<'_>, _attrs: &KernelAttrs) -> Result<(), DeviceFault> {
    expect_arity("copy", inputs, 1)?;
    let input = &inputs[0];
    if input.dtype != out.dtype {
        return Err(DeviceFault::DType {
            kernel: "copy".to_string(),
            dtype: input.dtype,
        });
    }
    if input.data.len() != out.data.len() {
        return Err(shape_fault(
            "copy",
            format!("cannot copy {:?} into {:?}", input.shape, out.shape),
        ));
    }
    out.data.copy_from_slice(input.data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::test_util::{run, Owned};

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(broadcast_shape(&[2], &[1]), Some(vec![2]));
        assert_eq!(broadcast_shape(&[4, 1, 3], &[5, 1]), Some(vec![4, 5, 3]));
        assert_eq!(broadcast_shape(&[], &[3]), Some(vec![3]));
        assert_eq!(broadcast_shape(&[2, 3], &[4]), None);
    }

    #[test]
    fn test_add_int8_broadcast() {
        let x = Owned::new(&[2], &[2i8, 3]);
        let y = Owned::new(&[1], &[4i8]);
        let out: Vec<i8> = run(add, &[&x, &y], &[2], &KernelAttrs::new()).unwrap();
        assert_eq!(out, vec![6, 7]);
    }

    #[test]
    fn test_bias_style_broadcast() {
        let x = Owned::new(&[2, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let bias = Owned::new(&[3], &[10.0f32, 20.0, 30.0]);
        let out: Vec<f32> = run(add, &[&x, &bias], &[2, 3], &KernelAttrs::new()).unwrap();
        assert_eq!(out, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);

        let col = Owned::new(&[2, 1], &[1.0f32, 2.0]);
        let out: Vec<f32> = run(multiply, &[&x, &col], &[2, 3], &KernelAttrs::new()).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 8.0, 10.0, 12.0]);
    }

    #[test]
    fn test_subtract_wraps_unsigned() {
        let x = Owned::new(&[2], &[0u8, 5]);
        let y = Owned::new(&[2], &[1u8, 2]);
        let out: Vec<u8> = run(subtract, &[&x, &y], &[2], &KernelAttrs::new()).unwrap();
        assert_eq!(out, vec![255, 3]);
    }

    #[test]
    fn test_mismatched_shapes_fault() {
        let x = Owned::new(&[2, 3], &[0.0f32; 6]);
        let y = Owned::new(&[4], &[0.0f32; 4]);
        let err = run::<f32>(add, &[&x, &y], &[2, 3], &KernelAttrs::new()).unwrap_err();
        assert!(matches!(err, DeviceFault::Shape(_)));
    }

    #[test]
    fn test_mixed_dtypes_fault() {
        let x = Owned::new(&[2], &[1.0f32, 2.0]);
        let y = Owned::new(&[2], &[1i32, 2]);
        let err = run::<f32>(add, &[&x, &y], &[2], &KernelAttrs::new()).unwrap_err();
        assert!(matches!(err, DeviceFault::DType { .. }));
    }

    #[test]
    fn test_relu_and_copy() {
        let x = Owned::new(&[4], &[-1.0f32, 0.5, -0.0, 2.0]);
        let out: Vec<f32> = run(relu, &[&x], &[4], &KernelAttrs::new()).unwrap();
        assert_eq!(out, vec![0.0, 0.5, 0.0, 2.0]);

        let copied: Vec<f32> = run(copy, &[&x], &[2, 2], &KernelAttrs::new()).unwrap();
        assert_eq!(copied, vec![-1.0, 0.5, -0.0, 2.0]);
    }
}
