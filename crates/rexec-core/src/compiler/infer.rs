//! Type and shape inference over [`Computation`].
//!
//! Shapes are [`ShapeExpr`] vectors so that symbolic input dimensions flow
//! through every operator; static programs simply end up with constants.

use std::collections::HashMap;

use rexec_device::{DType, ShapeExpr};

use super::ir::{Computation, Node, Op};
use crate::artifact::Dim;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ValueType {
    pub dtype: DType,
    pub shape: Vec<ShapeExpr>,
}

impl ValueType {
    fn new(dtype: DType, shape: Vec<ShapeExpr>) -> Self {
        Self { dtype, shape }
    }

    fn from_static(dtype: DType, shape: &[usize]) -> Self {
        Self::new(dtype, shape.iter().map(|&d| ShapeExpr::from(d)).collect())
    }

    /// Concrete shape, if every dimension folded to a constant.
    pub fn static_shape(&self) -> Option<Vec<usize>> {
        self.shape
            .iter()
            .map(|expr| expr.as_const().and_then(|d| usize::try_from(d).ok()))
            .collect()
    }

    /// Dims for a signature; non-constant expressions are rendered as their
    /// symbolic form.
    pub fn dims(&self) -> Vec<Dim> {
        self.shape
            .iter()
            .map(|expr| match expr.as_const().and_then(|d| usize::try_from(d).ok()) {
                Some(d) => Dim::Static(d),
                None => Dim::Symbolic(expr.to_string()),
            })
            .collect()
    }

    fn describe(&self) -> String {
        let dims: Vec<String> = self.shape.iter().map(ToString::to_string).collect();
        format!("{}[{}]", self.dtype, dims.join(", "))
    }
}

/// Where a named value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueRef {
    Input(usize),
    Param(usize),
    Node(usize),
}

pub(crate) struct Typed<'a> {
    pub computation: &'a Computation,
    pub inputs: Vec<ValueType>,
    pub params: Vec<ValueType>,
    pub nodes: Vec<ValueType>,
    pub node_args: Vec<Vec<ValueRef>>,
    pub outputs: Vec<ValueRef>,
}

impl Typed<'_> {
    pub fn value_type(&self, value: ValueRef) -> &ValueType {
        match value {
            ValueRef::Input(i) => &self.inputs[i],
            ValueRef::Param(i) => &self.params[i],
            ValueRef::Node(i) => &self.nodes[i],
        }
    }

    pub fn has_symbolic_dims(&self) -> bool {
        self.computation.inputs.iter().any(|input| !input.is_static())
    }
}

/// Resolve names and infer the type of every value.
pub(crate) fn infer(computation: &Computation) -> Result<Typed<'_>> {
    let mut names: HashMap<String, ValueRef> = HashMap::new();
    let inputs: Vec<ValueType> = computation
        .inputs
        .iter()
        .map(|input| {
            ValueType::new(
                input.dtype,
                input
                    .shape
                    .iter()
                    .map(|dim| match dim {
                        Dim::Static(d) => ShapeExpr::from(*d),
                        Dim::Symbolic(name) => ShapeExpr::var(name.clone()),
                    })
                    .collect(),
            )
        })
        .collect();
    for (i, input) in computation.inputs.iter().enumerate() {
        define(&mut names, &computation.name, &input.name, ValueRef::Input(i))?;
    }
    let params: Vec<ValueType> = computation
        .params
        .iter()
        .map(|param| ValueType::from_static(param.dtype, &param.shape))
        .collect();
    for (i, param) in computation.params.iter().enumerate() {
        define(&mut names, &computation.name, &param.name, ValueRef::Param(i))?;
    }

    let mut typed = Typed {
        computation,
        inputs,
        params,
        nodes: Vec::with_capacity(computation.nodes.len()),
        node_args: Vec::with_capacity(computation.nodes.len()),
        outputs: Vec::new(),
    };

    for (i, node) in computation.nodes.iter().enumerate() {
        if node.args.len() != node.op.arity() {
            return Err(Error::compilation(format!(
                "`{}` ({}) takes {} arguments, got {}",
                node.name,
                node.op,
                node.op.arity(),
                node.args.len()
            )));
        }
        let args = node
            .args
            .iter()
            .map(|arg| lookup(&names, node, arg))
            .collect::<Result<Vec<_>>>()?;
        let arg_types: Vec<&ValueType> = args.iter().map(|&arg| typed.value_type(arg)).collect();
        let result = infer_node(node, &arg_types)?;
        typed.nodes.push(result);
        typed.node_args.push(args);
        define(&mut names, &computation.name, &node.name, ValueRef::Node(i))?;
    }

    typed.outputs = computation
        .outputs
        .iter()
        .map(|name| {
            names
                .get(name)
                .copied()
                .ok_or_else(|| Error::compilation(format!("output `{name}` is not defined")))
        })
        .collect::<Result<Vec<_>>>()?;
    if typed.outputs.is_empty() {
        return Err(Error::compilation(format!("`{}` has no outputs", computation.name)));
    }
    Ok(typed)
}

fn define(names: &mut HashMap<String, ValueRef>, computation: &str, name: &str, value: ValueRef) -> Result<()> {
    if names.insert(name.to_string(), value).is_some() {
        return Err(Error::compilation(format!("`{computation}` defines `{name}` more than once")));
    }
    Ok(())
}

fn lookup(names: &HashMap<String, ValueRef>, node: &Node, arg: &str) -> Result<ValueRef> {
    names
        .get(arg)
        .copied()
        .ok_or_else(|| Error::compilation(format!("`{}` reads `{arg}` before it is defined", node.name)))
}

fn infer_node(node: &Node, args: &[&ValueType]) -> Result<ValueType> {
    let fail = |msg: String| Error::compilation(format!("`{}` ({}): {msg}", node.name, node.op));

    let dtype = args[0].dtype;
    if let Some(other) = args.iter().find(|arg| arg.dtype != dtype) {
        return Err(fail(format!("mixed dtypes {dtype} and {}", other.dtype)));
    }
    let rank = |arg: &ValueType, expected: usize| -> Result<()> {
        if arg.shape.len() != expected {
            return Err(fail(format!("expects rank {expected}, got {}", arg.describe())));
        }
        Ok(())
    };
    // Differing symbolic dims are left to the device, which checks the
    // actual extents on every call.
    let same = |a: &ShapeExpr, b: &ShapeExpr, what: &str| -> Result<()> {
        if a != b && a.as_const().is_some() && b.as_const().is_some() {
            return Err(fail(format!("{what} disagree: {a} vs {b}")));
        }
        Ok(())
    };

    match &node.op {
        Op::Add | Op::Subtract | Op::Multiply => {
            let shape = broadcast(&args[0].shape, &args[1].shape)
                .ok_or_else(|| fail(format!("cannot broadcast {} with {}", args[0].describe(), args[1].describe())))?;
            Ok(ValueType::new(dtype, shape))
        }
        Op::BiasAdd => {
            rank(args[1], 1)?;
            let channels = args[0]
                .shape
                .last()
                .ok_or_else(|| fail("bias_add needs at least rank 1 data".into()))?;
            same(channels, &args[1].shape[0], "channel counts")?;
            Ok(args[0].clone())
        }
        Op::Relu => Ok(args[0].clone()),
        Op::Softmax => {
            if !dtype.is_float() {
                return Err(fail(format!("softmax is defined for floating point, got {dtype}")));
            }
            if args[0].shape.is_empty() {
                return Err(fail("softmax needs at least rank 1".into()));
            }
            Ok(args[0].clone())
        }
        Op::Matmul => {
            rank(args[0], 2)?;
            rank(args[1], 2)?;
            same(&args[0].shape[1], &args[1].shape[0], "inner dimensions")?;
            Ok(ValueType::new(dtype, vec![args[0].shape[0].clone(), args[1].shape[1].clone()]))
        }
        Op::Dense => {
            rank(args[0], 2)?;
            rank(args[1], 2)?;
            same(&args[0].shape[1], &args[1].shape[1], "inner dimensions")?;
            Ok(ValueType::new(dtype, vec![args[0].shape[0].clone(), args[1].shape[0].clone()]))
        }
        Op::Conv2d { strides, padding } => {
            rank(args[0], 4)?;
            rank(args[1], 4)?;
            if strides.contains(&0) {
                return Err(fail("strides must be positive".into()));
            }
            let (data, weight) = (&args[0].shape, &args[1].shape);
            same(&data[3], &weight[2], "input channels")?;
            let extent = |size: &ShapeExpr, before: usize, after: usize, kernel: &ShapeExpr, stride: usize| {
                size.clone()
                    .add(ShapeExpr::from(before + after))
                    .sub(kernel.clone())
                    .floor_div(ShapeExpr::from(stride))
                    .add(ShapeExpr::Const(1))
            };
            let out_h = extent(&data[1], padding[0], padding[2], &weight[0], strides[0]);
            let out_w = extent(&data[2], padding[1], padding[3], &weight[1], strides[1]);
            for extent in [&out_h, &out_w] {
                if matches!(extent.as_const(), Some(d) if d < 1) {
                    return Err(fail(format!("kernel does not fit the padded input (output extent {extent})")));
                }
            }
            Ok(ValueType::new(dtype, vec![data[0].clone(), out_h, out_w, weight[3].clone()]))
        }
        Op::Reshape { shape } => {
            let input = args[0]
                .static_shape()
                .ok_or_else(|| fail(format!("reshape needs a static input, got {}", args[0].describe())))?;
            let (from, to): (usize, usize) = (input.iter().product(), shape.iter().product());
            if from != to {
                return Err(fail(format!("cannot reshape {input:?} ({from} elements) to {shape:?} ({to} elements)")));
            }
            Ok(ValueType::from_static(dtype, shape))
        }
    }
}

/// Numpy broadcasting over symbolic dims. Two dims unify when they are
/// structurally equal or one of them is the constant 1.
fn broadcast(lhs: &[ShapeExpr], rhs: &[ShapeExpr]) -> Option<Vec<ShapeExpr>> {
    let rank = lhs.len().max(rhs.len());
    let one = ShapeExpr::Const(1);
    let dim = |shape: &[ShapeExpr], i: usize| -> ShapeExpr {
        let offset = rank - shape.len();
        if i < offset {
            one.clone()
        } else {
            shape[i - offset].clone()
        }
    };
    (0..rank)
        .map(|i| {
            let (a, b) = (dim(lhs, i), dim(rhs, i));
            if a == b || b == one {
                Some(a)
            } else if a == one {
                Some(b)
            } else {
                None
            }
        })
        .collect()
}
