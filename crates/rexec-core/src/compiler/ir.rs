//! Computation IR
//!
//! A [`Computation`] is a named, topologically ordered operator list over
//! named values. Inputs may carry symbolic dimensions; parameters are static
//! and get their values at build time.
//!
//! The IR is serde-friendly so external models can be loaded from JSON:
//!
//! ```json
//! {
//!   "name": "main",
//!   "inputs": [{ "name": "x", "dtype": "f32", "shape": [1, "n"] }],
//!   "params": [{ "name": "w", "dtype": "f32", "shape": [4, 4] }],
//!   "nodes": [{ "name": "y", "op": "dense", "args": ["x", "w"] }],
//!   "outputs": ["y"]
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use rexec_device::DType;
use serde::{Deserialize, Serialize};

use crate::artifact::{Dim, TensorSignature};
use crate::error::{Error, Result};
use crate::tensor::HostTensor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Element-wise with numpy broadcasting.
    Add,
    Subtract,
    Multiply,
    /// `[..., c] + [c]`
    BiasAdd,
    Relu,
    /// Over the innermost axis.
    Softmax,
    /// `[m, k] x [k, n]`
    Matmul,
    /// `[m, k] x [n, k]^T`
    Dense,
    /// NHWC data, HWIO weights. Padding is `[top, left, bottom, right]`.
    Conv2d {
        #[serde(default = "unit_strides")]
        strides: [usize; 2],
        #[serde(default)]
        padding: [usize; 4],
    },
    Reshape {
        shape: Vec<usize>,
    },
}

fn unit_strides() -> [usize; 2] {
    [1, 1]
}

impl Op {
    pub fn arity(&self) -> usize {
        match self {
            Op::Relu | Op::Softmax | Op::Reshape { .. } => 1,
            _ => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Subtract => "subtract",
            Op::Multiply => "multiply",
            Op::BiasAdd => "bias_add",
            Op::Relu => "relu",
            Op::Softmax => "softmax",
            Op::Matmul => "matmul",
            Op::Dense => "dense",
            Op::Conv2d { .. } => "conv2d",
            Op::Reshape { .. } => "reshape",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(flatten)]
    pub op: Op,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Computation {
    pub name: String,
    pub inputs: Vec<TensorSignature>,
    #[serde(default)]
    pub params: Vec<ParamDecl>,
    pub nodes: Vec<Node>,
    pub outputs: Vec<String>,
}

impl Computation {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| Error::compilation(format!("malformed computation: {err}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| Error::compilation(err.to_string()))
    }
}

/// Handle to a value while building a [`Computation`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Value(String);

impl Value {
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Incremental builder for [`Computation`].
///
/// ```rust
/// use rexec_core::compiler::ComputationBuilder;
/// use rexec_core::{DType, Dim};
///
/// let mut b = ComputationBuilder::new("main");
/// let x = b.input("x", DType::F32, vec![Dim::symbolic("m"), Dim::symbolic("n")]);
/// let y = b.matmul(&x, &x);
/// b.output(&y);
/// let computation = b.build().unwrap();
/// assert_eq!(computation.nodes.len(), 1);
/// ```
pub struct ComputationBuilder {
    computation: Computation,
}

impl ComputationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            computation: Computation {
                name: name.into(),
                inputs: Vec::new(),
                params: Vec::new(),
                nodes: Vec::new(),
                outputs: Vec::new(),
            },
        }
    }

    pub fn input(&mut self, name: impl Into<String>, dtype: DType, shape: Vec<Dim>) -> Value {
        let name = name.into();
        self.computation.inputs.push(TensorSignature::new(name.clone(), dtype, shape));
        Value(name)
    }

    pub fn static_input(&mut self, name: impl Into<String>, dtype: DType, shape: &[usize]) -> Value {
        self.input(name, dtype, shape.iter().copied().map(Dim::Static).collect())
    }

    pub fn param(&mut self, name: impl Into<String>, dtype: DType, shape: &[usize]) -> Value {
        let name = name.into();
        self.computation.params.push(ParamDecl {
            name: name.clone(),
            dtype,
            shape: shape.to_vec(),
        });
        Value(name)
    }

    pub fn op(&mut self, op: Op, args: &[&Value]) -> Value {
        let name = format!("%{}_{}", self.computation.nodes.len(), op.name());
        self.computation.nodes.push(Node {
            name: name.clone(),
            op,
            args: args.iter().map(|value| value.0.clone()).collect(),
        });
        Value(name)
    }

    pub fn add(&mut self, a: &Value, b: &Value) -> Value {
        self.op(Op::Add, &[a, b])
    }

    pub fn subtract(&mut self, a: &Value, b: &Value) -> Value {
        self.op(Op::Subtract, &[a, b])
    }

    pub fn multiply(&mut self, a: &Value, b: &Value) -> Value {
        self.op(Op::Multiply, &[a, b])
    }

    pub fn bias_add(&mut self, x: &Value, bias: &Value) -> Value {
        self.op(Op::BiasAdd, &[x, bias])
    }

    pub fn relu(&mut self, x: &Value) -> Value {
        self.op(Op::Relu, &[x])
    }

    pub fn softmax(&mut self, x: &Value) -> Value {
        self.op(Op::Softmax, &[x])
    }

    pub fn matmul(&mut self, a: &Value, b: &Value) -> Value {
        self.op(Op::Matmul, &[a, b])
    }

    pub fn dense(&mut self, x: &Value, weight: &Value) -> Value {
        self.op(Op::Dense, &[x, weight])
    }

    pub fn conv2d(&mut self, data: &Value, weight: &Value, strides: [usize; 2], padding: [usize; 4]) -> Value {
        self.op(Op::Conv2d { strides, padding }, &[data, weight])
    }

    pub fn reshape(&mut self, x: &Value, shape: &[usize]) -> Value {
        self.op(Op::Reshape { shape: shape.to_vec() }, &[x])
    }

    pub fn output(&mut self, value: &Value) {
        self.computation.outputs.push(value.0.clone());
    }

    /// Finish the computation. Structural errors are reported here; shape
    /// errors when it is compiled.
    pub fn build(self) -> Result<Computation> {
        let computation = self.computation;
        if computation.outputs.is_empty() {
            return Err(Error::compilation(format!("computation `{}` has no outputs", computation.name)));
        }
        Ok(computation)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExternalParam {
    dtype: DType,
    shape: Vec<usize>,
    values: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExternalModel {
    computation: Computation,
    #[serde(default)]
    params: BTreeMap<String, ExternalParam>,
}

/// A computation together with the parameter values shipped alongside it.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub computation: Computation,
    pub params: BTreeMap<String, HostTensor>,
}

/// Load a JSON model file: `{"computation": {...}, "params": {"w": {"dtype",
/// "shape", "values"}}}`.
pub fn load_external_model(path: impl AsRef<Path>) -> Result<LoadedModel> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|err| Error::compilation(format!("cannot read model {}: {err}", path.display())))?;
    let model: ExternalModel = serde_json::from_slice(&bytes)
        .map_err(|err| Error::compilation(format!("malformed model {}: {err}", path.display())))?;

    let params = model
        .params
        .into_iter()
        .map(|(name, param)| {
            let tensor = HostTensor::from_f64(param.shape, param.dtype, &param.values)
                .map_err(|err| Error::compilation(format!("parameter `{name}`: {err}")))?;
            Ok((name, tensor))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;

    tracing::debug!(
        path = %path.display(),
        computation = %model.computation.name,
        nodes = model.computation.nodes.len(),
        params = params.len(),
        "external_model_loaded"
    );
    Ok(LoadedModel {
        computation: model.computation,
        params,
    })
}
