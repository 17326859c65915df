//! Module images: the payload of a staged artifact.
//!
//! An image is one of three executable forms, serialized with bincode:
//!
//! - [`GraphModule`]: a node list walked by the graph interpreter
//! - [`AotModule`]: a fixed step list behind a packed calling convention
//! - [`VmModule`]: register bytecode functions with symbolic shapes
//!
//! Every image records the [`DeviceKind`] it was built for; loading it on a
//! different device fails at staging time.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DeviceFault;
use crate::kernels::KernelAttrs;
use crate::types::{DType, DeviceKind, TensorSpec};

/// Bumped whenever the image layout changes.
pub const IMAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleImage {
    pub format_version: u32,
    pub target: DeviceKind,
    pub body: ModuleBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModuleBody {
    Graph(GraphModule),
    Aot(AotModule),
    Vm(VmModule),
}

impl ModuleImage {
    pub fn new(target: DeviceKind, body: ModuleBody) -> Self {
        Self {
            format_version: IMAGE_FORMAT_VERSION,
            target,
            body,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Every kernel symbol the image calls.
    pub fn kernel_symbols(&self) -> Vec<&str> {
        let mut symbols: Vec<&str> = match &self.body {
            ModuleBody::Graph(graph) => graph.nodes.iter().map(|node| node.kernel.as_str()).collect(),
            ModuleBody::Aot(aot) => aot.steps.iter().map(|step| step.kernel.as_str()).collect(),
            ModuleBody::Vm(vm) => vm
                .functions
                .iter()
                .flat_map(|function| function.instructions.iter())
                .filter_map(|instruction| match instruction {
                    VmInstruction::Invoke { kernel, .. } => Some(kernel.as_str()),
                    _ => None,
                })
                .collect(),
        };
        symbols.sort_unstable();
        symbols.dedup();
        symbols
    }

    /// Constants the device must upload when the module is staged.
    pub fn constants(&self) -> &[Constant] {
        match &self.body {
            ModuleBody::Graph(_) => &[],
            ModuleBody::Aot(aot) => &aot.constants,
            ModuleBody::Vm(vm) => &vm.constants,
        }
    }
}

/// A tensor baked into the module at build time.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub name: String,
    pub spec: TensorSpec,
    pub data: Vec<u8>,
}

impl fmt::Debug for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constant")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ================================================================================================
// Graph
// ================================================================================================

/// Index into the graph's value list: inputs first, then one value per node.
pub type ValueId = usize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphInput {
    pub name: String,
    pub spec: TensorSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub kernel: String,
    pub attrs: KernelAttrs,
    pub args: Vec<ValueId>,
    pub output: TensorSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphModule {
    pub inputs: Vec<GraphInput>,
    pub nodes: Vec<GraphNode>,
    pub outputs: Vec<ValueId>,
}

// ================================================================================================
// AOT
// ================================================================================================

/// Operand location in the AOT calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    Input(usize),
    Output(usize),
    Constant(usize),
    Workspace(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AotStep {
    pub kernel: String,
    pub attrs: KernelAttrs,
    pub args: Vec<Slot>,
    pub output: Slot,
}

/// Ahead-of-time module. Called as `entry(inputs..., outputs...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AotModule {
    pub entry: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub constants: Vec<Constant>,
    /// Statically planned scratch tensors, allocated for each call.
    pub workspace: Vec<TensorSpec>,
    pub steps: Vec<AotStep>,
}

// ================================================================================================
// VM
// ================================================================================================

/// Register index in a VM function frame.
pub type Reg = usize;

/// Integer shape arithmetic over symbolic dimension variables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeExpr {
    Const(i64),
    Var(String),
    Add(Box<ShapeExpr>, Box<ShapeExpr>),
    Sub(Box<ShapeExpr>, Box<ShapeExpr>),
    Mul(Box<ShapeExpr>, Box<ShapeExpr>),
    FloorDiv(Box<ShapeExpr>, Box<ShapeExpr>),
}

impl ShapeExpr {
    pub fn var(name: impl Into<String>) -> Self {
        ShapeExpr::Var(name.into())
    }

    pub fn as_const(&self) -> Option<i64> {
        match self {
            ShapeExpr::Const(value) => Some(*value),
            _ => None,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(self, rhs: ShapeExpr) -> Self {
        match (&self, &rhs) {
            (ShapeExpr::Const(a), ShapeExpr::Const(b)) => ShapeExpr::Const(a + b),
            (_, ShapeExpr::Const(0)) => self,
            _ => ShapeExpr::Add(Box::new(self), Box::new(rhs)),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn sub(self, rhs: ShapeExpr) -> Self {
        match (&self, &rhs) {
            (ShapeExpr::Const(a), ShapeExpr::Const(b)) => ShapeExpr::Const(a - b),
            (_, ShapeExpr::Const(0)) => self,
            _ => ShapeExpr::Sub(Box::new(self), Box::new(rhs)),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn mul(self, rhs: ShapeExpr) -> Self {
        match (&self, &rhs) {
            (ShapeExpr::Const(a), ShapeExpr::Const(b)) => ShapeExpr::Const(a * b),
            (_, ShapeExpr::Const(1)) => self,
            _ => ShapeExpr::Mul(Box::new(self), Box::new(rhs)),
        }
    }

    pub fn floor_div(self, rhs: ShapeExpr) -> Self {
        match (&self, &rhs) {
            (ShapeExpr::Const(a), ShapeExpr::Const(b)) if *b != 0 => ShapeExpr::Const(a.div_euclid(*b)),
            (_, ShapeExpr::Const(1)) => self,
            _ => ShapeExpr::FloorDiv(Box::new(self), Box::new(rhs)),
        }
    }

    /// Evaluate against the bindings of the current invocation.
    pub fn eval(&self, env: &HashMap<String, i64>) -> Result<i64, DeviceFault> {
        let binary = |a: &ShapeExpr, b: &ShapeExpr| -> Result<(i64, i64), DeviceFault> { Ok((a.eval(env)?, b.eval(env)?)) };
        let overflow = || DeviceFault::ShapeExpr(format!("overflow evaluating {self}"));
        match self {
            ShapeExpr::Const(value) => Ok(*value),
            ShapeExpr::Var(name) => env
                .get(name)
                .copied()
                .ok_or_else(|| DeviceFault::ShapeExpr(format!("unbound shape variable `{name}`"))),
            ShapeExpr::Add(a, b) => {
                let (a, b) = binary(a, b)?;
                a.checked_add(b).ok_or_else(overflow)
            }
            ShapeExpr::Sub(a, b) => {
                let (a, b) = binary(a, b)?;
                a.checked_sub(b).ok_or_else(overflow)
            }
            ShapeExpr::Mul(a, b) => {
                let (a, b) = binary(a, b)?;
                a.checked_mul(b).ok_or_else(overflow)
            }
            ShapeExpr::FloorDiv(a, b) => {
                let (a, b) = binary(a, b)?;
                if b == 0 {
                    return Err(DeviceFault::ShapeExpr(format!("division by zero in {self}")));
                }
                Ok(a.div_euclid(b))
            }
        }
    }
}

impl From<usize> for ShapeExpr {
    fn from(value: usize) -> Self {
        ShapeExpr::Const(value as i64)
    }
}

impl fmt::Display for ShapeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeExpr::Const(value) => write!(f, "{value}"),
            ShapeExpr::Var(name) => f.write_str(name),
            ShapeExpr::Add(a, b) => write!(f, "({a} + {b})"),
            ShapeExpr::Sub(a, b) => write!(f, "({a} - {b})"),
            ShapeExpr::Mul(a, b) => write!(f, "({a} * {b})"),
            ShapeExpr::FloorDiv(a, b) => write!(f, "({a} // {b})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VmInstruction {
    /// Check the dtype and rank of `reg`, binding unbound variables in `dims`
    /// and checking every other dimension.
    MatchShape { reg: Reg, dtype: DType, dims: Vec<ShapeExpr> },
    LoadConst { dst: Reg, index: usize },
    /// Allocate an uninitialised tensor in default memory.
    AllocTensor { dst: Reg, dtype: DType, shape: Vec<ShapeExpr> },
    Invoke {
        kernel: String,
        attrs: KernelAttrs,
        args: Vec<Reg>,
        out: Reg,
    },
    Move { dst: Reg, src: Reg },
    Ret { regs: Vec<Reg> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmFunction {
    pub name: String,
    /// Arguments land in registers `0..num_params`.
    pub num_params: usize,
    pub num_registers: usize,
    pub instructions: Vec<VmInstruction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmModule {
    pub functions: Vec<VmFunction>,
    pub constants: Vec<Constant>,
}

impl VmModule {
    pub fn function(&self, name: &str) -> Option<&VmFunction> {
        self.functions.iter().find(|function| function.name == name)
    }
}
