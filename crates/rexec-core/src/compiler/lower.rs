//! Lowering typed computations to device module images.

use std::collections::{BTreeMap, HashMap};

use rexec_device::{
    AotModule, AotStep, Constant, DeviceKind, GraphInput, GraphModule, GraphNode, KernelAttrs, ShapeExpr, Slot,
    TensorSpec, VmFunction, VmInstruction, VmModule,
};

use super::infer::{Typed, ValueRef, ValueType};
use super::ir::Op;
use crate::artifact::{Dim, EntryPoint, TensorSignature};
use crate::error::{Error, Result};
use crate::tensor::HostTensor;

/// Kernel suffix and attributes an operator lowers to.
fn kernel_for(op: &Op) -> (&'static str, KernelAttrs) {
    match op {
        Op::Add | Op::BiasAdd => ("add", KernelAttrs::new()),
        Op::Subtract => ("subtract", KernelAttrs::new()),
        Op::Multiply => ("multiply", KernelAttrs::new()),
        Op::Relu => ("relu", KernelAttrs::new()),
        Op::Softmax => ("softmax", KernelAttrs::new()),
        Op::Matmul => ("matmul", KernelAttrs::new()),
        Op::Dense => ("dense", KernelAttrs::new()),
        Op::Conv2d { strides, padding } => (
            "conv2d_nhwc_hwio",
            KernelAttrs::new()
                .with("strides", strides.iter().map(|&s| s as i64).collect())
                .with("padding", padding.iter().map(|&p| p as i64).collect()),
        ),
        // Row-major layout makes a reshape a plain byte copy.
        Op::Reshape { .. } => ("copy", KernelAttrs::new()),
    }
}

fn symbol(device: &DeviceKind, kernel: &str) -> String {
    format!("{}.{kernel}", device.kernel_namespace())
}

fn static_spec(ty: &ValueType, what: impl FnOnce() -> String, executor: &str) -> Result<TensorSpec> {
    let shape = ty.static_shape().ok_or_else(|| {
        Error::compilation(format!(
            "{} has symbolic shape; the {executor} executor needs static shapes, build for the VM instead",
            what()
        ))
    })?;
    Ok(TensorSpec::new(ty.dtype, shape))
}

/// Signature of the computation's entry point as the host sees it.
pub(crate) fn entry_point(name: &str, typed: &Typed<'_>, include_params: bool) -> EntryPoint {
    let computation = typed.computation;
    let mut inputs = computation.inputs.clone();
    if include_params {
        inputs.extend(computation.params.iter().zip(&typed.params).map(|(param, ty)| {
            TensorSignature::new(param.name.clone(), param.dtype, ty.dims())
        }));
    }
    let outputs = computation
        .outputs
        .iter()
        .zip(&typed.outputs)
        .map(|(name, &value)| {
            let ty = typed.value_type(value);
            TensorSignature::new(name.clone(), ty.dtype, ty.dims())
        })
        .collect();
    EntryPoint {
        name: name.to_string(),
        inputs,
        outputs,
    }
}

// ================================================================================================
// Graph
// ================================================================================================

/// Parameters become trailing named graph inputs, bound by the executor at
/// stage time.
pub(crate) fn lower_graph(typed: &Typed<'_>, device: &DeviceKind) -> Result<GraphModule> {
    let computation = typed.computation;
    let num_inputs = computation.inputs.len();
    let num_params = computation.params.len();
    let value_id = |value: ValueRef| match value {
        ValueRef::Input(i) => i,
        ValueRef::Param(i) => num_inputs + i,
        ValueRef::Node(i) => num_inputs + num_params + i,
    };

    let mut inputs = Vec::with_capacity(num_inputs + num_params);
    for (signature, ty) in computation.inputs.iter().zip(&typed.inputs) {
        inputs.push(GraphInput {
            name: signature.name.clone(),
            spec: static_spec(ty, || format!("input `{}`", signature.name), "graph")?,
        });
    }
    for (param, ty) in computation.params.iter().zip(&typed.params) {
        inputs.push(GraphInput {
            name: param.name.clone(),
            spec: static_spec(ty, || format!("parameter `{}`", param.name), "graph")?,
        });
    }

    let nodes = computation
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let (kernel, attrs) = kernel_for(&node.op);
            Ok(GraphNode {
                kernel: symbol(device, kernel),
                attrs,
                args: typed.node_args[i].iter().map(|&arg| value_id(arg)).collect(),
                output: static_spec(&typed.nodes[i], || format!("`{}`", node.name), "graph")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(GraphModule {
        inputs,
        nodes,
        outputs: typed.outputs.iter().map(|&value| value_id(value)).collect(),
    })
}

// ================================================================================================
// AOT
// ================================================================================================

/// Workspace planner: a slot of the same spec is reused once its last reader
/// has run, but never by the step that reads it.
#[derive(Default)]
struct WorkspacePlan {
    specs: Vec<TensorSpec>,
    free: Vec<usize>,
}

impl WorkspacePlan {
    fn acquire(&mut self, spec: &TensorSpec) -> usize {
        if let Some(position) = self.free.iter().position(|&slot| self.specs[slot] == *spec) {
            return self.free.swap_remove(position);
        }
        self.specs.push(spec.clone());
        self.specs.len() - 1
    }

    fn release(&mut self, slot: usize) {
        self.free.push(slot);
    }
}

pub(crate) fn lower_aot(
    typed: &Typed<'_>,
    device: &DeviceKind,
    entry: &str,
    params: &BTreeMap<String, HostTensor>,
) -> Result<AotModule> {
    let computation = typed.computation;
    let inputs = computation
        .inputs
        .iter()
        .zip(&typed.inputs)
        .map(|(signature, ty)| static_spec(ty, || format!("input `{}`", signature.name), "AOT"))
        .collect::<Result<Vec<_>>>()?;
    let constants = computation
        .params
        .iter()
        .map(|param| {
            let value = params
                .get(&param.name)
                .ok_or_else(|| Error::compilation(format!("parameter `{}` has no value", param.name)))?;
            Ok(Constant {
                name: param.name.clone(),
                spec: TensorSpec::new(param.dtype, param.shape.clone()),
                data: value.as_bytes().to_vec(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let outputs = typed
        .outputs
        .iter()
        .enumerate()
        .map(|(k, &value)| static_spec(typed.value_type(value), || format!("output {k}"), "AOT"))
        .collect::<Result<Vec<_>>>()?;

    // First output position of every node that is returned directly.
    let mut output_of: HashMap<usize, usize> = HashMap::new();
    for (k, value) in typed.outputs.iter().enumerate() {
        if let ValueRef::Node(node) = value {
            output_of.entry(*node).or_insert(k);
        }
    }
    let mut last_use: HashMap<usize, usize> = HashMap::new();
    for (i, args) in typed.node_args.iter().enumerate() {
        for arg in args {
            if let ValueRef::Node(node) = arg {
                last_use.insert(*node, i);
            }
        }
    }

    let mut plan = WorkspacePlan::default();
    let mut slots: Vec<Slot> = Vec::with_capacity(computation.nodes.len());
    let mut steps = Vec::with_capacity(computation.nodes.len());
    for (i, node) in computation.nodes.iter().enumerate() {
        let spec = static_spec(&typed.nodes[i], || format!("`{}`", node.name), "AOT")?;
        let output = match output_of.get(&i) {
            Some(&k) => Slot::Output(k),
            None => Slot::Workspace(plan.acquire(&spec)),
        };
        let args = typed.node_args[i]
            .iter()
            .map(|&arg| match arg {
                ValueRef::Input(j) => Slot::Input(j),
                ValueRef::Param(j) => Slot::Constant(j),
                ValueRef::Node(j) => slots[j],
            })
            .collect();
        let (kernel, attrs) = kernel_for(&node.op);
        steps.push(AotStep {
            kernel: symbol(device, kernel),
            attrs,
            args,
            output,
        });
        slots.push(output);

        let mut dead: Vec<usize> = typed.node_args[i]
            .iter()
            .filter_map(|arg| match arg {
                ValueRef::Node(j) if last_use.get(j) == Some(&i) => Some(*j),
                _ => None,
            })
            .collect();
        if !last_use.contains_key(&i) {
            dead.push(i);
        }
        dead.sort_unstable();
        dead.dedup();
        for j in dead {
            if let Slot::Workspace(slot) = slots[j] {
                plan.release(slot);
            }
        }
    }

    // Outputs that are inputs, parameters or repeats of another output are
    // materialised with a copy.
    for (k, &value) in typed.outputs.iter().enumerate() {
        let source = match value {
            ValueRef::Input(j) => Slot::Input(j),
            ValueRef::Param(j) => Slot::Constant(j),
            ValueRef::Node(j) if output_of.get(&j) == Some(&k) => continue,
            ValueRef::Node(j) => slots[j],
        };
        steps.push(AotStep {
            kernel: symbol(device, "copy"),
            attrs: KernelAttrs::new(),
            args: vec![source],
            output: Slot::Output(k),
        });
    }

    Ok(AotModule {
        entry: entry.to_string(),
        inputs,
        outputs,
        constants,
        workspace: plan.specs,
        steps,
    })
}

// ================================================================================================
// VM
// ================================================================================================

fn shape_exprs(dims: &[Dim]) -> Vec<ShapeExpr> {
    dims.iter()
        .map(|dim| match dim {
            Dim::Static(d) => ShapeExpr::from(*d),
            Dim::Symbolic(name) => ShapeExpr::var(name.clone()),
        })
        .collect()
}

/// Lower one computation to a VM function. Parameters are looked up in the
/// module-wide constant table, which is extended on first use.
pub(crate) fn lower_vm_function(
    typed: &Typed<'_>,
    device: &DeviceKind,
    name: &str,
    constants: &mut Vec<Constant>,
    params: &BTreeMap<String, HostTensor>,
) -> Result<VmFunction> {
    let computation = typed.computation;
    let num_inputs = computation.inputs.len();
    let num_params = computation.params.len();
    let register = |value: ValueRef| match value {
        ValueRef::Input(i) => i,
        ValueRef::Param(i) => num_inputs + i,
        ValueRef::Node(i) => num_inputs + num_params + i,
    };

    let mut instructions = Vec::with_capacity(num_inputs + num_params + 2 * computation.nodes.len() + 1);
    for (i, input) in computation.inputs.iter().enumerate() {
        instructions.push(VmInstruction::MatchShape {
            reg: i,
            dtype: input.dtype,
            dims: shape_exprs(&input.shape),
        });
    }
    for (i, param) in computation.params.iter().enumerate() {
        let index = match constants.iter().position(|constant| constant.name == param.name) {
            Some(index) => {
                let spec = &constants[index].spec;
                if spec.dtype != param.dtype || spec.shape != param.shape {
                    return Err(Error::compilation(format!(
                        "parameter `{}` is declared as {}{:?} by `{name}` but as {spec} elsewhere",
                        param.name, param.dtype, param.shape
                    )));
                }
                index
            }
            None => {
                let value = params
                    .get(&param.name)
                    .ok_or_else(|| Error::compilation(format!("parameter `{}` has no value", param.name)))?;
                constants.push(Constant {
                    name: param.name.clone(),
                    spec: TensorSpec::new(param.dtype, param.shape.clone()),
                    data: value.as_bytes().to_vec(),
                });
                constants.len() - 1
            }
        };
        instructions.push(VmInstruction::LoadConst {
            dst: register(ValueRef::Param(i)),
            index,
        });
    }
    for (i, node) in computation.nodes.iter().enumerate() {
        let out = register(ValueRef::Node(i));
        let ty = &typed.nodes[i];
        instructions.push(VmInstruction::AllocTensor {
            dst: out,
            dtype: ty.dtype,
            shape: ty.shape.clone(),
        });
        let (kernel, attrs) = kernel_for(&node.op);
        instructions.push(VmInstruction::Invoke {
            kernel: symbol(device, kernel),
            attrs,
            args: typed.node_args[i].iter().map(|&arg| register(arg)).collect(),
            out,
        });
    }
    instructions.push(VmInstruction::Ret {
        regs: typed.outputs.iter().map(|&value| register(value)).collect(),
    });

    Ok(VmFunction {
        name: name.to_string(),
        num_params: num_inputs,
        num_registers: num_inputs + num_params + computation.nodes.len(),
        instructions,
    })
}

pub(crate) fn finish_vm(functions: Vec<VmFunction>, constants: Vec<Constant>) -> VmModule {
    VmModule { functions, constants }
}
