//! Graph interpreter.
//!
//! Walks the node list in order. Intermediate values are allocated fresh for
//! every call and freed on return; graph outputs are handed to the caller.

use super::ExecContext;
use crate::error::{DeviceError, DeviceFault, Result};
use crate::module::GraphModule;
use crate::types::TensorArg;

/// Name of the single entry point a graph module exposes.
pub const GRAPH_ENTRY: &str = "main";

pub fn run(ctx: &mut ExecContext<'_>, module: &GraphModule, entry: &str, args: &[TensorArg]) -> Result<Vec<TensorArg>> {
    if entry != GRAPH_ENTRY {
        return Err(DeviceError::UnknownEntryPoint(entry.to_string()));
    }
    if args.len() != module.inputs.len() {
        return Err(DeviceFault::ArgumentCount {
            function: GRAPH_ENTRY.to_string(),
            expected: module.inputs.len(),
            actual: args.len(),
        }
        .into());
    }
    for (input, arg) in module.inputs.iter().zip(args) {
        if !input.spec.matches(arg) {
            return Err(DeviceError::shape(format!(
                "input `{}` expects {}, got {}{:?}",
                input.name, input.spec, arg.dtype, arg.shape
            )));
        }
        ctx.validate_arg(arg)?;
    }

    let mut values: Vec<TensorArg> = args.to_vec();
    values.reserve(module.nodes.len());
    for (index, node) in module.nodes.iter().enumerate() {
        let out = ctx.alloc(&node.output)?;
        let operands = node
            .args
            .iter()
            .map(|&id| {
                values
                    .get(id)
                    .ok_or_else(|| DeviceError::shape(format!("node {index} reads undefined value %{id}")))
            })
            .collect::<Result<Vec<_>>>()?;
        ctx.invoke(&node.kernel, &node.attrs, &operands, &out)?;
        values.push(out);
    }

    let results = module
        .outputs
        .iter()
        .map(|&id| {
            values
                .get(id)
                .ok_or_else(|| DeviceError::shape(format!("graph output names undefined value %{id}")))
        })
        .collect::<Result<Vec<_>>>()?;
    ctx.take_results(&results)
}
