//! Ahead-of-time runner.
//!
//! The caller passes inputs followed by preallocated outputs. Steps write
//! straight into output slots; workspace slots are allocated per call.

use super::ExecContext;
use crate::error::{DeviceError, DeviceFault, Result};
use crate::module::{AotModule, Slot};
use crate::types::TensorArg;

pub fn run(ctx: &mut ExecContext<'_>, module: &AotModule, constants: &[TensorArg], entry: &str, args: &[TensorArg]) -> Result<()> {
    if entry != module.entry {
        return Err(DeviceError::UnknownEntryPoint(entry.to_string()));
    }
    let expected = module.inputs.len() + module.outputs.len();
    if args.len() != expected {
        return Err(DeviceFault::ArgumentCount {
            function: module.entry.clone(),
            expected,
            actual: args.len(),
        }
        .into());
    }
    let (inputs, outputs) = args.split_at(module.inputs.len());
    for (position, (spec, arg)) in module.inputs.iter().chain(&module.outputs).zip(args).enumerate() {
        if !spec.matches(arg) {
            return Err(DeviceError::shape(format!(
                "packed argument {position} expects {spec}, got {}{:?}",
                arg.dtype, arg.shape
            )));
        }
        ctx.validate_arg(arg)?;
    }
    if let Some(out) = outputs.iter().find(|out| inputs.iter().any(|arg| arg.handle == out.handle)) {
        return Err(DeviceFault::IllegalMemoryAccess(format!("output {} is also passed as an input", out.handle)).into());
    }

    let workspace = module
        .workspace
        .iter()
        .map(|spec| ctx.alloc(spec))
        .collect::<Result<Vec<_>>>()?;

    let frame = Frame {
        inputs,
        outputs,
        constants,
        workspace: &workspace,
    };
    for step in &module.steps {
        let operands = step.args.iter().map(|&slot| frame.resolve(slot)).collect::<Result<Vec<_>>>()?;
        let out = frame.resolve(step.output)?;
        ctx.invoke(&step.kernel, &step.attrs, &operands, out)?;
    }
    Ok(())
}

struct Frame<'a> {
    inputs: &'a [TensorArg],
    outputs: &'a [TensorArg],
    constants: &'a [TensorArg],
    workspace: &'a [TensorArg],
}

impl<'a> Frame<'a> {
    fn resolve(&self, slot: Slot) -> Result<&'a TensorArg> {
        let found = match slot {
            Slot::Input(i) => self.inputs.get(i),
            Slot::Output(i) => self.outputs.get(i),
            Slot::Constant(i) => self.constants.get(i),
            Slot::Workspace(i) => self.workspace.get(i),
        };
        found.ok_or_else(|| DeviceError::shape(format!("step refers to missing slot {slot:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::KernelTable;
    use crate::kernels::{decode, KernelAttrs, KernelRegistry};
    use crate::memory::MemoryManager;
    use crate::module::AotStep;
    use crate::types::{DType, DeviceKind, MemoryScope, TensorSpec};

    fn module() -> AotModule {
        let spec = TensorSpec::new(DType::I32, vec![2]);
        AotModule {
            entry: "main".into(),
            inputs: vec![spec.clone()],
            outputs: vec![spec.clone()],
            constants: vec![],
            workspace: vec![spec],
            steps: vec![
                AotStep {
                    kernel: "accel.add".into(),
                    attrs: KernelAttrs::new(),
                    args: vec![Slot::Input(0), Slot::Constant(0)],
                    output: Slot::Workspace(0),
                },
                AotStep {
                    kernel: "accel.multiply".into(),
                    attrs: KernelAttrs::new(),
                    args: vec![Slot::Workspace(0), Slot::Input(0)],
                    output: Slot::Output(0),
                },
            ],
        }
    }

    fn tensor(memory: &mut MemoryManager, values: &[i32]) -> TensorArg {
        let handle = memory.allocate(values.len() * 4, MemoryScope::Default).unwrap();
        memory.write(handle, bytemuck::cast_slice(values)).unwrap();
        TensorArg::new(handle, DType::I32, vec![values.len()])
    }

    #[test]
    fn test_aot_packed_call() {
        let registry = KernelRegistry::for_device(&DeviceKind::accelerator("v68"));
        let kernels: KernelTable = ["accel.add", "accel.multiply"]
            .into_iter()
            .map(|symbol| (symbol.to_string(), registry.resolve(symbol).unwrap()))
            .collect();
        let mut memory = MemoryManager::new(4096, 0);
        let constant = tensor(&mut memory, &[10, 20]);
        let input = tensor(&mut memory, &[1, 2]);
        let output = tensor(&mut memory, &[0, 0]);

        let mut ctx = ExecContext::new(&mut memory, &kernels);
        run(&mut ctx, &module(), &[constant.clone()], "main", &[input.clone(), output.clone()]).unwrap();
        ctx.release();

        // (x + c) * x
        let values: Vec<i32> = decode(&memory.read(output.handle).unwrap());
        assert_eq!(values, vec![11, 44]);
        assert_eq!(memory.live_allocations(), 3);

        let mut ctx = ExecContext::new(&mut memory, &kernels);
        let err = run(&mut ctx, &module(), &[constant], "main", &[input]).unwrap_err();
        assert!(matches!(err, DeviceError::Fault(DeviceFault::ArgumentCount { expected: 2, actual: 1, .. })));
    }
}
