//! Register virtual machine.
//!
//! Each call gets a fresh register file and a fresh shape environment. The
//! environment is rebuilt by `MatchShape` from the actual argument shapes on
//! every invocation, so one function serves any size its variables admit.

use std::collections::HashMap;

use super::ExecContext;
use crate::error::{DeviceError, DeviceFault, Result};
use crate::module::{Reg, ShapeExpr, VmFunction, VmInstruction, VmModule};
use crate::types::{DType, TensorArg, TensorSpec};

struct Frame {
    registers: Vec<Option<TensorArg>>,
    env: HashMap<String, i64>,
}

impl Frame {
    fn new(function: &VmFunction, args: &[TensorArg]) -> Self {
        let mut registers = vec![None; function.num_registers.max(args.len())];
        for (slot, arg) in registers.iter_mut().zip(args) {
            *slot = Some(arg.clone());
        }
        Self {
            registers,
            env: HashMap::new(),
        }
    }

    fn get(&self, reg: Reg) -> Result<&TensorArg> {
        self.registers
            .get(reg)
            .and_then(Option::as_ref)
            .ok_or_else(|| DeviceFault::UninitializedRegister(reg).into())
    }

    fn set(&mut self, reg: Reg, value: TensorArg) -> Result<()> {
        let slot = self
            .registers
            .get_mut(reg)
            .ok_or_else(|| DeviceError::from(DeviceFault::UninitializedRegister(reg)))?;
        *slot = Some(value);
        Ok(())
    }

    fn match_shape(&mut self, reg: Reg, dtype: DType, dims: &[ShapeExpr]) -> Result<()> {
        let value = self.get(reg)?.clone();
        if value.dtype != dtype {
            return Err(DeviceError::shape(format!("r{reg} has dtype {}, expected {dtype}", value.dtype)));
        }
        if value.shape.len() != dims.len() {
            return Err(DeviceError::shape(format!(
                "r{reg} has rank {}, expected {}",
                value.shape.len(),
                dims.len()
            )));
        }
        for (axis, (expr, &actual)) in dims.iter().zip(&value.shape).enumerate() {
            let actual = i64::try_from(actual)
                .map_err(|_| DeviceError::shape(format!("r{reg} axis {axis} extent {actual} is out of range")))?;
            if let ShapeExpr::Var(name) = expr {
                if !self.env.contains_key(name) {
                    self.env.insert(name.clone(), actual);
                    continue;
                }
            }
            let expected = expr.eval(&self.env)?;
            if expected != actual {
                return Err(DeviceError::shape(format!(
                    "r{reg} axis {axis} is {actual}, but {expr} = {expected}"
                )));
            }
        }
        Ok(())
    }

    fn eval_shape(&self, shape: &[ShapeExpr]) -> Result<Vec<usize>> {
        shape
            .iter()
            .map(|expr| -> Result<usize> {
                let value = expr.eval(&self.env)?;
                usize::try_from(value)
                    .map_err(|_| DeviceFault::ShapeExpr(format!("{expr} evaluated to negative extent {value}")).into())
            })
            .collect()
    }
}

pub fn run(ctx: &mut ExecContext<'_>, module: &VmModule, constants: &[TensorArg], entry: &str, args: &[TensorArg]) -> Result<Vec<TensorArg>> {
    let function = module
        .function(entry)
        .ok_or_else(|| DeviceError::UnknownEntryPoint(entry.to_string()))?;
    if args.len() != function.num_params {
        return Err(DeviceFault::ArgumentCount {
            function: function.name.clone(),
            expected: function.num_params,
            actual: args.len(),
        }
        .into());
    }
    for arg in args {
        ctx.validate_arg(arg)?;
    }

    let mut frame = Frame::new(function, args);
    for instruction in &function.instructions {
        match instruction {
            VmInstruction::MatchShape { reg, dtype, dims } => frame.match_shape(*reg, *dtype, dims)?,
            VmInstruction::LoadConst { dst, index } => {
                let constant = constants
                    .get(*index)
                    .ok_or_else(|| DeviceError::shape(format!("constant #{index} does not exist")))?;
                frame.set(*dst, constant.clone())?;
            }
            VmInstruction::AllocTensor { dst, dtype, shape } => {
                let shape = frame.eval_shape(shape)?;
                let tensor = ctx.alloc(&TensorSpec::new(*dtype, shape))?;
                frame.set(*dst, tensor)?;
            }
            VmInstruction::Invoke {
                kernel,
                attrs,
                args,
                out,
            } => {
                let operands = args.iter().map(|&reg| frame.get(reg)).collect::<Result<Vec<_>>>()?;
                ctx.invoke(kernel, attrs, &operands, frame.get(*out)?)?;
            }
            VmInstruction::Move { dst, src } => {
                let value = frame.get(*src)?.clone();
                frame.set(*dst, value)?;
            }
            VmInstruction::Ret { regs } => {
                let results = regs.iter().map(|&reg| frame.get(reg)).collect::<Result<Vec<_>>>()?;
                return ctx.take_results(&results);
            }
        }
    }

    Err(DeviceError::shape(format!("function `{}` fell off its end without returning", function.name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::KernelTable;
    use crate::kernels::{decode, KernelAttrs, KernelRegistry};
    use crate::memory::MemoryManager;
    use crate::module::Constant;
    use crate::types::{DeviceKind, MemoryScope};

    /// `main(x: f32[m, n]) -> x @ x`
    fn dyn_matmul() -> VmModule {
        VmModule {
            functions: vec![VmFunction {
                name: "main".into(),
                num_params: 1,
                num_registers: 2,
                instructions: vec![
                    VmInstruction::MatchShape {
                        reg: 0,
                        dtype: DType::F32,
                        dims: vec![ShapeExpr::var("m"), ShapeExpr::var("n")],
                    },
                    VmInstruction::AllocTensor {
                        dst: 1,
                        dtype: DType::F32,
                        shape: vec![ShapeExpr::var("m"), ShapeExpr::var("n")],
                    },
                    VmInstruction::Invoke {
                        kernel: "accel.matmul".into(),
                        attrs: KernelAttrs::new(),
                        args: vec![0, 0],
                        out: 1,
                    },
                    VmInstruction::Ret { regs: vec![1] },
                ],
            }],
            constants: vec![],
        }
    }

    fn kernels() -> KernelTable {
        let registry = KernelRegistry::for_device(&DeviceKind::accelerator("v68"));
        ["accel.matmul", "accel.add"]
            .into_iter()
            .map(|symbol| (symbol.to_string(), registry.resolve(symbol).unwrap()))
            .collect()
    }

    fn square(memory: &mut MemoryManager, n: usize) -> TensorArg {
        let values: Vec<f32> = (0..n * n).map(|i| if i % (n + 1) == 0 { 2.0 } else { 0.0 }).collect();
        let handle = memory.allocate(n * n * 4, MemoryScope::Default).unwrap();
        memory.write(handle, bytemuck::cast_slice(&values)).unwrap();
        TensorArg::new(handle, DType::F32, vec![n, n])
    }

    #[test]
    fn test_dynamic_shapes_rebind_per_call() {
        let kernels = kernels();
        let module = dyn_matmul();
        let mut memory = MemoryManager::new(1 << 20, 0);

        for n in [16, 8] {
            let x = square(&mut memory, n);
            let mut ctx = ExecContext::new(&mut memory, &kernels);
            let out = run(&mut ctx, &module, &[], "main", &[x]).unwrap();
            ctx.release();

            assert_eq!(out[0].shape, vec![n, n]);
            let values: Vec<f32> = decode(&memory.read(out[0].handle).unwrap());
            assert_eq!(values[0], 4.0);
            assert_eq!(values[1], 0.0);
        }
    }

    #[test]
    fn test_non_square_input_faults_in_kernel() {
        let kernels = kernels();
        let module = dyn_matmul();
        let mut memory = MemoryManager::new(1 << 20, 0);
        let handle = memory.allocate(4 * 3 * 4, MemoryScope::Default).unwrap();
        let x = TensorArg::new(handle, DType::F32, vec![4, 3]);

        let mut ctx = ExecContext::new(&mut memory, &kernels);
        let err = run(&mut ctx, &module, &[], "main", &[x]).unwrap_err();
        ctx.release();
        assert!(matches!(err, DeviceError::Fault(DeviceFault::Shape(_))));
        // The allocation made before the fault was released.
        assert_eq!(memory.live_allocations(), 1);
    }

    #[test]
    fn test_match_shape_checks_bound_variables() {
        let module = VmModule {
            functions: vec![VmFunction {
                name: "add".into(),
                num_params: 2,
                num_registers: 3,
                instructions: vec![
                    VmInstruction::MatchShape {
                        reg: 0,
                        dtype: DType::F32,
                        dims: vec![ShapeExpr::var("n")],
                    },
                    VmInstruction::MatchShape {
                        reg: 1,
                        dtype: DType::F32,
                        dims: vec![ShapeExpr::var("n")],
                    },
                    VmInstruction::Ret { regs: vec![0] },
                ],
            }],
            constants: vec![],
        };
        let kernels = kernels();
        let mut memory = MemoryManager::new(1024, 0);
        let a = TensorArg::new(memory.allocate(12, MemoryScope::Default).unwrap(), DType::F32, vec![3]);
        let b = TensorArg::new(memory.allocate(16, MemoryScope::Default).unwrap(), DType::F32, vec![4]);

        let mut ctx = ExecContext::new(&mut memory, &kernels);
        let err = run(&mut ctx, &module, &[], "add", &[a.clone(), b]).unwrap_err();
        assert!(matches!(err, DeviceError::Fault(DeviceFault::Shape(_))));

        let ok = run(&mut ctx, &module, &[], "add", &[a.clone(), a.clone()]).unwrap();
        // Returning an argument hands back a copy.
        assert_ne!(ok[0].handle, a.handle);

        let err = run(&mut ctx, &module, &[], "missing", &[]).unwrap_err();
        assert!(matches!(err, DeviceError::UnknownEntryPoint(_)));
    }

    #[test]
    fn test_constants_and_moves() {
        let module = VmModule {
            functions: vec![VmFunction {
                name: "main".into(),
                num_params: 1,
                num_registers: 4,
                instructions: vec![
                    VmInstruction::LoadConst { dst: 1, index: 0 },
                    VmInstruction::AllocTensor {
                        dst: 2,
                        dtype: DType::F32,
                        shape: vec![ShapeExpr::Const(2)],
                    },
                    VmInstruction::Invoke {
                        kernel: "accel.add".into(),
                        attrs: KernelAttrs::new(),
                        args: vec![0, 1],
                        out: 2,
                    },
                    VmInstruction::Move { dst: 3, src: 2 },
                    VmInstruction::Ret { regs: vec![3, 2] },
                ],
            }],
            constants: vec![Constant {
                name: "bias".into(),
                spec: TensorSpec::new(DType::F32, vec![2]),
                data: bytemuck::cast_slice(&[0.5f32, 1.5]).to_vec(),
            }],
        };
        let kernels = kernels();
        let mut memory = MemoryManager::new(1024, 0);
        let bias = TensorArg::new(memory.allocate(8, MemoryScope::Default).unwrap(), DType::F32, vec![2]);
        memory.write(bias.handle, &module.constants[0].data).unwrap();
        let x = TensorArg::new(memory.allocate(8, MemoryScope::Default).unwrap(), DType::F32, vec![2]);
        memory.write(x.handle, bytemuck::cast_slice(&[1.0f32, 2.0])).unwrap();

        let mut ctx = ExecContext::new(&mut memory, &kernels);
        let out = run(&mut ctx, &module, &[bias], "main", &[x]).unwrap();
        ctx.release();

        assert_ne!(out[0].handle, out[1].handle);
        for result in &out {
            let values: Vec<f32> = decode(&memory.read(result.handle).unwrap());
            assert_eq!(values, vec![1.5, 3.5]);
        }
    }
}
