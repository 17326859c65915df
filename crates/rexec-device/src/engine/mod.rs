//! Execution engines for staged modules.
//!
//! All three engines share [`ExecContext`], which binds kernel operands to
//! device memory and owns the bookkeeping of per-call allocations.

pub mod aot;
pub mod graph;
pub mod vm;

use std::collections::{HashMap, HashSet};

use crate::error::{DeviceError, DeviceFault, Result};
use crate::kernels::{KernelAttrs, KernelFn, TensorMut, TensorRef};
use crate::memory::MemoryManager;
use crate::types::{BufferHandle, MemoryScope, TensorArg, TensorSpec};

/// Kernels resolved for one module, keyed by symbol.
pub type KernelTable = HashMap<String, KernelFn>;

pub struct ExecContext<'a> {
    memory: &'a mut MemoryManager,
    kernels: &'a KernelTable,
    /// Allocations made during this call that have not been handed back.
    owned: HashSet<BufferHandle>,
}

impl<'a> ExecContext<'a> {
    pub fn new(memory: &'a mut MemoryManager, kernels: &'a KernelTable) -> Self {
        Self {
            memory,
            kernels,
            owned: HashSet::new(),
        }
    }

    /// Check that an argument fits the allocation it names.
    pub fn validate_arg(&self, arg: &TensorArg) -> Result<()> {
        let size = self.memory.size_of(arg.handle)?;
        if size != arg.byte_len() {
            return Err(DeviceFault::IllegalMemoryAccess(format!(
                "{} holds {size} bytes but is used as {}{:?} ({} bytes)",
                arg.handle,
                arg.dtype,
                arg.shape,
                arg.byte_len()
            ))
            .into());
        }
        Ok(())
    }

    /// Allocate a call-scoped tensor in default memory.
    pub fn alloc(&mut self, spec: &TensorSpec) -> Result<TensorArg> {
        let handle = self.memory.allocate(spec.byte_len(), MemoryScope::Default)?;
        self.owned.insert(handle);
        Ok(TensorArg::new(handle, spec.dtype, spec.shape.clone()))
    }

    pub fn invoke(&mut self, symbol: &str, attrs: &KernelAttrs, args: &[&TensorArg], out: &TensorArg) -> Result<()> {
        let kernel = *self
            .kernels
            .get(symbol)
            .ok_or_else(|| DeviceFault::UnknownKernel(symbol.to_string()))?;

        if let Some(alias) = args.iter().find(|arg| arg.handle == out.handle) {
            return Err(DeviceFault::IllegalMemoryAccess(format!(
                "`{symbol}` reads and writes {} in the same call",
                alias.handle
            ))
            .into());
        }
        for arg in args.iter().copied().chain(std::iter::once(out)) {
            self.validate_arg(arg)?;
        }

        let mut out_bytes = self.memory.check_out(out.handle)?;
        let result = {
            let memory = &*self.memory;
            args.iter()
                .map(|arg| {
                    Ok(TensorRef {
                        dtype: arg.dtype,
                        shape: &arg.shape,
                        data: memory.bytes(arg.handle)?,
                    })
                })
                .collect::<Result<Vec<_>>>()
                .and_then(|inputs| {
                    let mut output = TensorMut {
                        dtype: out.dtype,
                        shape: &out.shape,
                        data: &mut out_bytes,
                    };
                    kernel(&inputs, &mut output, attrs).map_err(DeviceError::from)
                })
        };
        self.memory.check_in(out.handle, out_bytes)?;

        tracing::trace!(kernel = symbol, num_args = args.len(), ok = result.is_ok(), "kernel_invoked");
        result
    }

    /// Turn the values named by a return list into caller-owned buffers.
    ///
    /// The first return of a call-owned buffer transfers it; anything else
    /// (arguments, constants, repeated returns) is copied so the caller never
    /// aliases memory it does not own.
    pub fn take_results(&mut self, results: &[&TensorArg]) -> Result<Vec<TensorArg>> {
        let mut outputs = Vec::with_capacity(results.len());
        for &value in results {
            if self.owned.remove(&value.handle) {
                outputs.push(value.clone());
            } else {
                let copy = TensorArg::new(
                    self.memory.allocate(value.byte_len(), MemoryScope::Default)?,
                    value.dtype,
                    value.shape.clone(),
                );
                let bytes = self.memory.read(value.handle)?;
                self.memory.write(copy.handle, &bytes)?;
                outputs.push(copy);
            }
        }
        Ok(outputs)
    }

    /// Free everything still owned by the call.
    pub fn release(mut self) {
        for handle in self.owned.drain() {
            let _ = self.memory.free(handle);
        }
    }

    /// Free results after a failure further down the call.
    pub fn discard(&mut self, results: Vec<TensorArg>) {
        for result in results {
            let _ = self.memory.free(result.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::KernelRegistry;
    use crate::types::{DType, DeviceKind};

    fn kernels() -> KernelTable {
        let registry = KernelRegistry::for_device(&DeviceKind::HostCpu);
        ["cpu.add", "cpu.relu"]
            .into_iter()
            .map(|symbol| (symbol.to_string(), registry.resolve(symbol).unwrap()))
            .collect()
    }

    #[test]
    fn test_invoke_rejects_aliasing() {
        let mut memory = MemoryManager::new(1024, 0);
        let kernels = kernels();
        let mut ctx = ExecContext::new(&mut memory, &kernels);
        let x = ctx.alloc(&TensorSpec::new(DType::F32, vec![4])).unwrap();
        let err = ctx.invoke("cpu.relu", &KernelAttrs::new(), &[&x], &x).unwrap_err();
        assert!(matches!(err, DeviceError::Fault(DeviceFault::IllegalMemoryAccess(_))));
        // The output allocation survives a rejected call.
        assert!(ctx.validate_arg(&x).is_ok());
    }

    #[test]
    fn test_invoke_rejects_oversized_view() {
        let mut memory = MemoryManager::new(1024, 0);
        let kernels = kernels();
        let mut ctx = ExecContext::new(&mut memory, &kernels);
        let x = ctx.alloc(&TensorSpec::new(DType::F32, vec![4])).unwrap();
        let out = ctx.alloc(&TensorSpec::new(DType::F32, vec![8])).unwrap();
        let lying = TensorArg::new(x.handle, DType::F32, vec![8]);
        let err = ctx.invoke("cpu.relu", &KernelAttrs::new(), &[&lying], &out).unwrap_err();
        assert!(matches!(err, DeviceError::Fault(DeviceFault::IllegalMemoryAccess(_))));
    }

    #[test]
    fn test_unknown_kernel_and_release() {
        let mut memory = MemoryManager::new(1024, 0);
        let kernels = kernels();
        {
            let mut ctx = ExecContext::new(&mut memory, &kernels);
            let x = ctx.alloc(&TensorSpec::new(DType::F32, vec![4])).unwrap();
            let err = ctx.invoke("cpu.gelu", &KernelAttrs::new(), &[&x], &x).unwrap_err();
            assert!(matches!(err, DeviceError::Fault(DeviceFault::UnknownKernel(_))));
            ctx.release();
        }
        assert_eq!(memory.live_allocations(), 0);
    }

    #[test]
    fn test_take_results_transfers_then_copies() {
        let mut memory = MemoryManager::new(1024, 0);
        let kernels = kernels();
        let mut ctx = ExecContext::new(&mut memory, &kernels);
        let x = ctx.alloc(&TensorSpec::new(DType::F32, vec![2])).unwrap();
        let results = ctx.take_results(&[&x, &x]).unwrap();
        assert_eq!(results[0].handle, x.handle);
        assert_ne!(results[1].handle, x.handle);
        ctx.release();
        assert_eq!(memory.live_allocations(), 2);
    }
}
