//! The simulated device.
//!
//! A [`Device`] owns the memory pools, the kernel library for its
//! [`DeviceKind`] and the modules staged on it. It is single-threaded: a
//! server gives every connection its own device, and a loopback transport
//! keeps one behind a lock.

use std::collections::HashMap;

use crate::engine::{aot, graph, vm, ExecContext, KernelTable};
use crate::error::{DeviceError, Result};
use crate::kernels::KernelRegistry;
use crate::memory::MemoryManager;
use crate::module::{Constant, ModuleBody, ModuleImage, IMAGE_FORMAT_VERSION};
use crate::protocol::{Request, Response, PROTOCOL_VERSION};
use crate::types::{BufferHandle, DeviceInfo, DeviceKind, MemoryScope, ModuleId, TensorArg};

const MIB: usize = 1 << 20;

/// Capacity and identity of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    pub default_capacity: usize,
    pub scratch_capacity: usize,
}

impl DeviceConfig {
    /// Accelerator with 256 MiB of global memory and 4 MiB of on-chip scratch.
    pub fn accelerator(arch: impl Into<String>) -> Self {
        Self {
            kind: DeviceKind::accelerator(arch),
            default_capacity: 256 * MIB,
            scratch_capacity: 4 * MIB,
        }
    }

    /// Host CPU device. It has no scratch memory.
    pub fn host_cpu() -> Self {
        Self {
            kind: DeviceKind::HostCpu,
            default_capacity: 1024 * MIB,
            scratch_capacity: 0,
        }
    }

    pub fn with_default_capacity(mut self, bytes: usize) -> Self {
        self.default_capacity = bytes;
        self
    }

    pub fn with_scratch_capacity(mut self, bytes: usize) -> Self {
        self.scratch_capacity = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_capacity == 0 {
            return Err(DeviceError::Config("default memory capacity must be non-zero".into()));
        }
        if self.scratch_capacity >= self.default_capacity {
            return Err(DeviceError::Config(format!(
                "scratch capacity ({} bytes) must be smaller than default capacity ({} bytes)",
                self.scratch_capacity, self.default_capacity
            )));
        }
        if let DeviceKind::Accelerator { arch } = &self.kind {
            if arch.is_empty() {
                return Err(DeviceError::Config("accelerator architecture must not be empty".into()));
            }
        }
        Ok(())
    }
}

struct LoadedModule {
    image: ModuleImage,
    /// Holds the image bytes so staged code counts against device memory.
    code: BufferHandle,
    constants: Vec<TensorArg>,
    kernels: KernelTable,
}

pub struct Device {
    config: DeviceConfig,
    memory: MemoryManager,
    registry: KernelRegistry,
    modules: HashMap<ModuleId, LoadedModule>,
    next_module_id: u64,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        let memory = MemoryManager::new(config.default_capacity, config.scratch_capacity);
        let registry = KernelRegistry::for_device(&config.kind);
        tracing::debug!(kind = %config.kind, default = config.default_capacity, scratch = config.scratch_capacity, "device_created");
        Ok(Self {
            config,
            memory,
            registry,
            modules: HashMap::new(),
            next_module_id: 1,
        })
    }

    pub fn kind(&self) -> &DeviceKind {
        &self.config.kind
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            kind: self.config.kind.clone(),
            protocol_version: PROTOCOL_VERSION,
            default_capacity: self.config.default_capacity,
            scratch_capacity: self.config.scratch_capacity,
        }
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn staged_modules(&self) -> usize {
        self.modules.len()
    }

    pub fn allocate(&mut self, bytes: usize, scope: MemoryScope) -> Result<BufferHandle> {
        self.memory.allocate(bytes, scope)
    }

    pub fn free(&mut self, handle: BufferHandle) -> Result<()> {
        self.memory.free(handle)
    }

    pub fn write(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        self.memory.write(handle, data)
    }

    pub fn read(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        self.memory.read(handle)
    }

    /// Load a module image, resolving its kernels and uploading constants.
    ///
    /// Every failure, including running out of memory for the code or the
    /// constants, is reported as [`DeviceError::Staging`] and leaves no
    /// allocation behind.
    pub fn stage(&mut self, payload: &[u8]) -> Result<ModuleId> {
        let image = ModuleImage::from_bytes(payload)
            .map_err(|err| DeviceError::staging(format!("malformed module image ({} bytes): {err}", payload.len())))?;
        if image.format_version != IMAGE_FORMAT_VERSION {
            return Err(DeviceError::staging(format!(
                "image format v{} is not supported (device reads v{IMAGE_FORMAT_VERSION})",
                image.format_version
            )));
        }
        if image.target != self.config.kind {
            return Err(DeviceError::staging(format!(
                "module targets {} but this device is {}",
                image.target, self.config.kind
            )));
        }

        let mut kernels = KernelTable::new();
        for symbol in image.kernel_symbols() {
            let kernel = self
                .registry
                .resolve(symbol)
                .ok_or_else(|| DeviceError::staging(format!("unresolved kernel symbol `{symbol}` on {}", self.config.kind)))?;
            kernels.insert(symbol.to_string(), kernel);
        }

        let code = self
            .memory
            .allocate(payload.len(), MemoryScope::Default)
            .map_err(|err| DeviceError::staging(format!("cannot place module code: {err}")))?;
        if let Err(err) = self.memory.write(code, payload) {
            let _ = self.memory.free(code);
            return Err(err);
        }
        let constants = match self.upload_constants(image.constants()) {
            Ok(constants) => constants,
            Err(err) => {
                let _ = self.memory.free(code);
                return Err(err);
            }
        };

        let id = ModuleId(self.next_module_id);
        self.next_module_id += 1;
        tracing::info!(
            module = %id,
            target = %image.target,
            bytes = payload.len(),
            kernels = kernels.len(),
            constants = constants.len(),
            "module_staged"
        );
        self.modules.insert(
            id,
            LoadedModule {
                image,
                code,
                constants,
                kernels,
            },
        );
        Ok(id)
    }

    fn upload_constants(&mut self, constants: &[Constant]) -> Result<Vec<TensorArg>> {
        let mut uploaded: Vec<TensorArg> = Vec::with_capacity(constants.len());
        for constant in constants {
            match self.upload_constant(constant) {
                Ok(arg) => uploaded.push(arg),
                Err(err) => {
                    for arg in uploaded {
                        let _ = self.memory.free(arg.handle);
                    }
                    return Err(err);
                }
            }
        }
        Ok(uploaded)
    }

    fn upload_constant(&mut self, constant: &Constant) -> Result<TensorArg> {
        let handle = self
            .memory
            .allocate(constant.spec.byte_len(), MemoryScope::Default)
            .map_err(|err| DeviceError::staging(format!("cannot place constant `{}`: {err}", constant.name)))?;
        if let Err(err) = self.memory.write(handle, &constant.data) {
            let _ = self.memory.free(handle);
            return Err(DeviceError::staging(format!("constant `{}`: {err}", constant.name)));
        }
        Ok(TensorArg::new(handle, constant.spec.dtype, constant.spec.shape.clone()))
    }

    pub fn unload(&mut self, module: ModuleId) -> Result<()> {
        let loaded = self.modules.remove(&module).ok_or(DeviceError::InvalidModule(module))?;
        // Free everything, then report the first failure.
        let mut first_err = None;
        for handle in loaded.constants.iter().map(|constant| constant.handle).chain([loaded.code]) {
            if let Err(err) = self.memory.free(handle) {
                first_err.get_or_insert(err);
            }
        }
        tracing::debug!(module = %module, clean = first_err.is_none(), "module_unloaded");
        first_err.map_or(Ok(()), Err)
    }

    /// Call `entry` in a staged module.
    ///
    /// Graph and VM modules return freshly allocated outputs owned by the
    /// caller. AOT modules write into the trailing output arguments and
    /// return nothing.
    pub fn run(&mut self, module: ModuleId, entry: &str, args: &[TensorArg]) -> Result<Vec<TensorArg>> {
        let loaded = self.modules.get(&module).ok_or(DeviceError::InvalidModule(module))?;
        let _span = rexec_tracing::perf_span!("device_run", module = module.0, args = args.len());
        let mut ctx = ExecContext::new(&mut self.memory, &loaded.kernels);
        let result = match &loaded.image.body {
            ModuleBody::Graph(body) => graph::run(&mut ctx, body, entry, args),
            ModuleBody::Aot(body) => aot::run(&mut ctx, body, &loaded.constants, entry, args).map(|()| Vec::new()),
            ModuleBody::Vm(body) => vm::run(&mut ctx, body, &loaded.constants, entry, args),
        };
        ctx.release();

        match &result {
            Ok(outputs) => tracing::debug!(module = %module, entry, outputs = outputs.len(), "module_run"),
            Err(err) => tracing::warn!(module = %module, entry, error = %err, "module_run_failed"),
        }
        result
    }

    /// Drop every module and allocation.
    pub fn reset(&mut self) {
        self.modules.clear();
        self.memory.clear();
    }

    /// Serve one protocol request.
    pub fn handle(&mut self, request: Request) -> Response {
        let kind = request.kind();
        let response = match request {
            Request::Hello { version } if version != PROTOCOL_VERSION => Response::Error(DeviceError::Protocol(format!(
                "client speaks v{version}, device speaks v{PROTOCOL_VERSION}"
            ))),
            Request::Hello { .. } => Response::Hello(self.info()),
            Request::Allocate { bytes, scope } => self.allocate(bytes, scope).map_or_else(Response::Error, Response::Allocated),
            Request::Free { handle } => self.free(handle).map_or_else(Response::Error, |()| Response::Ack),
            Request::Write { handle, data } => self.write(handle, &data).map_or_else(Response::Error, |()| Response::Ack),
            Request::Read { handle } => self.read(handle).map_or_else(Response::Error, Response::Data),
            Request::Stage { payload } => self.stage(&payload).map_or_else(Response::Error, Response::Staged),
            Request::Unload { module } => self.unload(module).map_or_else(Response::Error, |()| Response::Ack),
            Request::Run { module, entry, args } => {
                self.run(module, &entry, &args).map_or_else(Response::Error, Response::Outputs)
            }
            Request::Goodbye => {
                self.reset();
                Response::Ack
            }
        };
        if let Response::Error(err) = &response {
            tracing::debug!(request = kind, error = %err, "request_failed");
        } else {
            tracing::trace!(request = kind, "request_served");
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceFault;
    use crate::kernels::{decode, KernelAttrs};
    use crate::module::{GraphInput, GraphModule, GraphNode};
    use crate::types::{DType, TensorSpec};

    fn relu_graph(target: DeviceKind, kernel: &str) -> Vec<u8> {
        let spec = TensorSpec::new(DType::F32, vec![4]);
        ModuleImage::new(
            target,
            ModuleBody::Graph(GraphModule {
                inputs: vec![GraphInput {
                    name: "x".into(),
                    spec: spec.clone(),
                }],
                nodes: vec![GraphNode {
                    kernel: kernel.into(),
                    attrs: KernelAttrs::new(),
                    args: vec![0],
                    output: spec,
                }],
                outputs: vec![1],
            }),
        )
        .to_bytes()
        .unwrap()
    }

    fn device() -> Device {
        Device::new(DeviceConfig::accelerator("v68").with_default_capacity(MIB).with_scratch_capacity(1024)).unwrap()
    }

    fn constants_module(count: usize) -> Vec<u8> {
        let constants = (0..count)
            .map(|i| Constant {
                name: format!("c{i}"),
                spec: TensorSpec::new(DType::I32, vec![2]),
                data: bytemuck::cast_slice::<i32, u8>(&[i as i32, 1]).to_vec(),
            })
            .collect();
        let main = crate::module::VmFunction {
            name: "main".into(),
            num_params: 0,
            num_registers: 1,
            instructions: vec![
                crate::module::VmInstruction::LoadConst { dst: 0, index: 0 },
                crate::module::VmInstruction::Ret { regs: vec![0] },
            ],
        };
        ModuleImage::new(
            DeviceKind::accelerator("v68"),
            ModuleBody::Vm(crate::module::VmModule {
                functions: vec![main],
                constants,
            }),
        )
        .to_bytes()
        .unwrap()
    }

    #[test]
    fn test_unload_frees_everything_even_after_a_failure() {
        let mut device = device();
        let module = device.stage(&constants_module(3)).unwrap();
        assert_eq!(device.memory().live_allocations(), 4);

        // A client freed one of the module's constants behind its back.
        let stolen = device.modules[&module].constants[0].handle;
        device.free(stolen).unwrap();

        let err = device.unload(module).unwrap_err();
        assert_eq!(err, DeviceError::InvalidBuffer(stolen));
        assert_eq!(device.memory().live_allocations(), 0);
        assert_eq!(device.staged_modules(), 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(DeviceConfig::accelerator("v68").validate().is_ok());
        assert!(DeviceConfig::host_cpu().validate().is_ok());
        assert!(DeviceConfig::accelerator("").validate().is_err());
        assert!(DeviceConfig::accelerator("v68").with_scratch_capacity(512 * MIB).validate().is_err());
    }

    #[test]
    fn test_stage_run_unload() {
        let mut device = device();
        let module = device.stage(&relu_graph(DeviceKind::accelerator("v68"), "accel.relu")).unwrap();
        let x = device.allocate(16, MemoryScope::Default).unwrap();
        device.write(x, bytemuck::cast_slice(&[-1.0f32, 2.0, -3.0, 4.0])).unwrap();

        let outputs = device.run(module, "main", &[TensorArg::new(x, DType::F32, vec![4])]).unwrap();
        let values: Vec<f32> = decode(&device.read(outputs[0].handle).unwrap());
        assert_eq!(values, vec![0.0, 2.0, 0.0, 4.0]);

        device.unload(module).unwrap();
        assert!(matches!(device.run(module, "main", &[]), Err(DeviceError::InvalidModule(_))));
        // x and the output are left; the code buffer is gone.
        assert_eq!(device.memory().live_allocations(), 2);
    }

    #[test]
    fn test_staging_failures_leave_no_residue() {
        let mut device = device();

        let err = device.stage(&[]).unwrap_err();
        assert!(matches!(err, DeviceError::Staging(_)));

        let err = device.stage(&relu_graph(DeviceKind::HostCpu, "cpu.relu")).unwrap_err();
        assert!(matches!(err, DeviceError::Staging(ref msg) if msg.contains("targets cpu")));

        let err = device.stage(&relu_graph(DeviceKind::accelerator("v68"), "accel.gelu")).unwrap_err();
        assert!(matches!(err, DeviceError::Staging(ref msg) if msg.contains("accel.gelu")));

        let err = device.stage(&relu_graph(DeviceKind::accelerator("v73"), "accel.relu")).unwrap_err();
        assert!(matches!(err, DeviceError::Staging(_)));

        assert_eq!(device.memory().live_allocations(), 0);
        assert_eq!(device.staged_modules(), 0);
    }

    #[test]
    fn test_staging_out_of_memory_is_a_staging_error() {
        let mut device =
            Device::new(DeviceConfig::accelerator("v68").with_default_capacity(64).with_scratch_capacity(0)).unwrap();
        let err = device.stage(&relu_graph(DeviceKind::accelerator("v68"), "accel.relu")).unwrap_err();
        assert!(matches!(err, DeviceError::Staging(ref msg) if msg.contains("cannot place module code")));
    }

    #[test]
    fn test_handle_requests() {
        let mut device = device();
        assert!(matches!(
            device.handle(Request::Hello { version: PROTOCOL_VERSION }),
            Response::Hello(DeviceInfo { scratch_capacity: 1024, .. })
        ));
        assert!(matches!(device.handle(Request::Hello { version: 99 }), Response::Error(DeviceError::Protocol(_))));

        let Response::Allocated(handle) = device.handle(Request::Allocate {
            bytes: 4,
            scope: MemoryScope::Default,
        }) else {
            panic!("allocation failed");
        };
        assert_eq!(device.handle(Request::Write { handle, data: vec![1, 2, 3, 4] }), Response::Ack);
        assert_eq!(device.handle(Request::Read { handle }), Response::Data(vec![1, 2, 3, 4]));
        assert!(matches!(
            device.handle(Request::Write { handle, data: vec![1] }),
            Response::Error(DeviceError::SizeMismatch { .. })
        ));
        assert_eq!(device.handle(Request::Free { handle }), Response::Ack);
        assert!(matches!(device.handle(Request::Read { handle }), Response::Error(DeviceError::InvalidBuffer(_))));
    }

    #[test]
    fn test_scratch_never_spills() {
        let mut device = device();
        let response = device.handle(Request::Allocate {
            bytes: 2048,
            scope: MemoryScope::Scratch,
        });
        assert!(matches!(response, Response::Error(DeviceError::OutOfMemory { scope: MemoryScope::Scratch, .. })));
        assert_eq!(device.memory().used(MemoryScope::Default), 0);
    }

    #[test]
    fn test_faults_free_call_allocations() {
        let mut device = device();
        let module = device.stage(&relu_graph(DeviceKind::accelerator("v68"), "accel.relu")).unwrap();
        let x = device.allocate(8, MemoryScope::Default).unwrap();
        let before = device.memory().live_allocations();

        // Claims four elements over an eight byte buffer.
        let err = device.run(module, "main", &[TensorArg::new(x, DType::F32, vec![4])]).unwrap_err();
        assert!(matches!(err, DeviceError::Fault(DeviceFault::IllegalMemoryAccess(_))));
        assert_eq!(device.memory().live_allocations(), before);

        device.handle(Request::Goodbye);
        assert_eq!(device.memory().live_allocations(), 0);
        assert_eq!(device.staged_modules(), 0);
    }
}
