//! Minimal compiler producing [`Artifact`]s from [`Computation`]s.
//!
//! The compiler type-checks a computation, checks the supplied parameter
//! values against their declarations, and lowers it to the module image of
//! the requested executor kind:
//!
//! - Graph: node list over named inputs; parameters stay host-side and are
//!   bound when the artifact is staged
//! - AOT: packed step list with parameters linked in as constants and a
//!   statically planned workspace
//! - VM: register bytecode whose shapes may depend on symbolic input dims
//!
//! Codegen attributes on the target are recorded in the artifact but do not
//! change the generated code.

mod infer;
mod ir;
mod lower;

use std::collections::BTreeMap;

use rexec_device::{DeviceKind, ModuleBody, ModuleImage};
use tracing::instrument;

pub use ir::{load_external_model, Computation, ComputationBuilder, LoadedModel, Node, Op, ParamDecl, Value};

use crate::artifact::{Artifact, EntryPoint, ExecutorKind, MAIN_ENTRY};
use crate::error::{Error, Result};
use crate::target::TargetDescriptor;
use crate::tensor::HostTensor;

/// Per-build settings.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub kind: ExecutorKind,
    /// Values for every declared parameter, by name.
    pub params: BTreeMap<String, HostTensor>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Graph,
            params: BTreeMap::new(),
        }
    }
}

impl BuildOptions {
    pub fn new(kind: ExecutorKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, HostTensor>) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: HostTensor) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

/// Produces artifacts for a target.
pub trait Compiler {
    fn compile(&self, computation: &Computation, target: &TargetDescriptor, options: &BuildOptions) -> Result<Artifact>;
}

/// The in-tree compiler.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCompiler;

impl StandardCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Build a VM artifact exposing several computations as named entry
    /// points. Parameters with the same name are shared between them.
    #[instrument(skip_all, fields(target = %target, entries = entries.len()))]
    pub fn compile_vm_entries(
        &self,
        entries: &[(&str, &Computation)],
        target: &TargetDescriptor,
        params: &BTreeMap<String, HostTensor>,
    ) -> Result<Artifact> {
        if entries.is_empty() {
            return Err(Error::compilation("a VM artifact needs at least one entry point"));
        }
        let device = target.device_kind();
        let mut functions = Vec::with_capacity(entries.len());
        let mut entry_points: Vec<EntryPoint> = Vec::with_capacity(entries.len());
        let mut constants = Vec::new();
        for (name, computation) in entries {
            if entry_points.iter().any(|entry| entry.name == *name) {
                return Err(Error::compilation(format!("entry point `{name}` is defined twice")));
            }
            let typed = infer::infer(computation)?;
            check_params(computation, params, false)?;
            functions.push(lower::lower_vm_function(&typed, device, name, &mut constants, params)?);
            entry_points.push(lower::entry_point(name, &typed, false));
        }
        let used: Vec<&str> = constants.iter().map(|constant| constant.name.as_str()).collect();
        if let Some(unused) = params.keys().find(|name| !used.contains(&name.as_str())) {
            return Err(Error::compilation(format!("value supplied for undeclared parameter `{unused}`")));
        }

        let body = ModuleBody::Vm(lower::finish_vm(functions, constants));
        let artifact = Artifact::new(
            target.clone(),
            ExecutorKind::Vm,
            encode(device, body)?,
            entry_points,
            BTreeMap::new(),
        );
        tracing::debug!(artifact = %artifact.id(), payload_bytes = artifact.payload().len(), "artifact_built");
        Ok(artifact)
    }
}

impl Compiler for StandardCompiler {
    #[instrument(skip_all, fields(computation = %computation.name, target = %target, kind = %options.kind))]
    fn compile(&self, computation: &Computation, target: &TargetDescriptor, options: &BuildOptions) -> Result<Artifact> {
        let device = target.device_kind();
        let typed = infer::infer(computation)?;
        if options.kind != ExecutorKind::Vm {
            check_params(computation, &options.params, true)?;
        }
        let (body, entry, bound_params) = match options.kind {
            ExecutorKind::Vm => return self.compile_vm_entries(&[(MAIN_ENTRY, computation)], target, &options.params),
            ExecutorKind::Graph => (
                ModuleBody::Graph(lower::lower_graph(&typed, device)?),
                lower::entry_point(MAIN_ENTRY, &typed, true),
                options.params.clone(),
            ),
            ExecutorKind::Aot => (
                ModuleBody::Aot(lower::lower_aot(&typed, device, MAIN_ENTRY, &options.params)?),
                lower::entry_point(MAIN_ENTRY, &typed, false),
                BTreeMap::new(),
            ),
        };

        let artifact = Artifact::new(target.clone(), options.kind, encode(device, body)?, vec![entry], bound_params);
        tracing::debug!(artifact = %artifact.id(), payload_bytes = artifact.payload().len(), "artifact_built");
        Ok(artifact)
    }
}

/// Build with the [`StandardCompiler`].
pub fn build(computation: &Computation, target: &TargetDescriptor, options: &BuildOptions) -> Result<Artifact> {
    StandardCompiler.compile(computation, target, options)
}

fn encode(device: &DeviceKind, body: ModuleBody) -> Result<Vec<u8>> {
    ModuleImage::new(device.clone(), body)
        .to_bytes()
        .map_err(|err| Error::compilation(format!("cannot encode module image: {err}")))
}

/// Every declared parameter needs a value of the declared dtype and shape.
/// With `exhaustive`, values for undeclared parameters are rejected too.
fn check_params(computation: &Computation, params: &BTreeMap<String, HostTensor>, exhaustive: bool) -> Result<()> {
    for decl in &computation.params {
        let value = params
            .get(&decl.name)
            .ok_or_else(|| Error::compilation(format!("parameter `{}` has no value", decl.name)))?;
        if value.dtype() != decl.dtype || value.shape() != decl.shape.as_slice() {
            return Err(Error::compilation(format!(
                "parameter `{}` is declared as {}{:?} but the value is {}{:?}",
                decl.name,
                decl.dtype,
                decl.shape,
                value.dtype(),
                value.shape()
            )));
        }
    }
    if exhaustive {
        if let Some(unknown) = params.keys().find(|name| !computation.params.iter().any(|decl| &decl.name == *name)) {
            return Err(Error::compilation(format!("value supplied for undeclared parameter `{unknown}`")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_device::DType;

    fn scale() -> Computation {
        let mut b = ComputationBuilder::new("scale");
        let x = b.static_input("x", DType::I32, &[2]);
        let k = b.param("k", DType::I32, &[2]);
        let y = b.multiply(&x, &k);
        b.output(&y);
        b.build().unwrap()
    }

    fn k() -> HostTensor {
        HostTensor::from_vec(vec![2], vec![3i32, -1]).unwrap()
    }

    #[test]
    fn test_build_each_kind() {
        let target = TargetDescriptor::accelerator("v68").with_host(TargetDescriptor::host_cpu());
        for kind in [ExecutorKind::Graph, ExecutorKind::Aot, ExecutorKind::Vm] {
            let options = BuildOptions::new(kind).with_param("k", k());
            let artifact = build(&scale(), &target, &options).unwrap();
            assert_eq!(artifact.kind(), kind);
            assert_eq!(artifact.target(), &target);

            let image = ModuleImage::from_bytes(artifact.payload()).unwrap();
            assert_eq!(image.target, DeviceKind::accelerator("v68"));
            assert_eq!(image.kernel_symbols(), vec!["accel.multiply"]);

            let main = artifact.entry_point(MAIN_ENTRY).unwrap();
            let expected_inputs = if kind == ExecutorKind::Graph { 2 } else { 1 };
            assert_eq!(main.inputs.len(), expected_inputs);
            assert_eq!(artifact.bound_params().len(), usize::from(kind == ExecutorKind::Graph));
        }
    }

    #[test]
    fn test_parameter_checks() {
        let target = TargetDescriptor::host_cpu();
        let missing = build(&scale(), &target, &BuildOptions::new(ExecutorKind::Aot));
        assert!(matches!(missing, Err(Error::Compilation(_))));

        let wrong = BuildOptions::new(ExecutorKind::Graph).with_param("k", HostTensor::zeros(vec![3], DType::I32));
        assert!(build(&scale(), &target, &wrong).is_err());

        let extra = BuildOptions::new(ExecutorKind::Graph)
            .with_param("k", k())
            .with_param("bias", HostTensor::zeros(vec![2], DType::I32));
        assert!(build(&scale(), &target, &extra).is_err());
        let extra_vm = BuildOptions::new(ExecutorKind::Vm)
            .with_param("k", k())
            .with_param("bias", HostTensor::zeros(vec![2], DType::I32));
        assert!(build(&scale(), &target, &extra_vm).is_err());
    }

    #[test]
    fn test_vm_entries() {
        let target = TargetDescriptor::host_cpu();
        let params = BTreeMap::from([("k".to_string(), k())]);
        let computation = scale();
        let artifact = StandardCompiler::new()
            .compile_vm_entries(&[("main", &computation), ("scale_again", &computation)], &target, &params)
            .unwrap();
        assert_eq!(artifact.entry_points().len(), 2);
        assert!(artifact.entry_point("scale_again").is_some());

        let duplicate = StandardCompiler::new().compile_vm_entries(
            &[("main", &computation), ("main", &computation)],
            &target,
            &params,
        );
        assert!(duplicate.is_err());
    }
}
