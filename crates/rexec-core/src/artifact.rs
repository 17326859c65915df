//! Compiled artifacts

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rexec_device::DType;
use serde::{Deserialize, Serialize};

use crate::target::TargetDescriptor;
use crate::tensor::HostTensor;

/// Name of the default entry point of every artifact.
pub const MAIN_ENTRY: &str = "main";

/// Execution strategy an artifact was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Graph,
    Aot,
    Vm,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutorKind::Graph => "graph",
            ExecutorKind::Aot => "aot",
            ExecutorKind::Vm => "vm",
        })
    }
}

/// One dimension of a declared tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dim {
    Static(usize),
    /// Resolved from the argument shapes on every invocation.
    Symbolic(String),
}

impl Dim {
    pub fn symbolic(name: impl Into<String>) -> Self {
        Dim::Symbolic(name.into())
    }

    pub fn as_static(&self) -> Option<usize> {
        match self {
            Dim::Static(n) => Some(*n),
            Dim::Symbolic(_) => None,
        }
    }
}

impl From<usize> for Dim {
    fn from(n: usize) -> Self {
        Dim::Static(n)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(n) => write!(f, "{n}"),
            Dim::Symbolic(name) => f.write_str(name),
        }
    }
}

/// Declared name, dtype and shape of an entry point argument or result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSignature {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<Dim>,
}

impl TensorSignature {
    pub fn new(name: impl Into<String>, dtype: DType, shape: Vec<Dim>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }

    pub fn is_static(&self) -> bool {
        self.shape.iter().all(|dim| dim.as_static().is_some())
    }

    pub fn static_shape(&self) -> Option<Vec<usize>> {
        self.shape.iter().map(Dim::as_static).collect()
    }
}

impl fmt::Display for TensorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (i, dim) in self.shape.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub name: String,
    pub inputs: Vec<TensorSignature>,
    pub outputs: Vec<TensorSignature>,
}

impl EntryPoint {
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|input| input.name == name)
    }
}

/// Identity of one artifact instance. Clones share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactId(u64);

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "artifact{}", self.0)
    }
}

static NEXT_ARTIFACT_ID: AtomicU64 = AtomicU64::new(1);

/// An opaque compiled unit for one target.
///
/// The payload is a serialized module image the device decodes at staging
/// time; the host never looks inside it. Clones share the payload and the
/// bound parameters.
#[derive(Clone)]
pub struct Artifact {
    id: ArtifactId,
    target: TargetDescriptor,
    kind: ExecutorKind,
    payload: Arc<[u8]>,
    entry_points: Arc<[EntryPoint]>,
    bound_params: Arc<BTreeMap<String, HostTensor>>,
}

impl Artifact {
    pub fn new(
        target: TargetDescriptor,
        kind: ExecutorKind,
        payload: Vec<u8>,
        entry_points: Vec<EntryPoint>,
        bound_params: BTreeMap<String, HostTensor>,
    ) -> Self {
        Self {
            id: ArtifactId(NEXT_ARTIFACT_ID.fetch_add(1, Ordering::Relaxed)),
            target,
            kind,
            payload: payload.into(),
            entry_points: entry_points.into(),
            bound_params: Arc::new(bound_params),
        }
    }

    pub fn id(&self) -> ArtifactId {
        self.id
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    pub fn kind(&self) -> ExecutorKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    pub fn entry_point(&self, name: &str) -> Option<&EntryPoint> {
        self.entry_points.iter().find(|entry| entry.name == name)
    }

    /// Parameter values the executor binds when the artifact is staged.
    pub fn bound_params(&self) -> &BTreeMap<String, HostTensor> {
        &self.bound_params
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("id", &self.id)
            .field("target", &self.target.to_string())
            .field("kind", &self.kind)
            .field("payload_bytes", &self.payload.len())
            .field("entry_points", &self.entry_points.iter().map(|e| e.name.as_str()).collect::<Vec<_>>())
            .field("bound_params", &self.bound_params.keys().collect::<Vec<_>>())
            .finish()
    }
}
