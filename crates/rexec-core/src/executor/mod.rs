//! Executors over a staged artifact
//!
//! [`Session::stage`](crate::Session::stage) returns an [`Executor`] of the
//! artifact's kind:
//!
//! - [`GraphExecutor`]: bind named inputs, run, read fresh outputs.
//! - [`AotExecutor`]: a single packed call writing into outputs allocated at
//!   staging time, reused across runs.
//! - [`VmExecutor`]: several named functions, each callable with positional
//!   or keyword arguments; symbolic dims are resolved per call.
//!
//! Binding is validated on the host, so a bad input never costs a round
//! trip. Outputs are available only after a successful run and are cleared
//! by a failed one. Every call on an executor fails with
//! [`Error::SessionClosed`] once its session is closed.

mod aot;
mod binding;
mod graph;
mod vm;

use std::sync::Arc;

pub use aot::AotExecutor;
pub use binding::InputRef;
pub use graph::GraphExecutor;
pub use vm::VmExecutor;

use rexec_device::TensorArg;

use crate::artifact::{Artifact, ExecutorKind, MAIN_ENTRY};
use crate::buffer::{Location, TensorBuffer};
use crate::error::{Error, Result};
use crate::session::{SessionInner, StagedModule};

/// Device-resident results of one call, owned by the host from here on.
fn wrap_outputs(session: &Arc<SessionInner>, results: Vec<TensorArg>) -> Vec<TensorBuffer> {
    results
        .into_iter()
        .map(|arg| TensorBuffer::device(session.clone(), arg, Location::DeviceDefault))
        .collect()
}

/// An artifact staged on one session, driven through its executor kind.
pub enum Executor {
    Graph(GraphExecutor),
    Aot(AotExecutor),
    Vm(VmExecutor),
}

impl Executor {
    pub(crate) fn new(staged: Arc<StagedModule>) -> Result<Self> {
        let kind = staged.artifact().kind();
        let executor = match kind {
            ExecutorKind::Graph => Executor::Graph(GraphExecutor::new(staged)?),
            ExecutorKind::Aot => Executor::Aot(AotExecutor::new(staged)?),
            ExecutorKind::Vm => Executor::Vm(VmExecutor::new(staged)?),
        };
        tracing::debug!(
            session = executor.session().id(),
            artifact = %executor.artifact().id(),
            kind = %kind,
            "executor_created"
        );
        Ok(executor)
    }

    fn staged(&self) -> &Arc<StagedModule> {
        match self {
            Executor::Graph(graph) => graph.staged(),
            Executor::Aot(aot) => aot.staged(),
            Executor::Vm(vm) => vm.staged(),
        }
    }

    pub(crate) fn session(&self) -> &Arc<SessionInner> {
        self.staged().session()
    }

    pub fn kind(&self) -> ExecutorKind {
        self.artifact().kind()
    }

    pub fn artifact(&self) -> &Artifact {
        self.staged().artifact()
    }

    /// Bind one input by name or position. VM executors bind the `main`
    /// function; use [`VmExecutor::set_entry_inputs`] for the others.
    pub fn set_input(&mut self, input: impl Into<InputRef>, buffer: &TensorBuffer) -> Result<()> {
        match self {
            Executor::Graph(graph) => graph.set_input(input, buffer),
            Executor::Aot(aot) => aot.set_input(input, buffer),
            Executor::Vm(vm) => vm.set_input(input, buffer),
        }
    }

    pub fn set_inputs<'b>(&mut self, inputs: impl IntoIterator<Item = (&'b str, &'b TensorBuffer)>) -> Result<()> {
        for (name, buffer) in inputs {
            self.set_input(name, buffer)?;
        }
        Ok(())
    }

    /// Bind the inputs of `main` positionally. Parameters bound into a
    /// graph artifact are not part of the argument list.
    pub fn set_positional(&mut self, buffers: &[&TensorBuffer]) -> Result<()> {
        match self {
            Executor::Graph(graph) => graph.set_positional(buffers),
            Executor::Aot(aot) => aot.set_positional(buffers),
            Executor::Vm(vm) => vm.set_entry_inputs(MAIN_ENTRY, buffers),
        }
    }

    /// Run `main` synchronously.
    pub fn run(&mut self) -> Result<()> {
        match self {
            Executor::Graph(graph) => graph.run(),
            Executor::Aot(aot) => aot.run(),
            Executor::Vm(vm) => vm.run(),
        }
    }

    /// Run a named entry point. Graph and AOT artifacts only have `main`.
    pub fn run_entry(&mut self, entry: &str) -> Result<()> {
        match self {
            Executor::Vm(vm) => vm.run_entry(entry),
            _ if entry == MAIN_ENTRY => self.run(),
            _ => {
                self.session().ensure_open()?;
                Err(Error::UnknownEntryPoint(entry.to_string()))
            }
        }
    }

    /// Outputs of the last successful run.
    pub fn get_outputs(&self) -> Result<&[TensorBuffer]> {
        self.session().ensure_open()?;
        let outputs = match self {
            Executor::Graph(graph) => graph.outputs(),
            Executor::Aot(aot) => aot.outputs(),
            Executor::Vm(vm) => vm.outputs(),
        };
        outputs.ok_or_else(|| Error::OutputUnavailable("no successful run yet".into()))
    }

    pub fn get_output(&self, index: usize) -> Result<&TensorBuffer> {
        let outputs = self.get_outputs()?;
        outputs.get(index).ok_or_else(|| {
            Error::OutputUnavailable(format!("output {index} out of range ({} outputs)", outputs.len()))
        })
    }

    /// Number of arguments [`set_positional`](Self::set_positional) takes.
    /// Bound graph parameters are not counted.
    pub fn num_inputs(&self) -> Result<usize> {
        self.session().ensure_open()?;
        match self {
            Executor::Graph(graph) => Ok(graph.inputs().num_free()),
            Executor::Aot(aot) => Ok(aot.inputs().num_free()),
            Executor::Vm(vm) => Ok(vm.slots(MAIN_ENTRY)?.num_free()),
        }
    }

    pub fn num_outputs(&self) -> Result<usize> {
        self.session().ensure_open()?;
        self.artifact()
            .entry_point(MAIN_ENTRY)
            .map(|entry| entry.outputs.len())
            .ok_or_else(|| Error::UnknownEntryPoint(MAIN_ENTRY.to_string()))
    }

    pub fn input_names(&self) -> Result<Vec<String>> {
        self.session().ensure_open()?;
        let names = match self {
            Executor::Graph(graph) => graph.inputs().names(),
            Executor::Aot(aot) => aot.inputs().names(),
            Executor::Vm(vm) => vm.slots(MAIN_ENTRY)?.names(),
        };
        Ok(names.into_iter().map(str::to_string).collect())
    }

    pub fn as_vm_mut(&mut self) -> Option<&mut VmExecutor> {
        match self {
            Executor::Vm(vm) => Some(vm),
            _ => None,
        }
    }

    /// Drop the executor now. The module is unloaded once no executor of
    /// this session references it.
    pub fn release(self) {
        tracing::debug!(
            session = self.session().id(),
            artifact = %self.artifact().id(),
            "executor_released"
        );
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("kind", &self.kind())
            .field("artifact", &self.artifact().id())
            .field("session", &self.session().id())
            .finish()
    }
}
