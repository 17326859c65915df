//! Graph executor: named inputs, fresh outputs on every run.

use std::sync::Arc;

use super::binding::{prepare_args, InputRef, InputSlots};
use super::wrap_outputs;
use crate::artifact::MAIN_ENTRY;
use crate::buffer::{Location, TensorBuffer};
use crate::error::{Error, Result};
use crate::session::StagedModule;

pub struct GraphExecutor {
    staged: Arc<StagedModule>,
    inputs: InputSlots,
    outputs: Option<Vec<TensorBuffer>>,
}

impl GraphExecutor {
    /// Bound parameters of the artifact are uploaded and bound here, once.
    pub(crate) fn new(staged: Arc<StagedModule>) -> Result<Self> {
        let entry = staged
            .artifact()
            .entry_point(MAIN_ENTRY)
            .cloned()
            .ok_or_else(|| Error::Staging(format!("graph artifact has no `{MAIN_ENTRY}` entry point")))?;
        let mut inputs = InputSlots::new(entry);
        for (name, value) in staged.artifact().bound_params() {
            let buffer = staged.session().copy_in_to(value, Location::DeviceDefault)?;
            inputs.bind_param(name, &buffer)?;
        }
        Ok(Self {
            staged,
            inputs,
            outputs: None,
        })
    }

    pub(crate) fn staged(&self) -> &Arc<StagedModule> {
        &self.staged
    }

    pub(crate) fn inputs(&self) -> &InputSlots {
        &self.inputs
    }

    pub(crate) fn outputs(&self) -> Option<&[TensorBuffer]> {
        self.outputs.as_deref()
    }

    /// Bind one input. Other bindings, including parameters, are kept.
    pub fn set_input(&mut self, input: impl Into<InputRef>, buffer: &TensorBuffer) -> Result<()> {
        self.staged.session().ensure_open()?;
        self.inputs.bind(&input.into(), buffer)
    }

    /// Bind the caller-supplied inputs in declaration order. Parameter
    /// slots are skipped and keep their buffers.
    pub fn set_positional(&mut self, buffers: &[&TensorBuffer]) -> Result<()> {
        self.staged.session().ensure_open()?;
        self.inputs.bind_all(buffers)
    }

    pub fn set_inputs<'b>(&mut self, inputs: impl IntoIterator<Item = (&'b str, &'b TensorBuffer)>) -> Result<()> {
        for (name, buffer) in inputs {
            self.set_input(name, buffer)?;
        }
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let session = self.staged.session();
        session.ensure_open()?;
        self.outputs = None;

        let buffers = self.inputs.bound()?;
        let prepared = prepare_args(session, &buffers)?;
        let results = self.staged.run(MAIN_ENTRY, prepared.args.clone())?;
        self.outputs = Some(wrap_outputs(session, results));
        Ok(())
    }

    /// Bind by name, then run.
    pub fn run_with<'b>(&mut self, inputs: impl IntoIterator<Item = (&'b str, &'b TensorBuffer)>) -> Result<()> {
        self.set_inputs(inputs)?;
        self.run()
    }
}
