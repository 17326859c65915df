//! AOT executor: packed `(inputs..., outputs...)` calls into output buffers
//! allocated once at staging time.

use std::sync::Arc;

use super::binding::{prepare_args, InputRef, InputSlots};
use crate::artifact::MAIN_ENTRY;
use crate::buffer::{Location, TensorBuffer};
use crate::error::{Error, Result};
use crate::session::StagedModule;

pub struct AotExecutor {
    staged: Arc<StagedModule>,
    inputs: InputSlots,
    outputs: Vec<TensorBuffer>,
    /// Whether `outputs` hold the results of a successful run.
    valid: bool,
}

impl AotExecutor {
    pub(crate) fn new(staged: Arc<StagedModule>) -> Result<Self> {
        let entry = staged
            .artifact()
            .entry_point(MAIN_ENTRY)
            .cloned()
            .ok_or_else(|| Error::Staging(format!("AOT artifact has no `{MAIN_ENTRY}` entry point")))?;
        let outputs = entry
            .outputs
            .iter()
            .map(|output| {
                let shape = output.static_shape().ok_or_else(|| {
                    Error::Staging(format!("AOT output `{}` has symbolic shape {output}", output.name))
                })?;
                staged.session().allocate(&shape, output.dtype, Location::DeviceDefault)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            staged,
            inputs: InputSlots::new(entry),
            outputs,
            valid: false,
        })
    }

    pub(crate) fn staged(&self) -> &Arc<StagedModule> {
        &self.staged
    }

    pub(crate) fn inputs(&self) -> &InputSlots {
        &self.inputs
    }

    pub(crate) fn outputs(&self) -> Option<&[TensorBuffer]> {
        self.valid.then_some(self.outputs.as_slice())
    }

    pub fn set_input(&mut self, input: impl Into<InputRef>, buffer: &TensorBuffer) -> Result<()> {
        self.staged.session().ensure_open()?;
        self.inputs.bind(&input.into(), buffer)
    }

    /// Bind every input in the compiled argument order.
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

    /// Every input must be bound; the outputs are overwritten in place.
    pub fn run(&mut self) -> Result<()> {
        let session = self.staged.session();
        session.ensure_open()?;
        self.valid = false;

        let mut packed = self.inputs.bound()?;
        packed.extend(self.outputs.iter());
        let prepared = prepare_args(session, &packed)?;
        let returned = self.staged.run(MAIN_ENTRY, prepared.args.clone())?;
        if !returned.is_empty() {
            return Err(Error::Connection(format!(
                "AOT call returned {} buffers, expected none",
                returned.len()
            )));
        }
        self.valid = true;
        Ok(())
    }
}
