//! VM executor: named functions with positional or keyword arguments and
//! symbolic dims resolved per call.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::binding::{prepare_args, InputRef, InputSlots};
use super::wrap_outputs;
use crate::artifact::MAIN_ENTRY;
use crate::buffer::TensorBuffer;
use crate::error::{Error, Result};
use crate::session::StagedModule;

pub struct VmExecutor {
    staged: Arc<StagedModule>,
    entries: BTreeMap<String, InputSlots>,
    outputs: Option<Vec<TensorBuffer>>,
}

impl VmExecutor {
    pub(crate) fn new(staged: Arc<StagedModule>) -> Result<Self> {
        let entries = staged
            .artifact()
            .entry_points()
            .iter()
            .map(|entry| (entry.name.clone(), InputSlots::new(entry.clone())))
            .collect();
        Ok(Self {
            staged,
            entries,
            outputs: None,
        })
    }

    pub(crate) fn staged(&self) -> &Arc<StagedModule> {
        &self.staged
    }

    pub(crate) fn outputs(&self) -> Option<&[TensorBuffer]> {
        self.outputs.as_deref()
    }

    pub(crate) fn slots(&self, entry: &str) -> Result<&InputSlots> {
        self.entries
            .get(entry)
            .ok_or_else(|| Error::UnknownEntryPoint(entry.to_string()))
    }

    fn slots_mut(&mut self, entry: &str) -> Result<&mut InputSlots> {
        self.entries
            .get_mut(entry)
            .ok_or_else(|| Error::UnknownEntryPoint(entry.to_string()))
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Bind one input of the `main` function.
    pub fn set_input(&mut self, input: impl Into<InputRef>, buffer: &TensorBuffer) -> Result<()> {
        self.staged.session().ensure_open()?;
        self.slots_mut(MAIN_ENTRY)?.bind(&input.into(), buffer)
    }

    pub fn set_inputs<'b>(&mut self, inputs: impl IntoIterator<Item = (&'b str, &'b TensorBuffer)>) -> Result<()> {
        for (name, buffer) in inputs {
            self.set_input(name, buffer)?;
        }
        Ok(())
    }

    /// Replace every argument of `entry`, positionally.
    pub fn set_entry_inputs(&mut self, entry: &str, args: &[&TensorBuffer]) -> Result<()> {
        self.staged.session().ensure_open()?;
        self.slots_mut(entry)?.bind_all(args)
    }

    pub fn run(&mut self) -> Result<()> {
        self.run_entry(MAIN_ENTRY)
    }

    pub fn run_entry(&mut self, entry: &str) -> Result<()> {
        let session = self.staged.session();
        session.ensure_open()?;
        self.outputs = None;

        let slots = self
            .entries
            .get(entry)
            .ok_or_else(|| Error::UnknownEntryPoint(entry.to_string()))?;
        let buffers = slots.bound()?;
        let prepared = prepare_args(session, &buffers)?;
        let results = self.staged.run(entry, prepared.args.clone())?;
        self.outputs = Some(wrap_outputs(session, results));
        Ok(())
    }

    /// Positional call: bind `args` to `entry`, run it and return its results.
    pub fn invoke(&mut self, entry: &str, args: &[&TensorBuffer]) -> Result<&[TensorBuffer]> {
        self.set_entry_inputs(entry, args)?;
        self.run_entry(entry)?;
        Ok(self.outputs.as_deref().unwrap_or_default())
    }

    /// Keyword call. The arguments given replace every earlier binding of
    /// `entry`, so all of its inputs must be named.
    pub fn invoke_named<'b>(
        &mut self,
        entry: &str,
        kwargs: impl IntoIterator<Item = (&'b str, &'b TensorBuffer)>,
    ) -> Result<&[TensorBuffer]> {
        self.staged.session().ensure_open()?;
        let mut fresh = InputSlots::new(self.slots(entry)?.entry().clone());
        for (name, buffer) in kwargs {
            fresh.bind(&InputRef::from(name), buffer)?;
        }
        *self.slots_mut(entry)? = fresh;
        self.run_entry(entry)?;
        Ok(self.outputs.as_deref().unwrap_or_default())
    }
}
