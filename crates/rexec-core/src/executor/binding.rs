//! Input binding and argument preparation shared by every executor.
//!
//! Everything here is checked on the host, before any request is sent.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rexec_device::{DType, TensorArg};

use crate::artifact::{Dim, EntryPoint, TensorSignature};
use crate::buffer::{Location, TensorBuffer};
use crate::error::{Error, Result};
use crate::session::SessionInner;

/// Names an entry point input by name or position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InputRef {
    Name(String),
    Index(usize),
}

impl From<&str> for InputRef {
    fn from(name: &str) -> Self {
        InputRef::Name(name.to_string())
    }
}

impl From<String> for InputRef {
    fn from(name: String) -> Self {
        InputRef::Name(name)
    }
}

impl From<usize> for InputRef {
    fn from(index: usize) -> Self {
        InputRef::Index(index)
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputRef::Name(name) => f.write_str(name),
            InputRef::Index(index) => write!(f, "#{index}"),
        }
    }
}

fn describe(dtype: DType, shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(ToString::to_string).collect();
    format!("{dtype}[{}]", dims.join(", "))
}

/// Check dtype, rank and static dims of one argument.
pub(crate) fn check_signature(signature: &TensorSignature, buffer: &TensorBuffer) -> Result<()> {
    let mismatch = || Error::ShapeMismatch {
        input: signature.name.clone(),
        expected: signature.to_string(),
        actual: describe(buffer.dtype(), buffer.shape()),
    };
    if buffer.dtype() != signature.dtype || buffer.shape().len() != signature.shape.len() {
        return Err(mismatch());
    }
    let static_ok = signature
        .shape
        .iter()
        .zip(buffer.shape())
        .all(|(dim, &actual)| dim.as_static().is_none_or(|expected| expected == actual));
    if !static_ok {
        return Err(mismatch());
    }
    Ok(())
}

/// Every symbolic dim must take one value across all arguments of a call.
pub(crate) fn check_symbolic_consistency(entry: &EntryPoint, buffers: &[&TensorBuffer]) -> Result<()> {
    let mut bound: HashMap<&str, (usize, &str)> = HashMap::new();
    for (signature, buffer) in entry.inputs.iter().zip(buffers) {
        for (dim, &actual) in signature.shape.iter().zip(buffer.shape()) {
            let Dim::Symbolic(var) = dim else {
                continue;
            };
            match bound.get(var.as_str()) {
                Some(&(value, from)) if value != actual => {
                    return Err(Error::ShapeMismatch {
                        input: signature.name.clone(),
                        expected: format!("{var} = {value} (bound by `{from}`)"),
                        actual: format!("{var} = {actual}"),
                    });
                }
                Some(_) => {}
                None => {
                    bound.insert(var.as_str(), (actual, signature.name.as_str()));
                }
            }
        }
    }
    Ok(())
}

/// Bound inputs of one entry point.
///
/// Slots filled from the artifact's bound parameters are marked; positional
/// binding skips them and leaves their buffers in place.
pub(crate) struct InputSlots {
    entry: EntryPoint,
    slots: Vec<Option<TensorBuffer>>,
    params: Vec<bool>,
}

impl InputSlots {
    pub fn new(entry: EntryPoint) -> Self {
        let slots = vec![None; entry.inputs.len()];
        let params = vec![false; entry.inputs.len()];
        Self { entry, slots, params }
    }

    pub fn entry(&self) -> &EntryPoint {
        &self.entry
    }

    /// Inputs the caller supplies, parameters excluded.
    pub fn num_free(&self) -> usize {
        self.params.iter().filter(|&&param| !param).count()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entry.inputs.iter().map(|input| input.name.as_str()).collect()
    }

    pub fn resolve(&self, input: &InputRef) -> Result<usize> {
        match input {
            InputRef::Name(name) => self.entry.input_index(name),
            InputRef::Index(index) => Some(*index).filter(|&i| i < self.slots.len()),
        }
        .ok_or_else(|| Error::UnknownInput(format!("{input} (entry point `{}`)", self.entry.name)))
    }

    pub fn bind(&mut self, input: &InputRef, buffer: &TensorBuffer) -> Result<()> {
        let index = self.resolve(input)?;
        check_signature(&self.entry.inputs[index], buffer)?;
        self.slots[index] = Some(buffer.clone());
        Ok(())
    }

    /// Bind a parameter slot by name and take it out of positional binding.
    pub fn bind_param(&mut self, name: &str, buffer: &TensorBuffer) -> Result<()> {
        let index = self.resolve(&InputRef::Name(name.to_string()))?;
        check_signature(&self.entry.inputs[index], buffer)?;
        self.slots[index] = Some(buffer.clone());
        self.params[index] = true;
        Ok(())
    }

    /// Replace every caller-supplied binding at once, positionally, in
    /// declaration order. Parameter slots keep their buffers.
    pub fn bind_all(&mut self, buffers: &[&TensorBuffer]) -> Result<()> {
        let free: Vec<usize> = (0..self.slots.len()).filter(|&i| !self.params[i]).collect();
        if buffers.len() != free.len() {
            return Err(Error::ShapeMismatch {
                input: format!("arguments of `{}`", self.entry.name),
                expected: format!("{} arguments", free.len()),
                actual: format!("{} arguments", buffers.len()),
            });
        }
        for (&index, buffer) in free.iter().zip(buffers) {
            check_signature(&self.entry.inputs[index], buffer)?;
        }
        for (&index, &buffer) in free.iter().zip(buffers) {
            self.slots[index] = Some(buffer.clone());
        }
        Ok(())
    }

    /// All bindings in declaration order, or `UnboundInput` for the first gap.
    pub fn bound(&self) -> Result<Vec<&TensorBuffer>> {
        let buffers = self
            .entry
            .inputs
            .iter()
            .zip(&self.slots)
            .map(|(signature, slot)| slot.as_ref().ok_or_else(|| Error::UnboundInput(signature.name.clone())))
            .collect::<Result<Vec<_>>>()?;
        check_symbolic_consistency(&self.entry, &buffers)?;
        Ok(buffers)
    }
}

/// Device arguments for a call, with host-resident buffers uploaded to
/// temporaries that must stay alive until the call returns.
pub(crate) struct PreparedArgs {
    pub args: Vec<TensorArg>,
    _uploads: Vec<TensorBuffer>,
}

pub(crate) fn prepare_args(session: &Arc<SessionInner>, buffers: &[&TensorBuffer]) -> Result<PreparedArgs> {
    let mut args = Vec::with_capacity(buffers.len());
    let mut uploads = Vec::new();
    for &buffer in buffers {
        if !buffer.belongs_to(session) {
            return Err(Error::Transfer(format!(
                "a {} buffer from another session cannot be passed to session {}",
                buffer.location(),
                session.id()
            )));
        }
        let arg = match buffer.device_arg() {
            Some(arg) => arg,
            None => {
                let upload = session.copy_in_to(&buffer.to_host()?, Location::DeviceDefault)?;
                let arg = upload
                    .device_arg()
                    .ok_or_else(|| Error::Transfer("upload did not produce a device buffer".into()))?;
                uploads.push(upload);
                arg
            }
        };
        args.push(arg);
    }
    Ok(PreparedArgs {
        args,
        _uploads: uploads,
    })
}
