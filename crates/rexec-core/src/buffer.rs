//! Tensor buffers owned through a session.
//!
//! A [`TensorBuffer`] is either host bytes or a device allocation. Handles
//! are cheap clones of one shared allocation; device memory is freed when the
//! last handle goes away.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rexec_device::{byte_len, num_elements, BufferHandle, DType, MemoryScope, TensorArg};
use rexec_tracing::performance::{record_transfer, TransferDirection};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::SessionInner;
use crate::tensor::HostTensor;

/// Where a buffer's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    Host,
    /// Device default memory (`global`).
    DeviceDefault,
    /// Device scratch memory (`global.vtcm`).
    DeviceScratch,
}

impl Location {
    /// Device pool backing this location, `None` for host memory.
    pub fn scope(self) -> Option<MemoryScope> {
        match self {
            Location::Host => None,
            Location::DeviceDefault => Some(MemoryScope::Default),
            Location::DeviceScratch => Some(MemoryScope::Scratch),
        }
    }

    pub fn is_device(self) -> bool {
        self != Location::Host
    }
}

impl From<MemoryScope> for Location {
    fn from(scope: MemoryScope) -> Self {
        match scope {
            MemoryScope::Default => Location::DeviceDefault,
            MemoryScope::Scratch => Location::DeviceScratch,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope() {
            None => f.write_str("host"),
            Some(scope) => write!(f, "{scope}"),
        }
    }
}

enum Storage {
    Host(Mutex<Vec<u8>>),
    Device(BufferHandle),
}

struct BufferInner {
    shape: Vec<usize>,
    dtype: DType,
    location: Location,
    session: Arc<SessionInner>,
    storage: Storage,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Storage::Device(handle) = self.storage {
            self.session.free(handle);
        }
    }
}

/// Dense row-major tensor in host or device memory.
///
/// The byte length is `product(shape) * dtype.size_bytes()` for the whole
/// lifetime of the buffer; contents change only through whole-buffer
/// [`copy_from_host`](Self::copy_from_host).
#[derive(Clone)]
pub struct TensorBuffer {
    inner: Arc<BufferInner>,
}

impl TensorBuffer {
    pub(crate) fn host(session: Arc<SessionInner>, shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                shape,
                dtype,
                location: Location::Host,
                session,
                storage: Storage::Host(Mutex::new(data)),
            }),
        }
    }

    /// Take ownership of a device allocation.
    pub(crate) fn device(session: Arc<SessionInner>, arg: TensorArg, location: Location) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                shape: arg.shape,
                dtype: arg.dtype,
                location,
                session,
                storage: Storage::Device(arg.handle),
            }),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn location(&self) -> Location {
        self.inner.location
    }

    pub fn num_elements(&self) -> usize {
        num_elements(&self.inner.shape)
    }

    pub fn byte_len(&self) -> usize {
        byte_len(&self.inner.shape, self.inner.dtype)
    }

    /// Whether both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &TensorBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Overwrite the whole buffer. Shape and dtype must match exactly.
    pub fn copy_from_host(&self, tensor: &HostTensor) -> Result<()> {
        self.inner.session.ensure_open()?;
        if tensor.dtype() != self.dtype() || tensor.shape() != self.shape() {
            return Err(Error::Transfer(format!(
                "cannot copy {}{:?} into a {}{:?} buffer",
                tensor.dtype(),
                tensor.shape(),
                self.dtype(),
                self.shape()
            )));
        }
        let start = Instant::now();
        match &self.inner.storage {
            Storage::Host(bytes) => bytes.lock().copy_from_slice(tensor.as_bytes()),
            Storage::Device(handle) => {
                self.inner.session.write(*handle, tensor.as_bytes())?;
                record_transfer(
                    TransferDirection::HostToDevice,
                    tensor.byte_len(),
                    start.elapsed().as_micros() as u64,
                );
            }
        }
        Ok(())
    }

    /// Copy the whole buffer back into host memory.
    pub fn to_host(&self) -> Result<HostTensor> {
        self.inner.session.ensure_open()?;
        let start = Instant::now();
        let data = match &self.inner.storage {
            Storage::Host(bytes) => bytes.lock().clone(),
            Storage::Device(handle) => {
                let data = self.inner.session.read(*handle)?;
                record_transfer(TransferDirection::DeviceToHost, data.len(), start.elapsed().as_micros() as u64);
                data
            }
        };
        HostTensor::new(self.shape().to_vec(), self.dtype(), data).map_err(|err| Error::Transfer(err.to_string()))
    }

    /// The device argument describing this buffer, `None` for host storage.
    pub(crate) fn device_arg(&self) -> Option<TensorArg> {
        match self.inner.storage {
            Storage::Device(handle) => Some(TensorArg::new(handle, self.dtype(), self.shape().to_vec())),
            Storage::Host(_) => None,
        }
    }

    pub(crate) fn session(&self) -> &Arc<SessionInner> {
        &self.inner.session
    }

    pub(crate) fn belongs_to(&self, session: &Arc<SessionInner>) -> bool {
        Arc::ptr_eq(&self.inner.session, session)
    }
}

impl fmt::Debug for TensorBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("TensorBuffer");
        debug
            .field("shape", &self.inner.shape)
            .field("dtype", &self.inner.dtype)
            .field("location", &self.inner.location);
        if let Storage::Device(handle) = self.inner.storage {
            debug.field("handle", &handle);
        }
        debug.finish()
    }
}
