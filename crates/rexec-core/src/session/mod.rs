//! Device sessions
//!
//! A [`Session`] owns one connection to a device and everything allocated
//! through it. It is opened once, stages artifacts into [`Executor`]s,
//! allocates [`TensorBuffer`]s, and is closed exactly once; closing
//! invalidates every buffer and executor it produced.
//!
//! ```rust
//! use rexec_core::{ConnectionParams, HostTensor, Session};
//!
//! let session = Session::open(ConnectionParams::loopback("v68")).unwrap();
//! let x = HostTensor::from_vec(vec![3], vec![1.0f32, 2.0, 3.0]).unwrap();
//! let on_device = session.copy_in(&x).unwrap();
//! assert_eq!(session.copy_out(&on_device).unwrap(), x);
//! session.close();
//! ```

mod config;
mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use rexec_device::protocol::{decode, encode};
use rexec_device::{
    BufferHandle, DType, DeviceInfo, ModuleId, Request, Response, TensorArg, PROTOCOL_VERSION,
};
use rexec_tracing::performance::record_invocation;
use tracing::instrument;

pub use config::{ConnectionParams, Endpoint};
pub use transport::{LoopbackTransport, TcpTransport, Transport};

use crate::artifact::{Artifact, ArtifactId};
use crate::buffer::{Location, TensorBuffer};
use crate::error::{Error, Phase, Result};
use crate::executor::Executor;
use crate::tensor::HostTensor;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Round-trip counters, for checking which calls reach the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub round_trips: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// State shared by a session and every handle it produced.
pub(crate) struct SessionInner {
    id: u64,
    transport: Mutex<Option<Box<dyn Transport>>>,
    closed: AtomicBool,
    degraded: AtomicBool,
    info: DeviceInfo,
    params: ConnectionParams,
    stats: Mutex<SessionStats>,
    staged: Mutex<HashMap<ArtifactId, Weak<StagedModule>>>,
}

impl SessionInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        if self.degraded.load(Ordering::Acquire) {
            return Err(Error::Connection(format!(
                "session {} lost its transport; open a new session",
                self.id
            )));
        }
        Ok(())
    }

    /// One request/response exchange. Device errors are mapped for `phase`;
    /// transport failures leave the session degraded.
    fn request(&self, phase: Phase, request: Request) -> Result<Response> {
        self.ensure_open()?;
        let kind = request.kind();
        let frame = encode(&request)?;

        let mut transport = self.transport.lock();
        let transport = transport.as_mut().ok_or(Error::SessionClosed)?;
        let reply = match transport.round_trip(&frame) {
            Ok(reply) => reply,
            Err(err) => {
                self.degraded.store(true, Ordering::Release);
                tracing::warn!(session = self.id, request = kind, error = %err, "transport_failed");
                return Err(Error::Connection(format!("{kind} request to {} failed: {err}", transport.describe())));
            }
        };
        {
            let mut stats = self.stats.lock();
            stats.round_trips += 1;
            stats.bytes_sent += frame.len() as u64;
            stats.bytes_received += reply.len() as u64;
        }

        match decode::<Response>(&reply) {
            Ok(Response::Error(err)) => Err(Error::from_device(phase, err)),
            Ok(response) => Ok(response),
            Err(err) => {
                self.degraded.store(true, Ordering::Release);
                Err(Error::Connection(format!("undecodable {kind} response: {err}")))
            }
        }
    }

    pub(crate) fn allocate(self: &Arc<Self>, shape: &[usize], dtype: DType, location: Location) -> Result<TensorBuffer> {
        self.ensure_open()?;
        let Some(scope) = location.scope() else {
            let tensor = HostTensor::try_zeros(shape.to_vec(), dtype)?;
            return Ok(TensorBuffer::host(Arc::clone(self), shape.to_vec(), dtype, tensor.into_bytes()));
        };
        // An overflowing shape saturates and is refused by the device pool.
        let bytes = rexec_device::byte_len(shape, dtype);
        match self.request(Phase::Transfer, Request::Allocate { bytes, scope })? {
            Response::Allocated(handle) => Ok(TensorBuffer::device(
                Arc::clone(self),
                TensorArg::new(handle, dtype, shape.to_vec()),
                location,
            )),
            other => Err(unexpected("allocate", &other)),
        }
    }

    pub(crate) fn copy_in_to(self: &Arc<Self>, tensor: &HostTensor, location: Location) -> Result<TensorBuffer> {
        let buffer = self.allocate(tensor.shape(), tensor.dtype(), location)?;
        buffer.copy_from_host(tensor)?;
        Ok(buffer)
    }

    pub(crate) fn write(&self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        match self.request(
            Phase::Transfer,
            Request::Write {
                handle,
                data: data.to_vec(),
            },
        )? {
            Response::Ack => Ok(()),
            other => Err(unexpected("write", &other)),
        }
    }

    pub(crate) fn read(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        match self.request(Phase::Transfer, Request::Read { handle })? {
            Response::Data(data) => Ok(data),
            other => Err(unexpected("read", &other)),
        }
    }

    /// Best effort; a closed or broken session has nothing left to free.
    pub(crate) fn free(&self, handle: BufferHandle) {
        if self.ensure_open().is_err() {
            return;
        }
        if let Err(err) = self.request(Phase::Transfer, Request::Free { handle }) {
            tracing::debug!(session = self.id, handle = %handle, error = %err, "free_failed");
        }
    }

    pub(crate) fn stage(self: &Arc<Self>, artifact: &Artifact) -> Result<Arc<StagedModule>> {
        self.ensure_open()?;
        if self.params.reuse_staged_modules {
            if let Some(staged) = self.staged.lock().get(&artifact.id()).and_then(Weak::upgrade) {
                rexec_tracing::perf_event!("staged_module_reused", session = self.id, module = staged.module.0);
                return Ok(staged);
            }
        }

        let (response, duration_us) = rexec_tracing::timed_block!("stage", {
            self.request(
                Phase::Stage,
                Request::Stage {
                    payload: artifact.payload().to_vec(),
                },
            )
        });
        let module = match response? {
            Response::Staged(module) => module,
            other => return Err(unexpected("stage", &other)),
        };
        let staged = Arc::new(StagedModule {
            session: Arc::clone(self),
            module,
            artifact: artifact.clone(),
        });
        if self.params.reuse_staged_modules {
            let mut cache = self.staged.lock();
            cache.retain(|_, module| module.strong_count() > 0);
            cache.insert(artifact.id(), Arc::downgrade(&staged));
        }
        tracing::debug!(
            session = self.id,
            artifact = %artifact.id(),
            module = %module,
            payload_bytes = artifact.payload().len(),
            duration_us,
            "artifact_staged"
        );
        Ok(staged)
    }

    fn unload(&self, module: ModuleId) {
        if self.ensure_open().is_err() {
            return;
        }
        if let Err(err) = self.request(Phase::Stage, Request::Unload { module }) {
            tracing::debug!(session = self.id, module = %module, error = %err, "unload_failed");
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(mut transport) = self.transport.lock().take() else {
            return;
        };
        // The device drops everything this connection owned on goodbye.
        if !self.degraded.load(Ordering::Acquire) {
            if let Ok(frame) = encode(&Request::Goodbye) {
                if let Err(err) = transport.round_trip(&frame) {
                    tracing::debug!(session = self.id, error = %err, "goodbye_failed");
                }
            }
        }
        tracing::info!(session = self.id, peer = %transport.describe(), stats = ?*self.stats.lock(), "session_closed");
    }
}

fn unexpected(operation: &str, response: &Response) -> Error {
    Error::Connection(format!("unexpected response to {operation}: {response:?}"))
}

/// A module loaded on the device, unloaded when the last executor using it
/// is dropped.
pub(crate) struct StagedModule {
    session: Arc<SessionInner>,
    module: ModuleId,
    artifact: Artifact,
}

impl StagedModule {
    pub(crate) fn session(&self) -> &Arc<SessionInner> {
        &self.session
    }

    pub(crate) fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    /// Run `entry` synchronously and return the result descriptors.
    pub(crate) fn run(&self, entry: &str, args: Vec<TensorArg>) -> Result<Vec<TensorArg>> {
        let start = Instant::now();
        let num_args = args.len();
        let outputs = match self.session.request(
            Phase::Run,
            Request::Run {
                module: self.module,
                entry: entry.to_string(),
                args,
            },
        )? {
            Response::Outputs(outputs) => outputs,
            other => return Err(unexpected("run", &other)),
        };
        record_invocation(
            &self.artifact.kind().to_string(),
            entry,
            num_args,
            start.elapsed().as_micros() as u64,
        );
        Ok(outputs)
    }
}

impl Drop for StagedModule {
    fn drop(&mut self) {
        self.session.unload(self.module);
    }
}

/// Connection to one device.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Connect and perform the versioned handshake.
    #[instrument(skip_all, fields(endpoint = ?params.endpoint))]
    pub fn open(params: ConnectionParams) -> Result<Self> {
        let mut transport: Box<dyn Transport> = match &params.endpoint {
            Endpoint::Loopback(config) => Box::new(
                LoopbackTransport::new(config.clone())
                    .map_err(|err| Error::Connection(format!("cannot start loopback device: {err}")))?,
            ),
            Endpoint::Tcp(addr) => Box::new(
                TcpTransport::connect(addr, params.connect_timeout, params.io_timeout)
                    .map_err(|err| Error::Connection(format!("cannot reach device at {addr}: {err}")))?,
            ),
        };

        let hello = encode(&Request::Hello {
            version: PROTOCOL_VERSION,
        })?;
        let reply = transport.round_trip(&hello)?;
        let info = match decode::<Response>(&reply)? {
            Response::Hello(info) if info.protocol_version == PROTOCOL_VERSION => info,
            Response::Hello(info) => {
                return Err(Error::Connection(format!(
                    "device speaks protocol v{}, this host speaks v{PROTOCOL_VERSION}",
                    info.protocol_version
                )))
            }
            Response::Error(err) => return Err(Error::from_device(Phase::Handshake, err)),
            other => return Err(unexpected("hello", &other)),
        };

        let inner = Arc::new(SessionInner {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            transport: Mutex::new(None),
            closed: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            info,
            params,
            stats: Mutex::new(SessionStats {
                round_trips: 1,
                bytes_sent: hello.len() as u64,
                bytes_received: reply.len() as u64,
            }),
            staged: Mutex::new(HashMap::new()),
        });
        tracing::info!(
            session = inner.id,
            peer = %transport.describe(),
            device = %inner.info.kind,
            default_capacity = inner.info.default_capacity,
            scratch_capacity = inner.info.scratch_capacity,
            "session_opened"
        );
        *inner.transport.lock() = Some(transport);
        Ok(Self { inner })
    }

    /// Load an artifact and wrap it in the executor its kind calls for.
    #[instrument(skip_all, fields(session = self.inner.id, artifact = %artifact.id(), kind = %artifact.kind()))]
    pub fn stage(&self, artifact: &Artifact) -> Result<Executor> {
        let staged = self.inner.stage(artifact)?;
        Executor::new(staged)
    }

    /// Reserve a buffer. Device locations fail fast with `OutOfMemory` when
    /// their pool is exhausted; scratch never falls back to default memory.
    pub fn allocate(&self, shape: &[usize], dtype: DType, location: Location) -> Result<TensorBuffer> {
        self.inner.allocate(shape, dtype, location)
    }

    /// Copy a host tensor into device default memory.
    pub fn copy_in(&self, tensor: &HostTensor) -> Result<TensorBuffer> {
        self.inner.copy_in_to(tensor, Location::DeviceDefault)
    }

    pub fn copy_in_to(&self, tensor: &HostTensor, location: Location) -> Result<TensorBuffer> {
        self.inner.copy_in_to(tensor, location)
    }

    pub fn copy_out(&self, buffer: &TensorBuffer) -> Result<HostTensor> {
        self.inner.ensure_open()?;
        if !buffer.belongs_to(&self.inner) {
            return Err(Error::Transfer(format!(
                "buffer belongs to another session than session {}",
                self.inner.id
            )));
        }
        buffer.to_host()
    }

    /// Say goodbye and drop the transport. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.inner.params
    }

    pub fn stats(&self) -> SessionStats {
        *self.inner.stats.lock()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("device", &self.inner.info.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}
