//! Wire protocol between a host session and a device.
//!
//! Every message is one frame: a little-endian `u32` payload length followed
//! by a bincode-encoded [`Request`] or [`Response`]. A connection is strictly
//! request/response; the device never speaks first.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::DeviceError;
use crate::types::{BufferHandle, DeviceInfo, MemoryScope, ModuleId, TensorArg};

/// Bumped on any incompatible change to [`Request`] or [`Response`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame either side accepts.
pub const MAX_FRAME_BYTES: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Hello { version: u32 },
    Allocate { bytes: usize, scope: MemoryScope },
    Free { handle: BufferHandle },
    Write { handle: BufferHandle, data: Vec<u8> },
    Read { handle: BufferHandle },
    Stage { payload: Vec<u8> },
    Unload { module: ModuleId },
    Run { module: ModuleId, entry: String, args: Vec<TensorArg> },
    Goodbye,
}

impl Request {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::Allocate { .. } => "allocate",
            Request::Free { .. } => "free",
            Request::Write { .. } => "write",
            Request::Read { .. } => "read",
            Request::Stage { .. } => "stage",
            Request::Unload { .. } => "unload",
            Request::Run { .. } => "run",
            Request::Goodbye => "goodbye",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Hello(DeviceInfo),
    Allocated(BufferHandle),
    Data(Vec<u8>),
    Staged(ModuleId),
    Outputs(Vec<TensorArg>),
    Ack,
    Error(DeviceError),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    FrameTooLarge(usize),

    #[error("peer speaks protocol v{peer}, expected v{PROTOCOL_VERSION}")]
    VersionMismatch { peer: u32 },
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let bytes = bincode::serialize(message)?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(bytes.len()));
    }
    Ok(bytes)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), ProtocolError> {
    write_raw_frame(writer, &encode(message)?)
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream before the
/// length prefix.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, ProtocolError> {
    match read_raw_frame(reader)? {
        Some(payload) => decode(&payload).map(Some),
        None => Ok(None),
    }
}

/// Write an already encoded payload behind its length prefix.
pub fn write_raw_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_raw_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}
