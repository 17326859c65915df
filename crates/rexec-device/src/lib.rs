//! Simulated remote accelerator.
//!
//! This crate is the device side of the rexec harness:
//!
//! - **Memory**: two capacity-bounded pools, `global` and `global.vtcm` scratch
//! - **Kernels**: an operator library exported per device kind (`accel.*`, `cpu.*`)
//! - **Modules**: graph, AOT and VM images that are staged and then run
//! - **Protocol**: length-prefixed bincode frames spoken over any byte stream
//!
//! # Architecture
//!
//! ```text
//! host session ──frames──▶ DeviceServer ──▶ Device
//!                                            ├── MemoryManager
//!                                            ├── KernelRegistry
//!                                            └── staged modules ──▶ engine::{graph, aot, vm}
//! ```
//!
//! # Usage
//!
//! ```rust
//! use rexec_device::{Device, DeviceConfig, MemoryScope};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut device = Device::new(DeviceConfig::accelerator("v68"))?;
//! let buffer = device.allocate(16, MemoryScope::Default)?;
//! device.write(buffer, &[0u8; 16])?;
//! assert_eq!(device.read(buffer)?.len(), 16);
//! device.free(buffer)?;
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod memory;
pub mod module;
pub mod protocol;
pub mod server;
pub mod types;

pub use device::{Device, DeviceConfig};
pub use error::{DeviceError, DeviceFault, Result};
pub use kernels::{decode, Element, KernelAttrs, KernelRegistry};
pub use module::{
    AotModule, AotStep, Constant, GraphInput, GraphModule, GraphNode, ModuleBody, ModuleImage, ShapeExpr, Slot,
    VmFunction, VmInstruction, VmModule, IMAGE_FORMAT_VERSION,
};
pub use protocol::{ProtocolError, Request, Response, MAX_FRAME_BYTES, PROTOCOL_VERSION};
pub use server::{DeviceServer, ServerError};
pub use types::{
    byte_len, checked_byte_len, checked_num_elements, num_elements, BufferHandle, DType, DeviceInfo, DeviceKind, MemoryScope, ModuleId, TensorArg, TensorSpec,
};
