//! Host side of the rexec remote execution harness.
//!
//! A [`Session`] connects to one device (in-process loopback or TCP),
//! moves tensors across as [`TensorBuffer`]s and stages compiled
//! [`Artifact`]s. Each staged artifact is driven through an [`Executor`]
//! of its kind: graph, ahead-of-time or VM. The [`Comparator`] runs the
//! same inputs through two executors and checks their outputs against a
//! tolerance, which is how device results are validated against a host
//! reference.
//!
//! # Usage
//!
//! ```rust
//! use rexec_core::compiler::{build, BuildOptions, ComputationBuilder};
//! use rexec_core::{compare, ConnectionParams, DType, ExecutorKind, HostTensor, Session, TargetDescriptor};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut b = ComputationBuilder::new("relu");
//! let x = b.static_input("x", DType::F32, &[4]);
//! let y = b.relu(&x);
//! b.output(&y);
//! let computation = b.build()?;
//!
//! let accel = TargetDescriptor::accelerator("v68");
//! let host = TargetDescriptor::host_cpu();
//! let options = BuildOptions::new(ExecutorKind::Graph);
//!
//! let remote = Session::open(ConnectionParams::loopback("v68"))?;
//! let local = Session::open(ConnectionParams::loopback_host())?;
//! let mut remote_exec = remote.stage(&build(&computation, &accel, &options)?)?;
//! let mut local_exec = local.stage(&build(&computation, &host, &options)?)?;
//!
//! let input = HostTensor::from_slice(vec![4], &[-1.0f32, 0.5, 2.0, -3.0])?;
//! let result = compare(&mut remote_exec, &mut local_exec, &[input], 1e-5, 1e-8)?;
//! assert!(result.passed(), "{result}");
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod buffer;
pub mod compare;
pub mod compiler;
pub mod error;
pub mod executor;
pub mod session;
pub mod target;
pub mod tensor;

pub use artifact::{Artifact, ArtifactId, Dim, EntryPoint, ExecutorKind, TensorSignature, MAIN_ENTRY};
pub use buffer::{Location, TensorBuffer};
pub use compare::{allclose, compare, Comparator, ComparisonResult, OutputComparison, Tolerance};
pub use error::{Error, Result};
pub use executor::{AotExecutor, Executor, GraphExecutor, InputRef, VmExecutor};
pub use rexec_device::{DType, DeviceConfig, DeviceInfo, DeviceKind};
pub use session::{ConnectionParams, Endpoint, Session, SessionStats};
pub use target::TargetDescriptor;
pub use tensor::HostTensor;
