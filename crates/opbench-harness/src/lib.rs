//! Runtime harness for dynamically compiled operators.
//!
//! Loads an operator entry point from a shared library, stages typed host
//! tensors into device memory, invokes the operator a number of times on a
//! single stream while timing each call, and copies outputs back when the
//! operator reports success.

pub mod abi;
pub mod cuda_driver;
pub mod device;
pub mod dtype;
pub mod error;
pub mod ffi;
pub mod harness;
pub mod host;
pub mod marshal;
pub mod profile;
pub mod resolve;
pub mod stats;

pub use abi::{InputView, KernelFn, KernelStatus, OutputView};
pub use device::{probe_devices, CudaDevice, CudaDeviceInfo, Device, DeviceEvent, DevicePtr, HostDevice, StreamHandle};
pub use dtype::{Element, ElementType};
pub use error::{DeviceError, HarnessError};
pub use harness::{Harness, ProfileReport, ProfileRequest};
pub use host::{HostTensor, HostTensorMut, OwnedTensor, RawTensor, TensorRole};
pub use marshal::{DeviceTensor, StagedTensors};
pub use opbench_core::StatusPolicy;
pub use profile::{profile, ProfileOutcome};
pub use resolve::{DynamicLoader, Kernel, KernelLoader, SymbolTable};
pub use stats::TimingSummary;
