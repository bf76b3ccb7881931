//! Device memory and stream primitives the harness is written against.
//!
//! [`CudaDevice`] drives a real GPU through the driver API; [`HostDevice`]
//! keeps "device" buffers in host memory, which is what CPU-compiled
//! operator libraries expect and what makes the buffer lifecycle
//! observable without a GPU.

mod cuda;
mod host;

use std::ffi::c_void;

pub use cuda::{load_driver, probe_devices, CudaDevice, CudaDeviceInfo};
pub use host::{DeviceEvent, HostDevice, UNINIT_FILL};

use crate::error::DeviceError;

/// Address of a device allocation. Zero-byte allocations are represented
/// by address 0 and never reach the underlying runtime.
pub type DevicePtr = u64;

/// Execution queue handle. The null handle is the runtime's default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle(pub *mut c_void);

impl StreamHandle {
    pub const DEFAULT: StreamHandle = StreamHandle(std::ptr::null_mut());

    pub fn as_raw(self) -> *mut c_void {
        self.0
    }
}

pub trait Device {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Block until all outstanding work on every stream has finished.
    fn synchronize_device(&self) -> Result<(), DeviceError>;

    fn create_stream(&self) -> Result<StreamHandle, DeviceError>;

    fn destroy_stream(&self, stream: StreamHandle) -> Result<(), DeviceError>;

    /// Block until all work queued on `stream` has finished.
    fn synchronize(&self, stream: StreamHandle) -> Result<(), DeviceError>;

    fn alloc(&self, bytes: usize) -> Result<DevicePtr, DeviceError>;

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError>;

    /// Queue a host to device copy on `stream`.
    ///
    /// # Safety
    ///
    /// `dst` must be a live allocation of at least `src.len()` bytes and
    /// `src` must stay alive until `stream` has been synchronized.
    unsafe fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: StreamHandle,
    ) -> Result<(), DeviceError>;

    /// Queue a device to host copy on `stream`.
    ///
    /// # Safety
    ///
    /// `src` must be a live allocation of at least `dst.len()` bytes and
    /// `dst` must not be read until `stream` has been synchronized.
    unsafe fn copy_to_host_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: StreamHandle,
    ) -> Result<(), DeviceError>;
}

impl<D: Device + ?Sized> Device for &D {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn synchronize_device(&self) -> Result<(), DeviceError> {
        (**self).synchronize_device()
    }

    fn create_stream(&self) -> Result<StreamHandle, DeviceError> {
        (**self).create_stream()
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<(), DeviceError> {
        (**self).destroy_stream(stream)
    }

    fn synchronize(&self, stream: StreamHandle) -> Result<(), DeviceError> {
        (**self).synchronize(stream)
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr, DeviceError> {
        (**self).alloc(bytes)
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        (**self).free(ptr)
    }

    unsafe fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: StreamHandle,
    ) -> Result<(), DeviceError> {
        unsafe { (**self).copy_to_device_async(dst, src, stream) }
    }

    unsafe fn copy_to_host_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: StreamHandle,
    ) -> Result<(), DeviceError> {
        unsafe { (**self).copy_to_host_async(dst, src, stream) }
    }
}
