//! The calling convention between the harness and a generated operator.
//!
//! An operator library exports one symbol of type [`KernelFn`]. It receives
//! the staged device buffers as two arrays of views, the stream to launch
//! on, and an opaque threads-per-block hint, and returns a 16-bit status
//! where 0 means success.

use std::ffi::c_void;
use std::fmt;

use serde::Serialize;

use crate::device::DevicePtr;
use crate::dtype::{Element, ElementType};

/// Signature every operator entry point must have.
pub type KernelFn = unsafe extern "C" fn(
    inputs: *const InputView,
    num_inputs: usize,
    outputs: *const OutputView,
    num_outputs: usize,
    stream: *mut c_void,
    threads_per_block: u16,
) -> u16;

/// Read-only device tensor handed to a kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InputView {
    data: *const c_void,
    dtype: ElementType,
    len: usize,
}

/// Writable device tensor handed to a kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OutputView {
    data: *mut c_void,
    dtype: ElementType,
    len: usize,
}

impl InputView {
    pub fn new(ptr: DevicePtr, dtype: ElementType, len: usize) -> Self {
        Self {
            data: ptr as usize as *const c_void,
            dtype,
            len,
        }
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const c_void {
        self.data
    }

    /// Typed pointer, or `None` if `T` is not the view's element type.
    pub fn typed<T: Element>(&self) -> Option<*const T> {
        (T::TYPE == self.dtype).then_some(self.data as *const T)
    }
}

impl OutputView {
    pub fn new(ptr: DevicePtr, dtype: ElementType, len: usize) -> Self {
        Self {
            data: ptr as usize as *mut c_void,
            dtype,
            len,
        }
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_ptr(&self) -> *mut c_void {
        self.data
    }

    pub fn typed<T: Element>(&self) -> Option<*mut T> {
        (T::TYPE == self.dtype).then_some(self.data as *mut T)
    }
}

/// Borrow the view array a kernel received.
///
/// # Safety
///
/// `ptr` must be null (only with `len == 0`) or point to `len` views that
/// outlive `'a`.
pub unsafe fn views<'a, V>(ptr: *const V, len: usize) -> &'a [V] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        // SAFETY: forwarded from the caller.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }
}

/// Status word returned by a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct KernelStatus(pub u16);

impl KernelStatus {
    pub const SUCCESS: KernelStatus = KernelStatus(0);

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    pub fn code(self) -> u16 {
        self.0
    }
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
