use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Device, DevicePtr, StreamHandle};
use crate::cuda_driver::{cuda_error_name, CUDA_ERROR_INVALID_VALUE, CUDA_ERROR_OUT_OF_MEMORY};
use crate::error::DeviceError;

/// Byte pattern fresh allocations are filled with, so a kernel that fails
/// to populate an output is visible instead of reading back zeros.
pub const UNINIT_FILL: u8 = 0xA5;

/// One call made against a [`HostDevice`], in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    SynchronizeDevice,
    CreateStream,
    DestroyStream,
    Synchronize,
    Alloc { ptr: DevicePtr, bytes: usize },
    Free { ptr: DevicePtr },
    CopyToDevice { ptr: DevicePtr, bytes: usize },
    CopyToHost { ptr: DevicePtr, bytes: usize },
}

/// Device backed by host heap memory. Streams execute eagerly, so every
/// queued copy has completed by the time the call returns.
pub struct HostDevice {
    /// Maps base address -> allocation length
    allocations: DashMap<DevicePtr, usize>,
    /// Every call in issue order
    events: Mutex<Vec<DeviceEvent>>,
    alloc_count: AtomicUsize,
    free_count: AtomicUsize,
    bytes_allocated: AtomicUsize,
    /// 1-based allocation number that reports out-of-memory
    fail_alloc_at: Option<usize>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self {
            allocations: DashMap::new(),
            events: Mutex::new(Vec::new()),
            alloc_count: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
            bytes_allocated: AtomicUsize::new(0),
            fail_alloc_at: None,
        }
    }

    /// Make the `nth` allocation (1-based) fail with out-of-memory.
    pub fn with_alloc_failure(mut self, nth: usize) -> Self {
        self.fail_alloc_at = Some(nth);
        self
    }

    /// Total successful allocations so far.
    pub fn allocations(&self) -> usize {
        self.alloc_count.load(Ordering::Relaxed)
    }

    /// Total frees so far.
    pub fn frees(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.allocations().saturating_sub(self.frees())
    }

    /// Sum of the sizes of all successful allocations.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }

    fn record(&self, event: DeviceEvent) {
        self.events.lock().push(event);
    }

    fn err(op: &'static str, code: i32) -> DeviceError {
        DeviceError {
            op,
            code,
            name: cuda_error_name(code),
        }
    }

    /// Check that `[ptr, ptr + bytes)` lies inside the allocation at `ptr`.
    fn check_range(&self, op: &'static str, ptr: DevicePtr, bytes: usize) -> Result<(), DeviceError> {
        if bytes == 0 {
            return Ok(());
        }
        match self.allocations.get(&ptr) {
            Some(len) if *len >= bytes => Ok(()),
            _ => Err(Self::err(op, CUDA_ERROR_INVALID_VALUE)),
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        let leaked: Vec<(DevicePtr, usize)> =
            self.allocations.iter().map(|e| (*e.key(), *e.value())).collect();
        for (ptr, len) in leaked {
            warn!("host device dropped with live allocation {:#x} ({} bytes)", ptr, len);
            // SAFETY: every entry came from Box::into_raw in alloc with this length.
            unsafe { release_block(ptr, len) };
        }
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn synchronize_device(&self) -> Result<(), DeviceError> {
        self.record(DeviceEvent::SynchronizeDevice);
        Ok(())
    }

    fn create_stream(&self) -> Result<StreamHandle, DeviceError> {
        self.record(DeviceEvent::CreateStream);
        Ok(StreamHandle::DEFAULT)
    }

    fn destroy_stream(&self, _stream: StreamHandle) -> Result<(), DeviceError> {
        self.record(DeviceEvent::DestroyStream);
        Ok(())
    }

    fn synchronize(&self, _stream: StreamHandle) -> Result<(), DeviceError> {
        self.record(DeviceEvent::Synchronize);
        Ok(())
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr, DeviceError> {
        let attempt = self.alloc_count.load(Ordering::Relaxed) + 1;
        if self.fail_alloc_at == Some(attempt) {
            debug!("host alloc #{} failing by request", attempt);
            return Err(Self::err("alloc", CUDA_ERROR_OUT_OF_MEMORY));
        }

        let ptr = if bytes == 0 {
            0
        } else {
            let block = vec![UNINIT_FILL; bytes].into_boxed_slice();
            let ptr = Box::into_raw(block) as *mut u8 as usize as DevicePtr;
            self.allocations.insert(ptr, bytes);
            ptr
        };
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
        self.record(DeviceEvent::Alloc { ptr, bytes });
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        if ptr != 0 {
            let (_, len) = self
                .allocations
                .remove(&ptr)
                .ok_or_else(|| Self::err("free", CUDA_ERROR_INVALID_VALUE))?;
            // SAFETY: the entry came from Box::into_raw in alloc with this length.
            unsafe { release_block(ptr, len) };
        }
        self.free_count.fetch_add(1, Ordering::Relaxed);
        self.record(DeviceEvent::Free { ptr });
        Ok(())
    }

    unsafe fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        _stream: StreamHandle,
    ) -> Result<(), DeviceError> {
        self.check_range("copy_to_device", dst, src.len())?;
        if !src.is_empty() {
            // SAFETY: range checked against a live allocation above.
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), dst as usize as *mut u8, src.len())
            };
        }
        self.record(DeviceEvent::CopyToDevice {
            ptr: dst,
            bytes: src.len(),
        });
        Ok(())
    }

    unsafe fn copy_to_host_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        _stream: StreamHandle,
    ) -> Result<(), DeviceError> {
        self.check_range("copy_to_host", src, dst.len())?;
        if !dst.is_empty() {
            // SAFETY: range checked against a live allocation above.
            unsafe {
                std::ptr::copy_nonoverlapping(src as usize as *const u8, dst.as_mut_ptr(), dst.len())
            };
        }
        self.record(DeviceEvent::CopyToHost {
            ptr: src,
            bytes: dst.len(),
        });
        Ok(())
    }
}

/// # Safety
///
/// `ptr`/`len` must describe a block produced by `Box::<[u8]>::into_raw`
/// that has not been released yet.
unsafe fn release_block(ptr: DevicePtr, len: usize) {
    let slice = std::ptr::slice_from_raw_parts_mut(ptr as usize as *mut u8, len);
    drop(unsafe { Box::from_raw(slice) });
}
