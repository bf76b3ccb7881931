//! Device buffer lifecycle for one harness invocation.
//!
//! [`StagedTensors`] owns every device buffer it allocates. Buffers are
//! tracked the moment the allocation succeeds, so a failure halfway through
//! staging still frees everything allocated so far when the guard drops.

use std::marker::PhantomData;

use tracing::{debug, error};

use crate::abi::{InputView, OutputView};
use crate::device::{Device, DevicePtr, StreamHandle};
use crate::dtype::ElementType;
use crate::error::{DeviceError, HarnessError};
use crate::host::{HostTensor, HostTensorMut, TensorRole};

/// A device allocation owned by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTensor {
    ptr: DevicePtr,
    dtype: ElementType,
    len: usize,
    bytes: usize,
    role: TensorRole,
}

impl DeviceTensor {
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
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

    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    pub fn role(&self) -> TensorRole {
        self.role
    }
}

/// Scoped owner of the staged device buffers.
///
/// `'h` is the lifetime of the host inputs: their bytes may still be in
/// flight on the stream until the guard synchronizes, so they must outlive
/// it.
pub struct StagedTensors<'d, 'h, D: Device + ?Sized> {
    device: &'d D,
    stream: StreamHandle,
    inputs: Vec<DeviceTensor>,
    outputs: Vec<DeviceTensor>,
    allocations: usize,
    frees: usize,
    _host: PhantomData<&'h [u8]>,
}

impl<'d, 'h, D: Device + ?Sized> StagedTensors<'d, 'h, D> {
    pub fn new(device: &'d D, stream: StreamHandle) -> Self {
        Self {
            device,
            stream,
            inputs: Vec::new(),
            outputs: Vec::new(),
            allocations: 0,
            frees: 0,
            _host: PhantomData,
        }
    }

    fn allocate(
        &mut self,
        role: TensorRole,
        dtype: ElementType,
        len: usize,
        bytes: usize,
    ) -> Result<DeviceTensor, DeviceError> {
        let ptr = self.device.alloc(bytes)?;
        self.allocations += 1;
        let tensor = DeviceTensor {
            ptr,
            dtype,
            len,
            bytes,
            role,
        };
        match role {
            TensorRole::Input => self.inputs.push(tensor),
            TensorRole::Output => self.outputs.push(tensor),
        }
        debug!("allocated {} {} x {} ({} bytes) at {:#x}", role, len, dtype, bytes, ptr);
        Ok(tensor)
    }

    /// Allocate a buffer per input and queue its host to device copy.
    pub fn stage_inputs(&mut self, hosts: &[HostTensor<'h>]) -> Result<(), HarnessError> {
        for host in hosts {
            let tensor = self.allocate(TensorRole::Input, host.dtype(), host.len(), host.bytes().len())?;
            // SAFETY: the buffer was just allocated with exactly this size, and
            // the host bytes live for 'h, past the guard's final synchronize.
            unsafe {
                self.device
                    .copy_to_device_async(tensor.ptr, host.bytes(), self.stream)?;
            }
        }
        Ok(())
    }

    /// Allocate an uninitialized buffer per output.
    pub fn stage_outputs(&mut self, hosts: &[HostTensorMut<'_>]) -> Result<(), HarnessError> {
        for host in hosts {
            self.allocate(TensorRole::Output, host.dtype(), host.len(), host.bytes().len())?;
        }
        Ok(())
    }

    pub fn inputs(&self) -> &[DeviceTensor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[DeviceTensor] {
        &self.outputs
    }

    pub fn input_views(&self) -> Vec<InputView> {
        self.inputs
            .iter()
            .map(|t| InputView::new(t.ptr, t.dtype, t.len))
            .collect()
    }

    pub fn output_views(&self) -> Vec<OutputView> {
        self.outputs
            .iter()
            .map(|t| OutputView::new(t.ptr, t.dtype, t.len))
            .collect()
    }

    /// Copy every output back into the caller's buffers and wait for the
    /// copies to land.
    pub fn retrieve_outputs(&mut self, hosts: &mut [HostTensorMut<'_>]) -> Result<(), HarnessError> {
        if hosts.len() != self.outputs.len() {
            return Err(HarnessError::OutputMismatch {
                index: hosts.len().min(self.outputs.len()),
            });
        }
        for (index, (host, tensor)) in hosts.iter().zip(&self.outputs).enumerate() {
            if host.dtype() != tensor.dtype || host.bytes().len() != tensor.bytes {
                return Err(HarnessError::OutputMismatch { index });
            }
        }
        for (host, tensor) in hosts.iter_mut().zip(&self.outputs) {
            // SAFETY: sizes checked above; the stream is synchronized below
            // before the host buffers are handed back.
            unsafe {
                self.device
                    .copy_to_host_async(host.bytes_mut(), tensor.ptr, self.stream)?;
            }
        }
        self.device.synchronize(self.stream)?;
        Ok(())
    }

    /// Wait for the stream, then free every buffer still owned. Returns the
    /// number of frees performed; a second call frees nothing.
    ///
    /// Every buffer is attempted even if an earlier free fails; the first
    /// failure is returned.
    pub fn release(&mut self) -> Result<usize, DeviceError> {
        if self.inputs.is_empty() && self.outputs.is_empty() {
            return Ok(0);
        }
        let synced = self.device.synchronize(self.stream);
        let mut first_err = synced.err();
        let mut freed = 0;
        for tensor in self.inputs.drain(..).chain(self.outputs.drain(..)) {
            match self.device.free(tensor.ptr) {
                Ok(()) => freed += 1,
                Err(e) => {
                    error!("failed to free {} buffer {:#x}: {}", tensor.role, tensor.ptr, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        self.frees += freed;
        debug!("released {} device buffers", freed);
        match first_err {
            Some(e) => Err(e),
            None => Ok(freed),
        }
    }

    /// Device allocations made through this guard.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Device frees made through this guard.
    pub fn frees(&self) -> usize {
        self.frees
    }

    pub fn device(&self) -> &'d D {
        self.device
    }

    pub fn stream(&self) -> StreamHandle {
        self.stream
    }
}

impl<D: Device + ?Sized> Drop for StagedTensors<'_, '_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!("device buffer cleanup failed: {}", e);
        }
    }
}
