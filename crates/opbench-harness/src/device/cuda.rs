use std::sync::Arc;

use opbench_core::DeviceConfig;
use serde::Serialize;
use tracing::{debug, error, info};

use super::{Device, DevicePtr, StreamHandle};
use crate::cuda_driver::{self, CUdevice, CUresult, CudaDriver, CUDA_SUCCESS};
use crate::error::{DeviceError, HarnessError};

/// A GPU driven through the CUDA driver API, with its primary context
/// current on the thread that opened it.
///
/// All harness calls must be made from that thread.
pub struct CudaDevice {
    driver: Arc<CudaDriver>,
    ordinal: i32,
    device: CUdevice,
    name: String,
}

/// Summary of one visible GPU.
#[derive(Debug, Clone, Serialize)]
pub struct CudaDeviceInfo {
    pub ordinal: i32,
    pub name: String,
    pub total_mem: usize,
}

fn check(op: &'static str, res: CUresult) -> Result<(), DeviceError> {
    if res == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(DeviceError {
            op,
            code: res,
            name: cuda_driver::cuda_error_name(res),
        })
    }
}

fn map_err(op: &'static str) -> impl Fn(CUresult) -> DeviceError {
    move |res| DeviceError {
        op,
        code: res,
        name: cuda_driver::cuda_error_name(res),
    }
}

/// Load the driver named in `config` (or the platform default).
pub fn load_driver(config: &DeviceConfig) -> Result<Arc<CudaDriver>, HarnessError> {
    let loaded = match config.driver_libraries {
        Some(ref names) => CudaDriver::load_from(names),
        None => CudaDriver::load(),
    };
    loaded.map_err(|e| HarnessError::DriverUnavailable(e.to_string()))
}

/// Initialize the driver and list every visible device.
pub fn probe_devices(driver: &CudaDriver) -> Result<Vec<CudaDeviceInfo>, DeviceError> {
    check("cuInit", driver.init(0))?;
    let count = driver.device_get_count().map_err(map_err("cuDeviceGetCount"))?;
    let mut infos = Vec::with_capacity(count.max(0) as usize);
    for ordinal in 0..count {
        let device = driver.device_get(ordinal).map_err(map_err("cuDeviceGet"))?;
        infos.push(CudaDeviceInfo {
            ordinal,
            name: driver.device_get_name(device).map_err(map_err("cuDeviceGetName"))?,
            total_mem: driver.device_total_mem(device).map_err(map_err("cuDeviceTotalMem"))?,
        });
    }
    Ok(infos)
}

impl CudaDevice {
    /// Load the driver per `config` and open the configured device.
    pub fn open(config: &DeviceConfig) -> Result<Self, HarnessError> {
        let driver = load_driver(config)?;
        Self::with_driver(driver, config.ordinal)
    }

    /// Open device `ordinal` on an already loaded driver and make its
    /// primary context current.
    pub fn with_driver(driver: Arc<CudaDriver>, ordinal: i32) -> Result<Self, HarnessError> {
        check("cuInit", driver.init(0))?;
        let device = driver.device_get(ordinal).map_err(map_err("cuDeviceGet"))?;
        let name = driver
            .device_get_name(device)
            .map_err(map_err("cuDeviceGetName"))?;
        let context = driver
            .device_primary_ctx_retain(device)
            .map_err(map_err("cuDevicePrimaryCtxRetain"))?;
        if let Err(e) = check("cuCtxSetCurrent", driver.ctx_set_current(context)) {
            driver.device_primary_ctx_release(device);
            return Err(e.into());
        }
        info!("opened CUDA device {} ({})", ordinal, name);
        Ok(Self {
            driver,
            ordinal,
            device,
            name,
        })
    }

    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    pub fn device_name(&self) -> &str {
        &self.name
    }
}

impl Drop for CudaDevice {
    fn drop(&mut self) {
        let res = self.driver.device_primary_ctx_release(self.device);
        if res != CUDA_SUCCESS {
            error!(
                "cuDevicePrimaryCtxRelease failed: {} ({})",
                cuda_driver::cuda_error_name(res),
                res
            );
        }
    }
}

impl Device for CudaDevice {
    fn name(&self) -> &str {
        "cuda"
    }

    fn synchronize_device(&self) -> Result<(), DeviceError> {
        check("cuCtxSynchronize", self.driver.ctx_synchronize())
    }

    fn create_stream(&self) -> Result<StreamHandle, DeviceError> {
        let stream = self
            .driver
            .stream_create(0)
            .map_err(map_err("cuStreamCreate"))?;
        debug!("created stream {:?}", stream);
        Ok(StreamHandle(stream))
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<(), DeviceError> {
        check("cuStreamDestroy", self.driver.stream_destroy(stream.as_raw()))
    }

    fn synchronize(&self, stream: StreamHandle) -> Result<(), DeviceError> {
        check("cuStreamSynchronize", self.driver.stream_synchronize(stream.as_raw()))
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr, DeviceError> {
        if bytes == 0 {
            return Ok(0);
        }
        self.driver.mem_alloc(bytes).map_err(map_err("cuMemAlloc"))
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        if ptr == 0 {
            return Ok(());
        }
        check("cuMemFree", self.driver.mem_free(ptr))
    }

    unsafe fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: StreamHandle,
    ) -> Result<(), DeviceError> {
        if src.is_empty() {
            return Ok(());
        }
        let res = unsafe { self.driver.memcpy_htod_async(dst, src, stream.as_raw()) };
        check("cuMemcpyHtoDAsync", res)
    }

    unsafe fn copy_to_host_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: StreamHandle,
    ) -> Result<(), DeviceError> {
        if dst.is_empty() {
            return Ok(());
        }
        let res = unsafe { self.driver.memcpy_dtoh_async(dst, src, stream.as_raw()) };
        check("cuMemcpyDtoHAsync", res)
    }
}
