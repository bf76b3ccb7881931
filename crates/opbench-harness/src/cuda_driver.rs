//! Dynamic loading of the CUDA driver library.
//!
//! Uses `libloading` to load `nvcuda.dll` (Windows) or `libcuda.so.1` (Linux)
//! and wraps the handful of driver API entry points the harness drives:
//! initialization, device queries, the primary context, linear memory,
//! asynchronous copies and streams.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::sync::Arc;

use libloading::{Library, Symbol};
use tracing::{debug, info};

/// CUDA result type (CUresult).
pub type CUresult = c_int;

/// CUDA device ordinal handle.
pub type CUdevice = c_int;

/// Opaque CUDA types (represented as pointers).
pub type CUcontext = *mut c_void;
pub type CUdeviceptr = u64;
pub type CUstream = *mut c_void;

pub const CUDA_SUCCESS: CUresult = 0;
pub const CUDA_ERROR_INVALID_VALUE: CUresult = 1;
pub const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;

#[cfg(target_os = "windows")]
const DEFAULT_LIBRARIES: &[&str] = &["nvcuda.dll"];
#[cfg(target_os = "linux")]
const DEFAULT_LIBRARIES: &[&str] = &["libcuda.so.1", "libcuda.so"];
#[cfg(target_os = "macos")]
const DEFAULT_LIBRARIES: &[&str] = &["libcuda.dylib"];
#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
const DEFAULT_LIBRARIES: &[&str] = &[];

type FnCuInit = unsafe extern "C" fn(flags: c_uint) -> CUresult;
type FnCuDriverGetVersion = unsafe extern "C" fn(version: *mut c_int) -> CUresult;
type FnCuDeviceGetCount = unsafe extern "C" fn(count: *mut c_int) -> CUresult;
type FnCuDeviceGet = unsafe extern "C" fn(device: *mut CUdevice, ordinal: c_int) -> CUresult;
type FnCuDeviceGetName =
    unsafe extern "C" fn(name: *mut c_char, len: c_int, dev: CUdevice) -> CUresult;
type FnCuDeviceTotalMem = unsafe extern "C" fn(bytes: *mut usize, dev: CUdevice) -> CUresult;

// Primary context
type FnCuDevicePrimaryCtxRetain =
    unsafe extern "C" fn(pctx: *mut CUcontext, dev: CUdevice) -> CUresult;
type FnCuDevicePrimaryCtxRelease = unsafe extern "C" fn(dev: CUdevice) -> CUresult;
type FnCuCtxSetCurrent = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type FnCuCtxSynchronize = unsafe extern "C" fn() -> CUresult;

// Memory management
type FnCuMemAlloc = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type FnCuMemFree = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type FnCuMemcpyHtoD =
    unsafe extern "C" fn(dst: CUdeviceptr, src: *const c_void, byte_count: usize) -> CUresult;
type FnCuMemcpyDtoH =
    unsafe extern "C" fn(dst: *mut c_void, src: CUdeviceptr, byte_count: usize) -> CUresult;
type FnCuMemcpyHtoDAsync = unsafe extern "C" fn(
    dst: CUdeviceptr,
    src: *const c_void,
    byte_count: usize,
    hstream: CUstream,
) -> CUresult;
type FnCuMemcpyDtoHAsync = unsafe extern "C" fn(
    dst: *mut c_void,
    src: CUdeviceptr,
    byte_count: usize,
    hstream: CUstream,
) -> CUresult;

// Stream management
type FnCuStreamCreate = unsafe extern "C" fn(phstream: *mut CUstream, flags: c_uint) -> CUresult;
type FnCuStreamDestroy = unsafe extern "C" fn(hstream: CUstream) -> CUresult;
type FnCuStreamSynchronize = unsafe extern "C" fn(hstream: CUstream) -> CUresult;

/// Why the driver could not be bound.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("failed to load CUDA driver library: {0}")]
    LibraryUnavailable(String),

    #[error("failed to load {name}: {reason}")]
    MissingSymbol { name: String, reason: String },
}

/// Dynamically loaded CUDA driver library with function pointers.
pub struct CudaDriver {
    _lib: Library,
    loaded_from: String,
    // Initialization
    cu_init: FnCuInit,
    cu_driver_get_version: FnCuDriverGetVersion,
    // Device management
    cu_device_get_count: FnCuDeviceGetCount,
    cu_device_get: FnCuDeviceGet,
    cu_device_get_name: FnCuDeviceGetName,
    cu_device_total_mem: FnCuDeviceTotalMem,
    // Context
    cu_device_primary_ctx_retain: FnCuDevicePrimaryCtxRetain,
    cu_device_primary_ctx_release: FnCuDevicePrimaryCtxRelease,
    cu_ctx_set_current: FnCuCtxSetCurrent,
    cu_ctx_synchronize: FnCuCtxSynchronize,
    // Memory management
    cu_mem_alloc: FnCuMemAlloc,
    cu_mem_free: FnCuMemFree,
    cu_memcpy_htod: FnCuMemcpyHtoD,
    cu_memcpy_dtoh: FnCuMemcpyDtoH,
    cu_memcpy_htod_async: Option<FnCuMemcpyHtoDAsync>,
    cu_memcpy_dtoh_async: Option<FnCuMemcpyDtoHAsync>,
    // Stream management
    cu_stream_create: FnCuStreamCreate,
    cu_stream_destroy: FnCuStreamDestroy,
    cu_stream_synchronize: FnCuStreamSynchronize,
}

// SAFETY: The CUDA driver library handles are valid from any thread.
// The CUDA driver API itself handles thread safety via context management.
unsafe impl Send for CudaDriver {}
unsafe impl Sync for CudaDriver {}

impl CudaDriver {
    /// Load the CUDA driver from the platform's default library names.
    pub fn load() -> Result<Arc<Self>, DriverError> {
        Self::load_from(DEFAULT_LIBRARIES)
    }

    /// Load the CUDA driver, trying each library name in order, and resolve
    /// all function pointers.
    pub fn load_from<S: AsRef<str>>(lib_names: &[S]) -> Result<Arc<Self>, DriverError> {
        let (lib, loaded_from) = Self::load_library(lib_names)?;

        unsafe {
            let driver = Self {
                cu_init: Self::load_fn(&lib, "cuInit")?,
                cu_driver_get_version: Self::load_fn(&lib, "cuDriverGetVersion")?,
                cu_device_get_count: Self::load_fn(&lib, "cuDeviceGetCount")?,
                cu_device_get: Self::load_fn(&lib, "cuDeviceGet")?,
                cu_device_get_name: Self::load_fn(&lib, "cuDeviceGetName")?,
                cu_device_total_mem: Self::load_fn(&lib, "cuDeviceTotalMem_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuDeviceTotalMem"))?,
                cu_device_primary_ctx_retain: Self::load_fn(&lib, "cuDevicePrimaryCtxRetain")?,
                cu_device_primary_ctx_release: Self::load_fn(&lib, "cuDevicePrimaryCtxRelease_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuDevicePrimaryCtxRelease"))?,
                cu_ctx_set_current: Self::load_fn(&lib, "cuCtxSetCurrent")?,
                cu_ctx_synchronize: Self::load_fn(&lib, "cuCtxSynchronize")?,
                cu_mem_alloc: Self::load_fn(&lib, "cuMemAlloc_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemAlloc"))?,
                cu_mem_free: Self::load_fn(&lib, "cuMemFree_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemFree"))?,
                cu_memcpy_htod: Self::load_fn(&lib, "cuMemcpyHtoD_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyHtoD"))?,
                cu_memcpy_dtoh: Self::load_fn(&lib, "cuMemcpyDtoH_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyDtoH"))?,
                cu_memcpy_htod_async: Self::load_fn_opt::<FnCuMemcpyHtoDAsync>(&lib, "cuMemcpyHtoDAsync_v2")
                    .or(Self::load_fn_opt(&lib, "cuMemcpyHtoDAsync")),
                cu_memcpy_dtoh_async: Self::load_fn_opt::<FnCuMemcpyDtoHAsync>(&lib, "cuMemcpyDtoHAsync_v2")
                    .or(Self::load_fn_opt(&lib, "cuMemcpyDtoHAsync")),
                cu_stream_create: Self::load_fn(&lib, "cuStreamCreate")?,
                cu_stream_destroy: Self::load_fn(&lib, "cuStreamDestroy_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuStreamDestroy"))?,
                cu_stream_synchronize: Self::load_fn(&lib, "cuStreamSynchronize")?,
                _lib: lib,
                loaded_from,
            };

            info!("CUDA driver loaded successfully");
            Ok(Arc::new(driver))
        }
    }

    fn load_library<S: AsRef<str>>(lib_names: &[S]) -> Result<(Library, String), DriverError> {
        let mut last_err = String::from("no driver library names to try");
        for name in lib_names {
            let name = name.as_ref();
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    info!("loaded CUDA driver from: {}", name);
                    return Ok((lib, name.to_string()));
                }
                Err(e) => {
                    last_err = format!("{}: {}", name, e);
                    debug!("failed to load {}: {}", name, e);
                }
            }
        }

        Err(DriverError::LibraryUnavailable(last_err))
    }

    unsafe fn load_fn<F: Copy>(lib: &Library, name: &str) -> Result<F, DriverError> {
        let sym: Symbol<F> = unsafe { lib.get(name.as_bytes()) }.map_err(|e| {
            DriverError::MissingSymbol {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(*sym)
    }

    unsafe fn load_fn_opt<F: Copy>(lib: &Library, name: &str) -> Option<F> {
        unsafe { lib.get(name.as_bytes()) }.ok().map(|s: Symbol<F>| *s)
    }

    /// Library name the driver was loaded from.
    pub fn loaded_from(&self) -> &str {
        &self.loaded_from
    }

    // ── Initialization ────────────────────────────────────────────

    pub fn init(&self, flags: u32) -> CUresult {
        unsafe { (self.cu_init)(flags as c_uint) }
    }

    pub fn driver_get_version(&self) -> Result<i32, CUresult> {
        let mut version: c_int = 0;
        let res = unsafe { (self.cu_driver_get_version)(&mut version) };
        if res == CUDA_SUCCESS { Ok(version) } else { Err(res) }
    }

    // ── Device Management ─────────────────────────────────────────

    pub fn device_get_count(&self) -> Result<i32, CUresult> {
        let mut count: c_int = 0;
        let res = unsafe { (self.cu_device_get_count)(&mut count) };
        if res == CUDA_SUCCESS { Ok(count) } else { Err(res) }
    }

    pub fn device_get(&self, ordinal: i32) -> Result<CUdevice, CUresult> {
        let mut device: CUdevice = 0;
        let res = unsafe { (self.cu_device_get)(&mut device, ordinal) };
        if res == CUDA_SUCCESS { Ok(device) } else { Err(res) }
    }

    pub fn device_get_name(&self, device: CUdevice) -> Result<String, CUresult> {
        let mut buf = [0 as c_char; 256];
        let res = unsafe { (self.cu_device_get_name)(buf.as_mut_ptr(), buf.len() as c_int, device) };
        if res != CUDA_SUCCESS {
            return Err(res);
        }
        let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }

    pub fn device_total_mem(&self, device: CUdevice) -> Result<usize, CUresult> {
        let mut bytes: usize = 0;
        let res = unsafe { (self.cu_device_total_mem)(&mut bytes, device) };
        if res == CUDA_SUCCESS { Ok(bytes) } else { Err(res) }
    }

    // ── Context ───────────────────────────────────────────────────

    pub fn device_primary_ctx_retain(&self, device: CUdevice) -> Result<CUcontext, CUresult> {
        let mut ctx: CUcontext = std::ptr::null_mut();
        let res = unsafe { (self.cu_device_primary_ctx_retain)(&mut ctx, device) };
        if res == CUDA_SUCCESS { Ok(ctx) } else { Err(res) }
    }

    pub fn device_primary_ctx_release(&self, device: CUdevice) -> CUresult {
        unsafe { (self.cu_device_primary_ctx_release)(device) }
    }

    pub fn ctx_set_current(&self, ctx: CUcontext) -> CUresult {
        unsafe { (self.cu_ctx_set_current)(ctx) }
    }

    pub fn ctx_synchronize(&self) -> CUresult {
        unsafe { (self.cu_ctx_synchronize)() }
    }

    // ── Memory Management ─────────────────────────────────────────

    pub fn mem_alloc(&self, byte_size: usize) -> Result<CUdeviceptr, CUresult> {
        let mut dptr: CUdeviceptr = 0;
        let res = unsafe { (self.cu_mem_alloc)(&mut dptr, byte_size) };
        if res == CUDA_SUCCESS { Ok(dptr) } else { Err(res) }
    }

    pub fn mem_free(&self, dptr: CUdeviceptr) -> CUresult {
        unsafe { (self.cu_mem_free)(dptr) }
    }

    /// # Safety
    ///
    /// `dst` must be a device allocation of at least `src.len()` bytes, and
    /// `src` must stay alive until `stream` has been synchronized.
    pub unsafe fn memcpy_htod_async(&self, dst: CUdeviceptr, src: &[u8], stream: CUstream) -> CUresult {
        if let Some(func) = self.cu_memcpy_htod_async {
            unsafe { func(dst, src.as_ptr() as *const c_void, src.len(), stream) }
        } else {
            unsafe { (self.cu_memcpy_htod)(dst, src.as_ptr() as *const c_void, src.len()) }
        }
    }

    /// # Safety
    ///
    /// `src` must be a device allocation of at least `dst.len()` bytes, and
    /// `dst` must stay alive and unread until `stream` has been synchronized.
    pub unsafe fn memcpy_dtoh_async(&self, dst: &mut [u8], src: CUdeviceptr, stream: CUstream) -> CUresult {
        if let Some(func) = self.cu_memcpy_dtoh_async {
            unsafe { func(dst.as_mut_ptr() as *mut c_void, src, dst.len(), stream) }
        } else {
            unsafe { (self.cu_memcpy_dtoh)(dst.as_mut_ptr() as *mut c_void, src, dst.len()) }
        }
    }

    // ── Stream Management ─────────────────────────────────────────

    pub fn stream_create(&self, flags: u32) -> Result<CUstream, CUresult> {
        let mut stream: CUstream = std::ptr::null_mut();
        let res = unsafe { (self.cu_stream_create)(&mut stream, flags as c_uint) };
        if res == CUDA_SUCCESS { Ok(stream) } else { Err(res) }
    }

    pub fn stream_destroy(&self, stream: CUstream) -> CUresult {
        unsafe { (self.cu_stream_destroy)(stream) }
    }

    pub fn stream_synchronize(&self, stream: CUstream) -> CUresult {
        unsafe { (self.cu_stream_synchronize)(stream) }
    }
}

/// Convert a CUresult error code to a human-readable string.
pub fn cuda_error_name(result: CUresult) -> &'static str {
    match result {
        0 => "CUDA_SUCCESS",
        1 => "CUDA_ERROR_INVALID_VALUE",
        2 => "CUDA_ERROR_OUT_OF_MEMORY",
        3 => "CUDA_ERROR_NOT_INITIALIZED",
        4 => "CUDA_ERROR_DEINITIALIZED",
        100 => "CUDA_ERROR_NO_DEVICE",
        101 => "CUDA_ERROR_INVALID_DEVICE",
        200 => "CUDA_ERROR_INVALID_IMAGE",
        201 => "CUDA_ERROR_INVALID_CONTEXT",
        209 => "CUDA_ERROR_NO_BINARY_FOR_GPU",
        400 => "CUDA_ERROR_INVALID_HANDLE",
        500 => "CUDA_ERROR_NOT_FOUND",
        600 => "CUDA_ERROR_NOT_READY",
        700 => "CUDA_ERROR_ILLEGAL_ADDRESS",
        701 => "CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES",
        702 => "CUDA_ERROR_LAUNCH_TIMEOUT",
        719 => "CUDA_ERROR_LAUNCH_FAILED",
        801 => "CUDA_ERROR_NOT_SUPPORTED",
        _ => "CUDA_ERROR_UNKNOWN",
    }
}
