//! C entry points.
//!
//! Both functions return 0 on success and 1 on any harness-level failure
//! (unsupported type, missing library or symbol, nonzero kernel status).
//! A broken execution environment (driver missing, allocation or copy
//! failure) is logged and terminates the process with exit code 1.
//!
//! Only the last iteration's status decides the result. The `status_policy`
//! setting in `opbench.toml` applies to the command line, never here.

use std::ffi::{c_char, CStr};
use std::path::PathBuf;

use opbench_core::{config::default_config_path, HarnessConfig, StatusPolicy};
use tracing::error;

use crate::device::{CudaDevice, Device, HostDevice};
use crate::error::HarnessError;
use crate::harness::{Harness, ProfileRequest};
use crate::host::RawTensor;
use crate::resolve::DynamicLoader;

/// Profile `func_name` from `lib_path` on the configured CUDA device.
///
/// `execution_time_ms` receives one sample per completed iteration and must
/// have room for `iterations` values (it may be null). The device comes from
/// the `[device]` section of `opbench.toml`, if one is found.
///
/// # Safety
///
/// `lib_path` and `func_name` must be null or NUL-terminated strings.
/// `inputs`/`outputs` must point to `num_inputs`/`num_outputs` descriptors
/// whose data pointers are valid host buffers of the described size.
#[no_mangle]
pub unsafe extern "C" fn opbench_profile_operator(
    lib_path: *const c_char,
    func_name: *const c_char,
    inputs: *const RawTensor,
    num_inputs: usize,
    outputs: *const RawTensor,
    num_outputs: usize,
    threads_per_block: u16,
    execution_time_ms: *mut f64,
    iterations: usize,
) -> i32 {
    opbench_common::try_init_logging();
    let config = HarnessConfig::load_or_default(&default_config_path());
    let device = match CudaDevice::open(&config.device) {
        Ok(device) => device,
        Err(e) => fatal(&e),
    };
    let call = EntryCall {
        lib_path,
        func_name,
        inputs,
        num_inputs,
        outputs,
        num_outputs,
        threads_per_block,
        execution_time_ms,
        iterations,
    };
    // SAFETY: forwarded from the caller.
    unsafe { call.run(device) }
}

/// Same contract as [`opbench_profile_operator`], for operator libraries
/// compiled to run on the host. Device buffers live in host memory.
///
/// # Safety
///
/// See [`opbench_profile_operator`].
#[no_mangle]
pub unsafe extern "C" fn opbench_profile_operator_host(
    lib_path: *const c_char,
    func_name: *const c_char,
    inputs: *const RawTensor,
    num_inputs: usize,
    outputs: *const RawTensor,
    num_outputs: usize,
    threads_per_block: u16,
    execution_time_ms: *mut f64,
    iterations: usize,
) -> i32 {
    opbench_common::try_init_logging();
    let call = EntryCall {
        lib_path,
        func_name,
        inputs,
        num_inputs,
        outputs,
        num_outputs,
        threads_per_block,
        execution_time_ms,
        iterations,
    };
    // SAFETY: forwarded from the caller.
    unsafe { call.run(HostDevice::new()) }
}

struct EntryCall {
    lib_path: *const c_char,
    func_name: *const c_char,
    inputs: *const RawTensor,
    num_inputs: usize,
    outputs: *const RawTensor,
    num_outputs: usize,
    threads_per_block: u16,
    execution_time_ms: *mut f64,
    iterations: usize,
}

impl EntryCall {
    unsafe fn run<D: Device>(self, device: D) -> i32 {
        let Some(library) = (unsafe { c_path(self.lib_path) }) else {
            error!("operator library path must be a non-null string");
            return 1;
        };
        let Some(symbol) = (unsafe { c_str(self.func_name) }) else {
            error!("operator symbol name must be a non-null UTF-8 string");
            return 1;
        };
        // SAFETY: the caller guarantees `len` readable descriptors.
        let inputs = unsafe { raw_slice(self.inputs, self.num_inputs) };
        let outputs = unsafe { raw_slice(self.outputs, self.num_outputs) };

        let request = ProfileRequest::new(library, symbol)
            .policy(StatusPolicy::LastIteration)
            .threads_per_block(self.threads_per_block)
            .iterations(self.iterations);
        let harness = Harness::new(device, DynamicLoader::new());

        // SAFETY: descriptor validity is the caller's contract.
        match unsafe { harness.run_raw(&request, inputs, outputs) } {
            Ok(report) => {
                if !self.execution_time_ms.is_null() {
                    let n = report.timings_ms.len().min(self.iterations);
                    // SAFETY: the caller provides room for `iterations` samples.
                    let out = unsafe { std::slice::from_raw_parts_mut(self.execution_time_ms, n) };
                    out.copy_from_slice(&report.timings_ms[..n]);
                }
                report.exit_code()
            }
            Err(e) if e.is_environment_failure() => fatal(&e),
            Err(_) => 1,
        }
    }
}

fn fatal(e: &HarnessError) -> ! {
    error!("execution environment failure, terminating: {}", e);
    std::process::exit(1)
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and NUL-terminated per the caller contract.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// Library paths are raw bytes on unix, as `dlopen` takes them.
unsafe fn c_path(ptr: *const c_char) -> Option<PathBuf> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and NUL-terminated per the caller contract.
    let bytes = unsafe { CStr::from_ptr(ptr) }.to_bytes();
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Some(PathBuf::from(std::ffi::OsStr::from_bytes(bytes)))
    }
    #[cfg(not(unix))]
    {
        std::str::from_utf8(bytes).ok().map(PathBuf::from)
    }
}

unsafe fn raw_slice<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        // SAFETY: forwarded from the caller.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }
}
