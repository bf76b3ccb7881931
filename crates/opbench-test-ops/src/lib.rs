//! Operators compiled the way generated operator libraries are: a shared
//! object exporting unmangled entry points with the harness calling
//! convention. The harness tests load this library at runtime.
//!
//! The view layout is declared here rather than imported, since real
//! operator libraries do not link against the harness.

use std::ffi::c_void;

#[repr(C)]
pub struct InputView {
    data: *const c_void,
    dtype: i32,
    len: usize,
}

#[repr(C)]
pub struct OutputView {
    data: *mut c_void,
    dtype: i32,
    len: usize,
}

/// Status returned by [`op_seven`].
pub const SEVEN: u16 = 7;

fn element_size(tag: i32) -> Option<usize> {
    match tag {
        4 | 8 => Some(1),
        5 | 9 => Some(2),
        2 | 6 | 10 => Some(4),
        3 | 7 | 11 => Some(8),
        _ => None,
    }
}

unsafe fn slice<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }
}

/// Copies input i into output i. Returns 1 if a pair disagrees on type or
/// length.
///
/// # Safety
///
/// The arrays must hold `num_inputs`/`num_outputs` views over live buffers.
#[no_mangle]
pub unsafe extern "C" fn op_identity(
    inputs: *const InputView,
    num_inputs: usize,
    outputs: *const OutputView,
    num_outputs: usize,
    _stream: *mut c_void,
    _threads_per_block: u16,
) -> u16 {
    let inputs = unsafe { slice(inputs, num_inputs) };
    let outputs = unsafe { slice(outputs, num_outputs) };
    for (input, output) in inputs.iter().zip(outputs) {
        if input.dtype != output.dtype || input.len != output.len {
            return 1;
        }
        let Some(size) = element_size(input.dtype) else {
            return 1;
        };
        let bytes = input.len * size;
        if bytes > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(input.data as *const u8, output.data as *mut u8, bytes)
            };
        }
    }
    0
}

/// Zeroes every output and reports status 7.
///
/// # Safety
///
/// See [`op_identity`].
#[no_mangle]
pub unsafe extern "C" fn op_seven(
    _inputs: *const InputView,
    _num_inputs: usize,
    outputs: *const OutputView,
    num_outputs: usize,
    _stream: *mut c_void,
    _threads_per_block: u16,
) -> u16 {
    for output in unsafe { slice(outputs, num_outputs) } {
        let bytes = output.len * element_size(output.dtype).unwrap_or(0);
        if bytes > 0 {
            unsafe { std::ptr::write_bytes(output.data as *mut u8, 0, bytes) };
        }
    }
    SEVEN
}

/// Returns the threads-per-block hint it was given.
///
/// # Safety
///
/// Ignores its arguments; any values are accepted.
#[no_mangle]
pub unsafe extern "C" fn op_echo_tpb(
    _inputs: *const InputView,
    _num_inputs: usize,
    _outputs: *const OutputView,
    _num_outputs: usize,
    _stream: *mut c_void,
    threads_per_block: u16,
) -> u16 {
    threads_per_block
}
