//! Integration test: end-to-end profiling on the host device
//!
//! Drives the harness with operators linked into this test binary through a
//! SymbolTable. Verifies:
//! 1. Identity operators round-trip every element type
//! 2. Allocations and frees stay balanced on every path
//! 3. Failing operators leave output buffers untouched
//! 4. Bad type tags are rejected before the device is touched
//! 5. Status policies and the zero-iteration case
//!
//! Run with: cargo test -p opbench-harness --test harness_test -- --nocapture

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use opbench_harness::abi::views;
use opbench_harness::{
    with_element_type, DeviceEvent, Element, ElementType, Harness, HarnessError, HostDevice,
    HostTensor, HostTensorMut, InputView, OutputView, OwnedTensor, ProfileRequest, RawTensor,
    StatusPolicy, SymbolTable,
};

const LIB: &str = "libtest_ops.so";

/// Copies input i to output i, byte for byte.
unsafe extern "C" fn identity(
    inputs: *const InputView,
    num_inputs: usize,
    outputs: *const OutputView,
    num_outputs: usize,
    _stream: *mut c_void,
    _threads_per_block: u16,
) -> u16 {
    let inputs = unsafe { views(inputs, num_inputs) };
    let outputs = unsafe { views(outputs, num_outputs) };
    for (input, output) in inputs.iter().zip(outputs) {
        let bytes = input.len() * input.dtype().size_of();
        if bytes > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    input.as_ptr() as *const u8,
                    output.as_mut_ptr() as *mut u8,
                    bytes,
                )
            };
        }
    }
    0
}

/// Writes zeros over every output, then reports failure.
unsafe extern "C" fn always_seven(
    _inputs: *const InputView,
    _num_inputs: usize,
    outputs: *const OutputView,
    num_outputs: usize,
    _stream: *mut c_void,
    _threads_per_block: u16,
) -> u16 {
    for output in unsafe { views(outputs, num_outputs) } {
        let bytes = output.len() * output.dtype().size_of();
        if bytes > 0 {
            unsafe { std::ptr::write_bytes(output.as_mut_ptr() as *mut u8, 0, bytes) };
        }
    }
    7
}

static SAW_TPB: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn record_tpb(
    _inputs: *const InputView,
    _num_inputs: usize,
    _outputs: *const OutputView,
    _num_outputs: usize,
    _stream: *mut c_void,
    threads_per_block: u16,
) -> u16 {
    SAW_TPB.store(threads_per_block as usize, Ordering::SeqCst);
    0
}

/// Fails on its first call only, then behaves like `identity`.
macro_rules! fails_first {
    ($name:ident, $counter:ident) => {
        static $counter: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C" fn $name(
            inputs: *const InputView,
            num_inputs: usize,
            outputs: *const OutputView,
            num_outputs: usize,
            stream: *mut c_void,
            threads_per_block: u16,
        ) -> u16 {
            if $counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return 3;
            }
            unsafe { identity(inputs, num_inputs, outputs, num_outputs, stream, threads_per_block) }
        }
    };
}

fails_first!(flaky_last, FLAKY_LAST_CALLS);
fails_first!(flaky_fast, FLAKY_FAST_CALLS);

fn loader() -> SymbolTable {
    SymbolTable::new()
        .with(LIB, "identity", identity)
        .with(LIB, "always_seven", always_seven)
        .with(LIB, "record_tpb", record_tpb)
        .with(LIB, "flaky_last", flaky_last)
        .with(LIB, "flaky_fast", flaky_fast)
}

fn assert_balanced(device: &HostDevice) {
    assert_eq!(device.allocations(), device.frees(), "allocations and frees diverged");
    assert_eq!(device.live_allocations(), 0);
}

#[test]
fn test_identity_float32() {
    let harness = Harness::new(HostDevice::new(), loader());
    let input = [1.0f32, 2.0, 3.0, 4.0];
    let mut output = [0.0f32; 4];

    let request = ProfileRequest::new(LIB, "identity").iterations(3);
    let report = harness
        .run(
            &request,
            &[HostTensor::new(&input)],
            &mut [HostTensorMut::new(&mut output)],
        )
        .expect("run");

    println!("report: {:?}", report);
    assert!(report.succeeded());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.status, Some(0));
    assert!(report.outputs_retrieved);
    assert_eq!(output, [1.0, 2.0, 3.0, 4.0]);
    assert_eq!(report.timings_ms.len(), 3);
    assert!(report.timings_ms.iter().all(|t| *t >= 0.0));
    assert_eq!(report.allocations, 2);
    assert_eq!(report.frees, 2);
    assert_balanced(harness.device());
}

#[test]
fn test_identity_every_element_type() {
    for dtype in ElementType::ALL {
        let harness = Harness::new(HostDevice::new(), loader());
        with_element_type!(dtype, |T| {
            let input: Vec<T> = ["1", "2", "3", "4", "5"]
                .iter()
                .map(|s| <T as Element>::parse_value(s).expect("value"))
                .collect();
            let mut output = vec![T::default(); input.len()];

            let request = ProfileRequest::new(LIB, "identity").iterations(2);
            let report = harness
                .run(
                    &request,
                    &[HostTensor::new(&input)],
                    &mut [HostTensorMut::new(&mut output)],
                )
                .expect("run");

            assert!(report.succeeded(), "{} failed", dtype);
            assert_eq!(
                bytemuck::cast_slice::<T, u8>(&output),
                bytemuck::cast_slice::<T, u8>(&input),
                "{} did not round-trip",
                dtype
            );
        });
        let device = harness.device();
        assert_eq!(device.allocations(), 2);
        assert_eq!(device.bytes_allocated(), 2 * 5 * dtype.size_of());
        assert_balanced(device);
    }
}

#[test]
fn test_status_seven_leaves_outputs_untouched() {
    let harness = Harness::new(HostDevice::new(), loader());
    let input = [1i32, 2, 3];
    let mut output = [-1i32; 3];

    let request = ProfileRequest::new(LIB, "always_seven").iterations(4);
    let report = harness
        .run(
            &request,
            &[HostTensor::new(&input)],
            &mut [HostTensorMut::new(&mut output)],
        )
        .expect("operator failure is not a harness error");

    assert_eq!(report.status, Some(7));
    assert!(!report.succeeded());
    assert_eq!(report.exit_code(), 1);
    assert!(!report.outputs_retrieved);
    assert_eq!(report.timings_ms.len(), 4, "all iterations still run");
    assert_eq!(output, [-1, -1, -1]);
    assert!(!harness
        .device()
        .events()
        .iter()
        .any(|e| matches!(e, DeviceEvent::CopyToHost { .. })));
    assert_balanced(harness.device());
}

#[test]
fn test_missing_library_performs_no_device_calls() {
    let harness = Harness::new(HostDevice::new(), loader());
    let input = [1.0f64];
    let mut output = [0.0f64];

    let request = ProfileRequest::new("/nonexistent/libmissing.so", "identity");
    let err = harness
        .run(
            &request,
            &[HostTensor::new(&input)],
            &mut [HostTensorMut::new(&mut output)],
        )
        .expect_err("library should be missing");

    match &err {
        HarnessError::LibraryNotFound { path, .. } => {
            assert_eq!(path, "/nonexistent/libmissing.so")
        }
        other => panic!("expected LibraryNotFound, got {:?}", other),
    }
    assert!(err.to_string().contains("/nonexistent/libmissing.so"));
    assert!(!err.is_environment_failure());
    assert_eq!(harness.device().allocations(), 0);
    assert!(harness.device().events().is_empty());
}

#[test]
fn test_misspelled_symbol_reports_name() {
    let harness = Harness::new(HostDevice::new(), loader());
    let request = ProfileRequest::new(LIB, "identiy");
    let err = harness.run(&request, &[], &mut []).expect_err("symbol should be missing");

    assert!(matches!(err, HarnessError::SymbolNotFound { ref symbol, .. } if symbol == "identiy"));
    assert!(err.to_string().contains("identiy"));
    assert!(harness.device().events().is_empty());
}

#[test]
fn test_unsupported_tag_rejected_before_device() {
    let harness = Harness::new(HostDevice::new(), loader());
    let mut a = [1.0f32; 2];
    let mut b = [0.0f32; 2];
    let mut c = [0u8; 2];

    for bad_tag in [0, 1, 12, -3] {
        let inputs = [RawTensor::new(a.as_mut_ptr().cast(), ElementType::F32.tag(), 2)];
        let outputs = [
            RawTensor::new(b.as_mut_ptr().cast(), ElementType::F32.tag(), 2),
            RawTensor::new(c.as_mut_ptr().cast(), bad_tag, 2),
        ];
        let request = ProfileRequest::new(LIB, "identity").iterations(1);
        let err = unsafe { harness.run_raw(&request, &inputs, &outputs) }.expect_err("bad tag");

        match err {
            HarnessError::UnsupportedType { index, tag, .. } => {
                assert_eq!(index, 1);
                assert_eq!(tag, bad_tag);
            }
            other => panic!("expected UnsupportedType, got {:?}", other),
        }
    }
    assert!(harness.device().events().is_empty());
    assert_eq!(b, [0.0, 0.0]);
}

#[test]
fn test_raw_descriptors_round_trip() {
    let harness = Harness::new(HostDevice::new(), loader());
    let mut input = [10u16, 20, 30];
    let mut output = [0u16; 3];
    let inputs = [RawTensor::new(input.as_mut_ptr().cast(), ElementType::U16.tag(), 3)];
    let outputs = [RawTensor::new(output.as_mut_ptr().cast(), ElementType::U16.tag(), 3)];

    let request = ProfileRequest::new(LIB, "identity").iterations(1);
    let report = unsafe { harness.run_raw(&request, &inputs, &outputs) }.expect("run");

    assert!(report.succeeded());
    assert_eq!(output, [10, 20, 30]);
    assert_balanced(harness.device());
}

#[test]
fn test_allocation_failure_frees_partial_staging() {
    // Third allocation (the first output) fails.
    let harness = Harness::new(HostDevice::new().with_alloc_failure(3), loader());
    let a = [1u64, 2];
    let b = [3u64, 4];
    let mut out = [0u64; 2];

    let request = ProfileRequest::new(LIB, "identity");
    let err = harness
        .run(
            &request,
            &[HostTensor::new(&a), HostTensor::new(&b)],
            &mut [HostTensorMut::new(&mut out)],
        )
        .expect_err("allocation should fail");

    assert!(err.is_environment_failure());
    assert!(matches!(err, HarnessError::Device(ref e) if e.name == "CUDA_ERROR_OUT_OF_MEMORY"));
    let device = harness.device();
    assert_eq!(device.allocations(), 2);
    assert_balanced(device);
    assert_eq!(out, [0, 0]);

    let events = device.events();
    assert_eq!(events.last(), Some(&DeviceEvent::DestroyStream));
}

#[test]
fn test_event_order() {
    let harness = Harness::new(HostDevice::new(), loader());
    let input = [5i8, 6];
    let mut output = [0i8; 2];

    let request = ProfileRequest::new(LIB, "identity").iterations(1);
    harness
        .run(
            &request,
            &[HostTensor::new(&input)],
            &mut [HostTensorMut::new(&mut output)],
        )
        .expect("run");

    let kinds: Vec<&str> = harness
        .device()
        .events()
        .iter()
        .map(|e| match e {
            DeviceEvent::SynchronizeDevice => "sync_device",
            DeviceEvent::CreateStream => "create_stream",
            DeviceEvent::DestroyStream => "destroy_stream",
            DeviceEvent::Synchronize => "sync",
            DeviceEvent::Alloc { .. } => "alloc",
            DeviceEvent::Free { .. } => "free",
            DeviceEvent::CopyToDevice { .. } => "h2d",
            DeviceEvent::CopyToHost { .. } => "d2h",
        })
        .collect();

    assert_eq!(
        kinds,
        [
            "create_stream",
            "alloc",
            "h2d",
            "alloc",
            "sync_device",
            "sync",
            "sync",
            "d2h",
            "sync",
            "sync",
            "free",
            "free",
            "destroy_stream",
        ]
    );
}

#[test]
fn test_last_iteration_policy_masks_early_failure() {
    let harness = Harness::new(HostDevice::new(), loader());
    let input = [1u32, 2];
    let mut output = [0u32; 2];

    let request = ProfileRequest::new(LIB, "flaky_last")
        .iterations(3)
        .policy(StatusPolicy::LastIteration);
    let report = harness
        .run(
            &request,
            &[HostTensor::new(&input)],
            &mut [HostTensorMut::new(&mut output)],
        )
        .expect("run");

    assert_eq!(FLAKY_LAST_CALLS.load(Ordering::SeqCst), 3);
    assert!(report.succeeded());
    assert_eq!(report.timings_ms.len(), 3);
    assert_eq!(output, [1, 2]);
}

#[test]
fn test_fail_fast_policy_stops_at_first_failure() {
    let harness = Harness::new(HostDevice::new(), loader());
    let input = [1u32, 2];
    let mut output = [0u32; 2];

    let request = ProfileRequest::new(LIB, "flaky_fast")
        .iterations(3)
        .policy(StatusPolicy::FailFast);
    let report = harness
        .run(
            &request,
            &[HostTensor::new(&input)],
            &mut [HostTensorMut::new(&mut output)],
        )
        .expect("run");

    assert_eq!(FLAKY_FAST_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(report.status, Some(3));
    assert_eq!(report.timings_ms.len(), 1);
    assert_eq!(output, [0, 0]);
    assert_balanced(harness.device());
}

#[test]
fn test_zero_iterations_is_not_success() {
    let harness = Harness::new(HostDevice::new(), loader());
    let input = [1.5f32];
    let mut output = [9.0f32];

    let request = ProfileRequest::new(LIB, "identity").iterations(0);
    let report = harness
        .run(
            &request,
            &[HostTensor::new(&input)],
            &mut [HostTensorMut::new(&mut output)],
        )
        .expect("run");

    assert_eq!(report.status, None);
    assert!(report.timings_ms.is_empty());
    assert!(report.summary().is_none());
    assert_eq!(report.exit_code(), 1);
    assert_eq!(output, [9.0]);
    assert_balanced(harness.device());
}

#[test]
fn test_zero_length_tensors() {
    let harness = Harness::new(HostDevice::new(), loader());
    let input: [f64; 0] = [];
    let mut output: [f64; 0] = [];

    let request = ProfileRequest::new(LIB, "identity").iterations(1);
    let report = harness
        .run(
            &request,
            &[HostTensor::new(&input)],
            &mut [HostTensorMut::new(&mut output)],
        )
        .expect("run");

    assert!(report.succeeded());
    assert_eq!(report.allocations, 2);
    assert_eq!(report.frees, 2);
    assert_eq!(harness.device().bytes_allocated(), 0);
}

#[test]
fn test_threads_per_block_passed_through() {
    let harness = Harness::new(HostDevice::new(), loader());
    let request = ProfileRequest::new(LIB, "record_tpb")
        .iterations(1)
        .threads_per_block(96);
    let report = harness.run(&request, &[], &mut []).expect("run");

    assert!(report.succeeded());
    assert_eq!(SAW_TPB.load(Ordering::SeqCst), 96);
}

#[test]
fn test_repeated_resolution_gives_identical_results() {
    let harness = Harness::new(HostDevice::new(), loader());
    let input = OwnedTensor::parse_input("i64:-4,0,9,1000000").expect("parse");
    let request = ProfileRequest::new(LIB, "identity").iterations(1);

    let mut first = OwnedTensor::parse_output("i64:4", 0).expect("parse");
    let mut second = OwnedTensor::parse_output("i64:4", 1).expect("parse");
    harness
        .run(&request, &[input.as_host()], &mut [first.as_host_mut()])
        .expect("first run");
    harness
        .run(&request, &[input.as_host()], &mut [second.as_host_mut()])
        .expect("second run");

    assert_eq!(first, second);
    assert_eq!(first.values::<i64>(), Some(vec![-4, 0, 9, 1_000_000]));
}
