//! Integration test: operator resolution
//!
//! Exercises the dynamic loader against a missing file, the system C
//! library and the compiled `opbench-test-ops` operators, and the in-process
//! symbol table.
//!
//! Run with: cargo test -p opbench-harness --test resolve_test -- --nocapture

mod common;

use std::ffi::c_void;
use std::path::Path;

use opbench_harness::{
    DevicePtr, DynamicLoader, ElementType, Harness, HarnessError, HostDevice, HostTensor,
    HostTensorMut, InputView, Kernel, KernelLoader, KernelStatus, OutputView, ProfileRequest,
    StreamHandle, SymbolTable,
};

#[cfg(target_os = "linux")]
const LIBC: &str = "libc.so.6";
#[cfg(target_os = "macos")]
const LIBC: &str = "libSystem.B.dylib";

unsafe extern "C" fn returns_tpb(
    _inputs: *const InputView,
    _num_inputs: usize,
    _outputs: *const OutputView,
    _num_outputs: usize,
    _stream: *mut c_void,
    threads_per_block: u16,
) -> u16 {
    threads_per_block
}

#[test]
fn test_dynamic_missing_library() {
    let loader = DynamicLoader::new();
    let err = loader
        .resolve(Path::new("/nonexistent/dir/libop.so"), "op")
        .expect_err("library should not open");
    println!("diagnostic: {}", err);

    match &err {
        HarnessError::LibraryNotFound { path, reason } => {
            assert_eq!(path, "/nonexistent/dir/libop.so");
            assert!(!reason.is_empty());
        }
        other => panic!("expected LibraryNotFound, got {:?}", other),
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
#[test]
fn test_dynamic_misspelled_symbol() {
    let loader = DynamicLoader::new();
    let err = loader
        .resolve(Path::new(LIBC), "mallc_definitely_not_here")
        .expect_err("symbol should be missing");
    println!("diagnostic: {}", err);

    match &err {
        HarnessError::SymbolNotFound { library, symbol } => {
            assert_eq!(library, LIBC);
            assert_eq!(symbol, "mallc_definitely_not_here");
        }
        other => panic!("expected SymbolNotFound, got {:?}", other),
    }
    assert!(err.to_string().contains("mallc_definitely_not_here"));
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
#[test]
fn test_dynamic_rejects_interior_nul() {
    let loader = DynamicLoader::new();
    let err = loader.resolve(Path::new(LIBC), "mal\0loc").expect_err("interior NUL");
    assert!(matches!(err, HarnessError::SymbolNotFound { .. }));
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
#[test]
fn test_dynamic_resolves_existing_symbol() {
    // Resolved only; a libc function does not follow the operator ABI.
    let loader = DynamicLoader::new();
    let kernel = loader.resolve(Path::new(LIBC), "malloc").expect("malloc exists");
    assert_eq!(kernel.symbol(), "malloc");
}

#[test]
fn test_dynamic_operator_resolves_twice_and_invokes() {
    let lib = common::test_ops_library();
    let loader = DynamicLoader::new();
    let first = loader.resolve(&lib, "op_echo_tpb").expect("first resolve");
    let second = loader.resolve(&lib, "op_echo_tpb").expect("second resolve");
    assert_eq!(first.symbol(), "op_echo_tpb");

    for tpb in [0u16, 1, 256, u16::MAX] {
        let a = unsafe { first.invoke(&[], &[], StreamHandle::DEFAULT, tpb) };
        let b = unsafe { second.invoke(&[], &[], StreamHandle::DEFAULT, tpb) };
        assert_eq!(a, KernelStatus(tpb));
        assert_eq!(a, b);
    }

    // Host memory stands in for device memory; the operator only copies.
    let input = [1.5f64, -2.5];
    let mut output = [0.0f64; 2];
    let copy = loader.resolve(&lib, "op_identity").expect("identity");
    let inputs = [InputView::new(input.as_ptr() as DevicePtr, ElementType::F64, 2)];
    let outputs = [OutputView::new(output.as_mut_ptr() as DevicePtr, ElementType::F64, 2)];
    let status = unsafe { copy.invoke(&inputs, &outputs, StreamHandle::DEFAULT, 64) };
    assert!(status.is_success());
    assert_eq!(output, input);
}

#[test]
fn test_dynamic_operator_through_harness() {
    let lib = common::test_ops_library();
    let harness = Harness::new(HostDevice::new(), DynamicLoader::new());
    let input = [7i32, 8, 9];

    let mut output = [0i32; 3];
    let request = ProfileRequest::new(&lib, "op_identity").iterations(3);
    let report = harness
        .run(&request, &[HostTensor::new(&input)], &mut [HostTensorMut::new(&mut output)])
        .expect("identity run");
    assert!(report.succeeded());
    assert_eq!(report.timings_ms.len(), 3);
    assert_eq!(output, input);

    let mut untouched = [-1i32; 3];
    let request = ProfileRequest::new(&lib, "op_seven").iterations(2);
    let report = harness
        .run(&request, &[HostTensor::new(&input)], &mut [HostTensorMut::new(&mut untouched)])
        .expect("operator failure is not a harness error");
    assert_eq!(report.status, Some(7));
    assert!(!report.outputs_retrieved);
    assert_eq!(untouched, [-1; 3]);

    let device = harness.device();
    assert_eq!(device.allocations(), device.frees());
    assert_eq!(device.live_allocations(), 0);
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
#[test]
fn test_harness_reports_missing_symbol_without_allocating() {
    let harness = Harness::new(HostDevice::new(), DynamicLoader::new());
    let input = [1.0f32];
    let mut output = [0.0f32];
    let request = ProfileRequest::new(LIBC, "not_an_operator_xyz").iterations(1);

    let err = harness
        .run(
            &request,
            &[HostTensor::new(&input)],
            &mut [HostTensorMut::new(&mut output)],
        )
        .expect_err("symbol should be missing");

    assert!(matches!(err, HarnessError::SymbolNotFound { .. }));
    assert_eq!(harness.device().allocations(), 0);
}

#[test]
fn test_symbol_table_lookup() {
    let table = SymbolTable::new().with("libops.so", "tpb", returns_tpb);
    assert_eq!(table.len(), 1);

    let kernel = table.resolve(Path::new("libops.so"), "tpb").expect("registered");
    let status = unsafe { kernel.invoke(&[], &[], StreamHandle::DEFAULT, 7) };
    assert_eq!(status, KernelStatus(7));
    assert!(!status.is_success());

    assert!(matches!(
        table.resolve(Path::new("libops.so"), "tbp"),
        Err(HarnessError::SymbolNotFound { .. })
    ));
    assert!(matches!(
        table.resolve(Path::new("libother.so"), "tpb"),
        Err(HarnessError::LibraryNotFound { .. })
    ));
}

#[test]
fn test_resolving_twice_gives_same_entry_point() {
    let table = SymbolTable::new();
    table.register("libops.so", "tpb", returns_tpb);

    let first = table.resolve(Path::new("libops.so"), "tpb").expect("first");
    let second = (&table).resolve(Path::new("libops.so"), "tpb").expect("second");
    for tpb in [0u16, 1, 256, u16::MAX] {
        let a = unsafe { first.invoke(&[], &[], StreamHandle::DEFAULT, tpb) };
        let b = unsafe { second.invoke(&[], &[], StreamHandle::DEFAULT, tpb) };
        assert_eq!(a, b);
    }

    let direct = Kernel::from_fn("tpb", returns_tpb);
    assert_eq!(
        unsafe { direct.invoke(&[], &[], StreamHandle::DEFAULT, 0) },
        KernelStatus::SUCCESS
    );
}
