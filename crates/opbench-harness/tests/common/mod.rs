//! Helpers shared by the integration tests.

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::PathBuf;

/// Path to the compiled `opbench-test-ops` shared library.
///
/// It is a dev-dependency of this crate, so cargo builds it next to the test
/// binaries (`target/<profile>/deps`).
pub fn test_ops_library() -> PathBuf {
    let exe = std::env::current_exe().expect("test binary path");
    let deps = exe.parent().expect("deps directory");
    let stem = format!("{}opbench_test_ops", DLL_PREFIX);

    for dir in [deps, deps.parent().unwrap_or(deps)] {
        let exact = dir.join(format!("{}{}", stem, DLL_SUFFIX));
        if exact.is_file() {
            return exact;
        }
        let Ok(entries) = std::fs::read_dir(dir) else { continue };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&stem) && name.ends_with(DLL_SUFFIX) {
                return entry.path();
            }
        }
    }
    panic!("{}{} not found near {}", stem, DLL_SUFFIX, deps.display());
}
