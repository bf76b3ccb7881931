use crate::host::TensorRole;

/// A device runtime call returned a failure code.
///
/// Device failures mean the execution environment itself is broken; the
/// harness never retries them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{op} failed: {name} ({code})")]
pub struct DeviceError {
    pub op: &'static str,
    pub code: i32,
    pub name: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("unsupported {role} type at index {index}: tag {tag}")]
    UnsupportedType {
        role: TensorRole,
        index: usize,
        tag: i32,
    },

    #[error("{role} {index} has a null data pointer for {len} elements")]
    NullBuffer {
        role: TensorRole,
        index: usize,
        len: usize,
    },

    #[error("{role} {index}: {len} elements overflow the addressable size")]
    SizeOverflow {
        role: TensorRole,
        index: usize,
        len: usize,
    },

    #[error("output {index} does not match the staged buffer")]
    OutputMismatch { index: usize },

    #[error("unable to find operator library {path}: {reason}")]
    LibraryNotFound { path: String, reason: String },

    #[error("unable to find operator function {symbol} in {library}")]
    SymbolNotFound { library: String, symbol: String },

    #[error("invalid tensor spec {spec:?}: {reason}")]
    InvalidTensorSpec { spec: String, reason: String },

    #[error("device driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("device failure: {0}")]
    Device(#[from] DeviceError),
}

impl HarnessError {
    /// Environment failures terminate the process at the C entry point;
    /// everything else is reported as a harness-level failure.
    pub fn is_environment_failure(&self) -> bool {
        matches!(self, HarnessError::Device(_) | HarnessError::DriverUnavailable(_))
    }
}
