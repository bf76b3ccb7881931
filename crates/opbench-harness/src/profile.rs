//! Timed invocation loop.

use std::time::Instant;

use opbench_core::StatusPolicy;
use tracing::{debug, warn};

use crate::abi::KernelStatus;
use crate::device::Device;
use crate::error::DeviceError;
use crate::marshal::StagedTensors;
use crate::resolve::Kernel;

/// What one profiling run observed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileOutcome {
    /// Status of the last call made. `None` when no call was made.
    pub status: Option<KernelStatus>,
    /// Wall time of each completed call in milliseconds, including device
    /// completion.
    pub timings_ms: Vec<f64>,
}

impl ProfileOutcome {
    pub fn succeeded(&self) -> bool {
        self.status.is_some_and(KernelStatus::is_success)
    }
}

/// Invoke `kernel` up to `iterations` times over the staged buffers.
///
/// The device is drained once before the first call so staging copies are
/// not timed, and the stream is drained on both sides of every call.
/// Under [`StatusPolicy::LastIteration`] every iteration runs and only the
/// final status is kept; under [`StatusPolicy::FailFast`] the loop stops at
/// the first nonzero status.
pub fn profile<D: Device + ?Sized>(
    kernel: &Kernel,
    staged: &StagedTensors<'_, '_, D>,
    threads_per_block: u16,
    iterations: usize,
    policy: StatusPolicy,
) -> Result<ProfileOutcome, DeviceError> {
    let device = staged.device();
    let stream = staged.stream();
    let inputs = staged.input_views();
    let outputs = staged.output_views();

    device.synchronize_device()?;

    let mut status = None;
    let mut timings_ms = Vec::with_capacity(iterations);
    for iteration in 0..iterations {
        device.synchronize(stream)?;
        let start = Instant::now();
        // SAFETY: the views come from the live buffers owned by `staged`.
        let code = unsafe { kernel.invoke(&inputs, &outputs, stream, threads_per_block) };
        device.synchronize(stream)?;
        let elapsed = start.elapsed().as_secs_f64() * 1e3;

        timings_ms.push(elapsed);
        status = Some(code);
        debug!(
            "{} iteration {}: status {} in {:.3} ms",
            kernel.symbol(),
            iteration,
            code,
            elapsed
        );

        if !code.is_success() && policy == StatusPolicy::FailFast {
            warn!(
                "{} returned {} on iteration {}; stopping",
                kernel.symbol(),
                code,
                iteration
            );
            break;
        }
    }

    Ok(ProfileOutcome { status, timings_ms })
}
