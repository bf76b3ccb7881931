//! One end-to-end profiling invocation.
//!
//! Order of operations: resolve the kernel, create a stream, stage inputs,
//! stage outputs, run the profiling loop, retrieve outputs if the kernel
//! succeeded, release every buffer, destroy the stream. Nothing touches the
//! device before the kernel resolves.

use std::path::PathBuf;

use opbench_core::{ProfileConfig, StatusPolicy};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::device::{Device, StreamHandle};
use crate::error::HarnessError;
use crate::host::{validate_raw, HostTensor, HostTensorMut, RawTensor};
use crate::marshal::StagedTensors;
use crate::profile::profile;
use crate::resolve::{Kernel, KernelLoader};
use crate::stats::TimingSummary;

/// Which operator to profile and how.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRequest {
    pub library: PathBuf,
    pub symbol: String,
    pub threads_per_block: u16,
    pub iterations: usize,
    pub policy: StatusPolicy,
}

impl ProfileRequest {
    /// Request with the default profiling settings.
    pub fn new(library: impl Into<PathBuf>, symbol: impl Into<String>) -> Self {
        Self::from_config(library, symbol, &ProfileConfig::default())
    }

    pub fn from_config(
        library: impl Into<PathBuf>,
        symbol: impl Into<String>,
        config: &ProfileConfig,
    ) -> Self {
        Self {
            library: library.into(),
            symbol: symbol.into(),
            threads_per_block: config.threads_per_block,
            iterations: config.iterations,
            policy: config.status_policy,
        }
    }

    pub fn threads_per_block(mut self, threads_per_block: u16) -> Self {
        self.threads_per_block = threads_per_block;
        self
    }

    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn policy(mut self, policy: StatusPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Result of a completed invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileReport {
    pub symbol: String,
    /// Final kernel status; absent when no iteration ran.
    pub status: Option<u16>,
    pub timings_ms: Vec<f64>,
    pub outputs_retrieved: bool,
    pub allocations: usize,
    pub frees: usize,
}

impl ProfileReport {
    pub fn succeeded(&self) -> bool {
        self.status == Some(0)
    }

    /// 0 on success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    pub fn summary(&self) -> Option<TimingSummary> {
        TimingSummary::from_samples(&self.timings_ms)
    }
}

/// Drives operators from `L` on device `D`.
pub struct Harness<D, L> {
    device: D,
    loader: L,
}

impl<D: Device, L: KernelLoader> Harness<D, L> {
    pub fn new(device: D, loader: L) -> Self {
        Self { device, loader }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Profile `request` over caller-owned host buffers.
    ///
    /// A nonzero kernel status is not an error: it is reported in the
    /// returned [`ProfileReport`] and leaves `outputs` untouched.
    pub fn run(
        &self,
        request: &ProfileRequest,
        inputs: &[HostTensor<'_>],
        outputs: &mut [HostTensorMut<'_>],
    ) -> Result<ProfileReport, HarnessError> {
        let result = self.run_inner(request, inputs, outputs);
        if let Err(e) = &result {
            error!("{}", e);
        }
        result
    }

    /// Profile `request` over C descriptors. Every type tag is checked
    /// before the kernel is resolved or the device is touched.
    ///
    /// # Safety
    ///
    /// Each descriptor must satisfy [`HostTensor::from_raw`] (inputs) or
    /// [`HostTensorMut::from_raw`] (outputs) for the duration of the call.
    pub unsafe fn run_raw(
        &self,
        request: &ProfileRequest,
        inputs: &[RawTensor],
        outputs: &[RawTensor],
    ) -> Result<ProfileReport, HarnessError> {
        if let Err(e) = validate_raw(inputs, outputs) {
            error!("{}", e);
            return Err(e);
        }
        let hosts = inputs
            .iter()
            .enumerate()
            // SAFETY: forwarded from the caller.
            .map(|(i, raw)| unsafe { HostTensor::from_raw(raw, i) })
            .collect::<Result<Vec<_>, _>>()?;
        let mut targets = outputs
            .iter()
            .enumerate()
            // SAFETY: forwarded from the caller.
            .map(|(i, raw)| unsafe { HostTensorMut::from_raw(raw, i) })
            .collect::<Result<Vec<_>, _>>()?;
        self.run(request, &hosts, &mut targets)
    }

    fn run_inner(
        &self,
        request: &ProfileRequest,
        inputs: &[HostTensor<'_>],
        outputs: &mut [HostTensorMut<'_>],
    ) -> Result<ProfileReport, HarnessError> {
        let kernel = self.loader.resolve(&request.library, &request.symbol)?;
        info!(
            "profiling {} on {} ({} inputs, {} outputs, {} iterations)",
            kernel.symbol(),
            self.device.name(),
            inputs.len(),
            outputs.len(),
            request.iterations
        );

        let stream = self.device.create_stream()?;
        let result = self.run_on_stream(&kernel, request, inputs, outputs, stream);
        let destroyed = self.device.destroy_stream(stream);
        let report = result?;
        destroyed?;
        Ok(report)
    }

    fn run_on_stream(
        &self,
        kernel: &Kernel,
        request: &ProfileRequest,
        inputs: &[HostTensor<'_>],
        outputs: &mut [HostTensorMut<'_>],
        stream: StreamHandle,
    ) -> Result<ProfileReport, HarnessError> {
        let mut staged = StagedTensors::new(&self.device, stream);
        staged.stage_inputs(inputs)?;
        staged.stage_outputs(outputs)?;

        let outcome = profile(
            kernel,
            &staged,
            request.threads_per_block,
            request.iterations,
            request.policy,
        )?;

        let retrieved = match outcome.status {
            Some(status) if status.is_success() => {
                staged.retrieve_outputs(outputs)?;
                true
            }
            Some(status) => {
                error!("error executing operator {}: status {}", kernel.symbol(), status);
                false
            }
            None => {
                warn!("{} was not invoked; outputs left untouched", kernel.symbol());
                false
            }
        };

        staged.release()?;

        Ok(ProfileReport {
            symbol: kernel.symbol().to_string(),
            status: outcome.status.map(|s| s.code()),
            timings_ms: outcome.timings_ms,
            outputs_retrieved: retrieved,
            allocations: staged.allocations(),
            frees: staged.frees(),
        })
    }
}
