use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use opbench_core::{config::default_config_path, Backend, HarnessConfig, StatusPolicy};
use opbench_harness::device::{load_driver, probe_devices};
use opbench_harness::{
    CudaDevice, Device, DynamicLoader, Harness, HarnessError, HostDevice, HostTensor,
    HostTensorMut, KernelLoader, OwnedTensor, ProfileReport, ProfileRequest,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "opbench")]
#[command(about = "opbench - profile dynamically compiled operators")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load an operator, run it over the given tensors and report timings
    Run {
        /// Operator shared library
        #[arg(short, long)]
        library: PathBuf,

        /// Exported operator symbol
        #[arg(short, long)]
        symbol: String,

        /// Input tensor as dtype:v1,v2,... (repeatable, in order)
        #[arg(short, long = "input")]
        inputs: Vec<String>,

        /// Output tensor as dtype:len (repeatable, in order)
        #[arg(short, long = "output")]
        outputs: Vec<String>,

        /// Number of timed invocations
        #[arg(short = 'n', long)]
        iterations: Option<usize>,

        /// Threads-per-block hint passed to the operator
        #[arg(short, long)]
        threads_per_block: Option<u16>,

        /// Device backend: cuda or host
        #[arg(long)]
        backend: Option<Backend>,

        /// Status policy: last-iteration or fail-fast
        #[arg(long)]
        policy: Option<StatusPolicy>,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that an operator symbol resolves, without touching a device
    Resolve {
        /// Operator shared library
        #[arg(short, long)]
        library: PathBuf,

        /// Exported operator symbol
        #[arg(short, long)]
        symbol: String,
    },

    /// Load the CUDA driver and list visible devices
    Probe {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    opbench_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            library,
            symbol,
            inputs,
            outputs,
            iterations,
            threads_per_block,
            backend,
            policy,
            config,
            json,
        } => {
            let mut config = load_config(config.as_deref())?;

            // Flags override the config file
            if let Some(n) = iterations {
                config.profile.iterations = n;
            }
            if let Some(tpb) = threads_per_block {
                config.profile.threads_per_block = tpb;
            }
            if let Some(policy) = policy {
                config.profile.status_policy = policy;
            }
            if let Some(backend) = backend {
                config.device.backend = backend;
            }

            let inputs = inputs
                .iter()
                .map(|s| OwnedTensor::parse_input(s))
                .collect::<Result<Vec<_>, _>>()?;
            let mut outputs = outputs
                .iter()
                .enumerate()
                .map(|(i, s)| OwnedTensor::parse_output(s, i))
                .collect::<Result<Vec<_>, _>>()?;

            let request = ProfileRequest::from_config(library, symbol, &config.profile);
            info!(
                "profiling {} from {} on the {} backend",
                request.symbol,
                request.library.display(),
                config.device.backend
            );

            let report = match config.device.backend {
                Backend::Cuda => {
                    let device = CudaDevice::open(&config.device)?;
                    info!("using GPU {}: {}", device.ordinal(), device.device_name());
                    run_with(device, &request, &inputs, &mut outputs)?
                }
                Backend::Host => run_with(HostDevice::new(), &request, &inputs, &mut outputs)?,
            };

            if json {
                print_json(&report, &outputs)?;
            } else {
                print_report(&report, &outputs);
            }

            if !report.succeeded() {
                std::process::exit(report.exit_code());
            }
        }

        Commands::Resolve { library, symbol } => {
            let kernel = DynamicLoader::new().resolve(&library, &symbol)?;
            println!("{} resolved in {}", kernel.symbol(), library.display());
        }

        Commands::Probe { config } => {
            let config = load_config(config.as_deref())?;
            let driver = load_driver(&config.device)?;
            let devices = probe_devices(&driver)?;
            let version = driver
                .driver_get_version()
                .map_err(|code| anyhow::anyhow!("cuDriverGetVersion failed ({})", code))?;

            println!("CUDA driver {} ({})", format_version(version), driver.loaded_from());
            println!("Devices: {}", devices.len());
            println!();
            for dev in &devices {
                println!("  GPU {}: {}", dev.ordinal, dev.name);
                println!("    VRAM:     {} MB", dev.total_mem / (1024 * 1024));
                println!();
            }
        }
    }

    Ok(())
}

/// An explicit path must load; otherwise fall back to the default search.
fn load_config(path: Option<&str>) -> anyhow::Result<HarnessConfig> {
    match path {
        Some(path) => {
            HarnessConfig::load(path).with_context(|| format!("loading configuration {}", path))
        }
        None => Ok(HarnessConfig::load_or_default(&default_config_path())),
    }
}

fn run_with<D: Device>(
    device: D,
    request: &ProfileRequest,
    inputs: &[OwnedTensor],
    outputs: &mut [OwnedTensor],
) -> Result<ProfileReport, HarnessError> {
    let harness = Harness::new(device, DynamicLoader::new());
    let hosts: Vec<HostTensor<'_>> = inputs.iter().map(OwnedTensor::as_host).collect();
    let mut targets: Vec<HostTensorMut<'_>> =
        outputs.iter_mut().map(OwnedTensor::as_host_mut).collect();
    harness.run(request, &hosts, &mut targets)
}

fn print_report(report: &ProfileReport, outputs: &[OwnedTensor]) {
    let status = match report.status {
        Some(0) => "0 (success)".to_string(),
        Some(code) => format!("{} (operator failure)", code),
        None => "none (no iterations ran)".to_string(),
    };
    println!("Operator:   {}", report.symbol);
    println!("Status:     {}", status);
    println!("Buffers:    {} allocated, {} freed", report.allocations, report.frees);

    if let Some(s) = report.summary() {
        println!("Iterations: {}", s.count);
        println!(
            "Time (ms):  min {:.4}  median {:.4}  mean {:.4}  max {:.4}  stddev {:.4}",
            s.min, s.median, s.mean, s.max, s.stddev
        );
    }

    if report.outputs_retrieved {
        println!();
        for (i, out) in outputs.iter().enumerate() {
            println!("  output {} ({}[{}]): {}", i, out.dtype(), out.len(), out.render().join(", "));
        }
    }
}

fn print_json(report: &ProfileReport, outputs: &[OwnedTensor]) -> anyhow::Result<()> {
    let outputs: Vec<serde_json::Value> = if report.outputs_retrieved {
        outputs
            .iter()
            .map(|o| serde_json::json!({ "dtype": o.dtype(), "values": o.render() }))
            .collect()
    } else {
        Vec::new()
    };
    let doc = serde_json::json!({
        "report": report,
        "summary": report.summary(),
        "outputs": outputs,
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

/// 12040 -> "12.4"
fn format_version(version: i32) -> String {
    format!("{}.{}", version / 1000, (version % 1000) / 10)
}
