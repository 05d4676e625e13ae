//! `clsim` - compute-offload driver harness
//!
//! Replays the guest runtime protocol against the driver with a functional
//! device model attached.
//!
//! # Usage
//!
//! ```bash
//! # Run one dispatch of `vector_add` over a 64x64 grid
//! clsim run --binary kernels.json --kernel vector_add --global 64,64 --local 16,16
//!
//! # Same, with a config file and a JSON trace of every ABI call
//! clsim run --binary kernels.json --kernel vector_add --global 1024 --local 64 \
//!       --config clsim.toml --trace calls.json
//!
//! # List the ABI operation codes
//! clsim abi
//! ```

mod runtime;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use clsim_driver::{
    ABI_TABLE, BinaryLoader, Driver, DriverConfig, FunctionalDevice, JsonBinaryLoader, Simulation,
};
use tracing::{error, info};

use runtime::{GuestRuntime, LaunchSpec};

#[derive(Parser, Debug)]
#[command(name = "clsim")]
#[command(about = "Replay the guest runtime protocol against the compute-offload driver")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    #[arg(long, value_name = "LEVEL", global = true, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one kernel dispatch end to end
    Run(RunArgs),

    /// List the ABI operation table
    Abi,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON program container
    #[arg(long, value_name = "PATH")]
    binary: PathBuf,

    /// Kernel entry point to launch
    #[arg(long)]
    kernel: String,

    /// Global size per dimension (1 to 3 values)
    #[arg(long, value_delimiter = ',', num_args = 1..=3, required = true)]
    global: Vec<u32>,

    /// Local size per dimension, same count as --global
    #[arg(long, value_delimiter = ',', num_args = 1..=3, required = true)]
    local: Vec<u32>,

    /// Driver configuration file (TOML)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write a JSON trace of every ABI call
    #[arg(long, value_name = "PATH")]
    trace: Option<PathBuf>,

    /// Work-groups the device starts per tick
    #[arg(long, default_value_t = 4)]
    compute_units: usize,

    /// Bytes allocated for each global buffer argument
    #[arg(long, default_value_t = 4096)]
    buffer_size: u32,

    /// Bytes requested for each local memory argument
    #[arg(long, default_value_t = 256)]
    local_arg_size: u32,

    /// Stop after this many ticks
    #[arg(long, default_value_t = 1_000_000)]
    max_ticks: u64,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.log_format);

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Abi => {
            print_abi_table();
            Ok(())
        }
    }
}

fn setup_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Compact => subscriber.compact().init(),
    }
}

fn load_config(path: Option<&Path>) -> Result<DriverConfig> {
    let config = match path {
        Some(path) => DriverConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => DriverConfig::from_env().context("invalid CLSIM_* environment override")?,
    };
    Ok(config)
}

fn run(args: RunArgs) -> Result<()> {
    if args.global.len() != args.local.len() {
        let (global, local) = (args.global.len(), args.local.len());
        bail!("--global has {global} dimensions but --local has {local}");
    }

    let mut config = load_config(args.config.as_deref())?;
    if args.trace.is_some() {
        config.trace_calls = true;
    }

    let binary = fs::read(&args.binary)
        .with_context(|| format!("failed to read program binary {}", args.binary.display()))?;
    let program = JsonBinaryLoader
        .load(&binary)
        .with_context(|| format!("failed to parse {}", args.binary.display()))?;
    // An unknown kernel is left for the driver to reject in si_kernel_create.
    let kernel_args: Vec<_> = program
        .kernel(&args.kernel)
        .map(|k| k.args.iter().map(|a| a.kind.clone()).collect())
        .unwrap_or_default();

    let launch = LaunchSpec {
        kernel: args.kernel.clone(),
        global_size: args.global.clone(),
        local_size: args.local.clone(),
        buffer_size: args.buffer_size,
        local_arg_size: args.local_arg_size,
    };
    let groups = launch.total_groups();
    info!(
        "launching '{}' over {:?} / {:?} ({groups} work-groups)",
        launch.kernel, launch.global_size, launch.local_size
    );

    let mut driver = Driver::new(config);
    driver.attach_device(Box::new(FunctionalDevice::new(args.compute_units)));
    let mut sim = Simulation::new(driver);
    sim.spawn(Box::new(GuestRuntime::new(binary, kernel_args, launch)));

    let outcome = sim.run(args.max_ticks);

    if let Some(path) = &args.trace {
        write_trace(&sim, path)?;
    }

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            error!("driver terminated the simulation: {}", e);
            return Err(e).context("simulation aborted");
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("ticks:                {}", report.ticks);
        println!("ABI calls:            {}", report.abi_calls);
        println!("work-groups executed: {}", report.work_groups_executed);
        println!("dispatches completed: {}", report.dispatches_completed);
        println!("device heap top:      0x{:x}", sim.driver().memory().top());
    }

    if report.hit_tick_limit {
        bail!(
            "tick limit of {} reached with contexts {:?} still parked",
            args.max_ticks, report.parked_contexts
        );
    }
    Ok(())
}

fn write_trace(sim: &Simulation, path: &Path) -> Result<()> {
    let Some(trace) = sim.driver().trace() else {
        return Ok(());
    };
    let json = trace.to_json().context("failed to serialize call trace")?;
    fs::write(path, json).with_context(|| format!("failed to write trace to {}", path.display()))?;
    info!("wrote {} call records to {}", trace.len(), path.display());
    Ok(())
}

fn print_abi_table() {
    println!("{:>4}  name", "code");
    for entry in ABI_TABLE.iter() {
        println!("{:>4}  {}", entry.call.code(), entry.call.name());
    }
}
