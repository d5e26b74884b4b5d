//! Command-line probe for gpucs devices

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use serde::Serialize;

use gpucs::cs::packet::{decode_stream, PacketHeader};
use gpucs::kgd::msm::MsmKgd;
use gpucs::prelude::*;

#[derive(Parser)]
#[command(name = "gpucs-probe")]
#[command(version = gpucs::VERSION)]
#[command(about = "Probe GPU command submission on msm render nodes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output verbosity
    #[arg(short, long, value_enum, default_value_t = Verbosity::Normal, env = "GPUCS_VERBOSITY")]
    verbosity: Verbosity,

    /// Device configuration (JSON)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Use the in-process null driver instead of a render node
    #[arg(long, global = true)]
    null: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List render nodes
    Devices,

    /// Print device parameters
    Info {
        /// Render node (first msm node if not specified)
        #[arg(short, long)]
        device: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Submit empty command buffers and time the round trip
    Submit {
        /// Render node (first msm node if not specified)
        #[arg(short, long)]
        device: Option<String>,

        /// Number of command buffers per submission
        #[arg(short, long, default_value_t = 1)]
        count: u32,

        /// Number of submissions
        #[arg(short, long, default_value_t = 1)]
        iterations: u32,

        /// Decode the submitted packets (null driver only)
        #[arg(long)]
        dump: bool,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Verbosity {
    Minimal,
    Normal,
    Detailed,
    Debug,
}

impl Verbosity {
    fn level(self) -> LevelFilter {
        match self {
            Verbosity::Minimal => LevelFilter::Error,
            Verbosity::Normal => LevelFilter::Warn,
            Verbosity::Detailed => LevelFilter::Debug,
            Verbosity::Debug => LevelFilter::Trace,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct SubmitReport {
    submissions: u32,
    buffers_per_submission: u32,
    total_us: u128,
    mean_us: f64,
}

fn load_config(path: Option<&str>) -> anyhow::Result<DeviceConfig> {
    match path {
        Some(path) => DeviceConfig::from_json_file(path).with_context(|| format!("loading {path}")),
        None => Ok(DeviceConfig::default()),
    }
}

fn open_device(cli: &Cli, node: Option<&str>) -> anyhow::Result<(Device, Option<Arc<NullKgd>>)> {
    let config = load_config(cli.config.as_deref())?;
    if cli.null {
        let kgd = Arc::new(NullKgd::new());
        return Ok((Device::new(kgd.clone(), config)?, Some(kgd)));
    }
    let kgd = match node {
        Some(node) => MsmKgd::open(node).with_context(|| format!("opening {node}"))?,
        None => gpucs::kgd::msm::open_first().context("no usable msm render node")?,
    };
    Ok((Device::new(Arc::new(kgd), config)?, None))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbosity.level())
        .format_timestamp(None)
        .init();

    match &cli.command {
        Commands::Devices => {
            let devices = gpucs::scan_devices();
            if devices.is_empty() {
                println!("No render nodes found.");
            } else {
                println!("Found {} render node(s):", devices.len());
                for device in devices {
                    println!("  {}", device);
                }
            }
        }

        Commands::Info { device, format } => {
            let (device, _) = open_device(&cli, device.as_deref())?;
            match format {
                OutputFormat::Text => print_info_text(device.info()),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(device.info())?),
            }
        }

        Commands::Submit {
            device,
            count,
            iterations,
            dump,
            format,
        } => {
            if *count == 0 || *iterations == 0 {
                bail!("count and iterations must be non-zero");
            }
            let (device, null) = open_device(&cli, device.as_deref())?;
            let report = run_submit(&device, *count, *iterations)?;
            match format {
                OutputFormat::Text => {
                    println!("{} submission(s) of {} buffer(s)", report.submissions, report.buffers_per_submission);
                    println!("Total: {} us, mean {:.1} us", report.total_us, report.mean_us);
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            if *dump {
                match null.as_ref().and_then(|kgd| kgd.last_submission()) {
                    Some(submission) => dump_packets(&submission.words()),
                    None => eprintln!("--dump needs --null"),
                }
            }
        }
    }

    Ok(())
}

fn run_submit(device: &Device, count: u32, iterations: u32) -> anyhow::Result<SubmitReport> {
    let mut pool = device.create_command_pool()?;
    let handles = pool.allocate(Level::Primary, count)?;
    let mut queue = device.create_queue()?;

    let start = Instant::now();
    for _ in 0..iterations {
        for &handle in &handles {
            let cb = pool.get_mut(handle)?;
            cb.begin(UsageFlags::ONE_TIME_SUBMIT)?;
            cb.end()?;
        }
        queue.submit(&mut pool.get_many_mut(&handles)?, &[], None)?;
        queue.wait_idle()?;
    }
    let total = start.elapsed();

    Ok(SubmitReport {
        submissions: iterations,
        buffers_per_submission: count,
        total_us: total.as_micros(),
        mean_us: total.as_secs_f64() * 1e6 / iterations as f64,
    })
}

fn print_info_text(info: &gpucs::DeviceInfo) {
    println!("GPU Information:");
    println!("================");
    println!("Name: {}", info.name());
    println!("Driver: {}", info.driver);
    println!("GPU ID: {}", info.gpu_id);
    println!("GMEM: {} KiB @ {:#x}", info.gmem_size / 1024, info.gmem_base);

    if let Some(chip_id) = info.chip_id {
        println!("Chip ID: {:#x}", chip_id);
    }
    if let Some(freq) = info.max_freq {
        println!("Max Frequency: {} MHz", freq / 1_000_000);
    }
    if let Some(priorities) = info.priorities {
        println!("Queue Priorities: {}", priorities);
    }
}

fn dump_packets(words: &[u32]) {
    let Some(packets) = decode_stream(words) else {
        println!("(stream does not decode)");
        return;
    };
    for (header, payload) in packets {
        match header {
            PacketHeader::Type4 { reg, count } => println!("PKT4 {:#06x} x{}: {:08x?}", reg, count, payload),
            PacketHeader::Type7 { opcode, count } => println!("PKT7 {:#04x} x{}: {:08x?}", opcode, count, payload),
        }
    }
}
