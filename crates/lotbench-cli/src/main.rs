use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use lotbench_cli::Overrides;
use lotbench_core::constants::{
    DEFAULT_PROBE_ATTEMPTS, DEFAULT_PROBE_BACKOFF_MS, DEFAULT_READINESS_GAP_MS,
};
use lotbench_core::{presets, DryRunEmulator, ExperimentConfig, Packets, Readiness};
use netns_frontend::NetnsEmulator;

/// Runs congestion-control experiments on emulated switch chains.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
    /// Workload duration in seconds
    #[arg(long, global = true)]
    duration: Option<u64>,
    /// Extra seconds to wait after the workload before tearing down
    #[arg(long, global = true)]
    grace: Option<u64>,
    /// Directory output files are written to
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    /// How to decide a server is ready before starting its clients
    #[arg(long, global = true, value_enum)]
    readiness: Option<ReadinessMode>,
    /// The gap used by `--readiness gap`, in milliseconds
    #[arg(long, global = true, default_value_t = DEFAULT_READINESS_GAP_MS)]
    gap_ms: u64,
    /// Log what would be done instead of touching the network stack
    #[arg(long, global = true)]
    dry_run: bool,
    /// Prefix of the namespaces and devices created for a run
    #[arg(long, global = true, default_value = netns_frontend::DEFAULT_PREFIX)]
    prefix: String,
    /// Log level; `RUST_LOG` takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: log::LevelFilter,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Three switches, one bulk flow and one latency probe
    ParkingLot {
        /// Congestion-control variant, e.g. cubic or bbr
        variant: String,
        /// Bottleneck queue size in packets
        queue_size: u64,
    },
    /// Two switches, a CUBIC and a BBR flow sharing the bottleneck
    DualSwitch {
        /// Bottleneck queue size in packets
        queue_size: u64,
    },
    /// An experiment described in a JSON or Dhall file
    Run {
        config: PathBuf,
        /// Replaces the queue size of every bottleneck segment
        #[arg(long)]
        queue_size: Option<u64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ReadinessMode {
    /// Wait a fixed gap after launching a server
    Gap,
    /// Poll the server's port with exponential backoff
    Probe,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .parse_default_env()
        .init();

    let (mut config, queue_size): (ExperimentConfig, Option<u64>) = match args.command {
        Cmd::ParkingLot {
            variant,
            queue_size,
        } => (presets::parking_lot(&variant, Packets::new(queue_size)), None),
        Cmd::DualSwitch { queue_size } => (presets::dual_switch(Packets::new(queue_size)), None),
        Cmd::Run { config, queue_size } => (lotbench_cli::read_config(config)?, queue_size),
    };
    let readiness = args.readiness.map(|mode| match mode {
        ReadinessMode::Gap => Readiness::FixedGap {
            gap_ms: args.gap_ms,
        },
        ReadinessMode::Probe => Readiness::Probe {
            attempts: DEFAULT_PROBE_ATTEMPTS,
            backoff_ms: DEFAULT_PROBE_BACKOFF_MS,
        },
    });
    Overrides {
        duration_secs: args.duration,
        grace_secs: args.grace,
        queue_size: queue_size.map(Packets::new),
        output_dir: args.output_dir,
        readiness,
    }
    .apply(&mut config);

    let experiment = config.into_experiment()?;
    info!(
        "Queue size {}, variant {}",
        experiment.queue_size,
        experiment.variant.as_deref().unwrap_or("per flow")
    );
    let result = if args.dry_run {
        lotbench_core::run(&experiment, &mut DryRunEmulator::new())?
    } else {
        let mut emulator = NetnsEmulator::builder().prefix(args.prefix).build();
        lotbench_core::run(&experiment, &mut emulator)?
    };
    for line in lotbench_cli::summarize(&result).lines() {
        info!("{line}");
    }
    Ok(())
}
