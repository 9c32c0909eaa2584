#![warn(unreachable_pub, missing_debug_implementations)]

//! The core lotbench library. This crate builds [parking-lot topologies](TopologyBuilder),
//! resolves [workload plans](WorkloadPlan) against them, and defines [the routine](run::run)
//! that drives an [`Emulator`] through one experiment.

#[macro_use]
mod ident;

pub mod builder;
pub mod constants;
pub mod dry_run;
pub mod emulator;
pub mod experiment;
pub mod network;
pub mod presets;
pub mod run;
pub mod testing;
pub mod units;
pub mod workload;

pub use builder::{Shape, TopologyBuilder};
pub use dry_run::DryRunEmulator;
pub use emulator::{BackgroundProcess, Emulator, EmulatorError, ProcessState, Reachability};
pub use experiment::{Experiment, ExperimentConfig, Readiness};
pub use network::{
    Host, HostId, ImpairmentProfile, RateLimiter, Switch, SwitchId, Topology, TopologyError,
};
pub use run::{run, Error, ExperimentResult, FlowOutcome, FlowStatus, RunIssue};
pub use units::{Delay, Mbps, Packets};
pub use workload::{FlowId, FlowTemplate, GeneratorRole, TrafficFlow, WorkloadError, WorkloadPlan};
