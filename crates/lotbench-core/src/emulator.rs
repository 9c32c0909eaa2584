//! The interface to the emulation environment. The environment realizes a [`Topology`] (switches,
//! hosts, links and their impairment profiles), answers connectivity queries, runs background
//! processes on hosts and releases everything on teardown.

use std::io;
use std::path::Path;

use crate::network::{Host, HostId, Topology};

/// An emulation environment.
///
/// An environment realizes at most one topology at a time. Implementations must make
/// [`Emulator::teardown`] safe to call when nothing (or only part of a topology) was realized.
pub trait Emulator {
    /// A process started with [`Emulator::spawn`].
    type Process: BackgroundProcess;

    /// Removes any state left behind by a previous run, including lingering processes.
    fn reset(&mut self) -> Result<(), EmulatorError>;

    /// Creates switches, hosts and links, and applies impairment profiles to bottleneck links.
    fn provision(&mut self, topology: &Topology) -> Result<(), EmulatorError>;

    /// A human-readable summary of how hosts are connected. The default describes the planned
    /// topology; environments that can inspect what they realized should report that instead.
    fn connections(&self, topology: &Topology) -> Result<String, EmulatorError> {
        Ok(topology.connections())
    }

    /// Sends one probe between every ordered pair of hosts.
    fn ping_all(&self, topology: &Topology) -> Result<Reachability, EmulatorError>;

    /// Starts `argv` on `host` without waiting for it. Standard output goes to `sink`.
    fn spawn(
        &mut self,
        host: &Host,
        argv: &[String],
        sink: &Path,
    ) -> Result<Self::Process, EmulatorError>;

    /// Whether something on `host` accepts TCP connections on `port`.
    fn is_listening(&self, host: &Host, port: u16) -> Result<bool, EmulatorError>;

    /// Releases every realized resource and kills any process still attached to it.
    fn teardown(&mut self) -> Result<(), EmulatorError>;
}

/// A handle to a process running inside the environment.
pub trait BackgroundProcess {
    /// Checks whether the process has exited, without blocking.
    fn poll(&mut self) -> Result<ProcessState, EmulatorError>;

    /// Kills the process and reaps it.
    fn kill(&mut self) -> Result<(), EmulatorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited with the given code, or was killed by a signal (`None`).
    Exited(Option<i32>),
}

/// The outcome of an all-pairs reachability probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reachability {
    pub sent: usize,
    pub unreachable: Vec<(HostId, HostId)>,
}

impl Reachability {
    pub fn received(&self) -> usize {
        self.sent.saturating_sub(self.unreachable.len())
    }

    pub fn is_complete(&self) -> bool {
        self.unreachable.is_empty()
    }

    /// The percentage of probes lost.
    pub fn dropped_pct(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        100.0 * self.unreachable.len() as f64 / self.sent as f64
    }
}

/// An error raised by the emulation environment.
#[derive(Debug, thiserror::Error)]
pub enum EmulatorError {
    /// A command exited unsuccessfully.
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    /// The environment has no realized topology.
    #[error("no topology is provisioned")]
    NotProvisioned,

    /// The environment lacks a capability it needs.
    #[error("environment unavailable: {0}")]
    Unavailable(String),

    /// IO error.
    #[error(transparent)]
    Io(#[from] io::Error),
}
