//! Fixtures and an in-memory [`Emulator`] for tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::builder::TopologyBuilder;
use crate::emulator::{BackgroundProcess, Emulator, EmulatorError, ProcessState, Reachability};
use crate::network::{Host, ImpairmentProfile, Topology, TopologyError};

/// 50 Mbps, 10 ms, lossless, 1000 packets.
pub fn profile() -> ImpairmentProfile {
    ImpairmentProfile::new(50, "10ms", 0.0, 1000)
}

pub fn parking_lot_profiles() -> Vec<ImpairmentProfile> {
    vec![profile(); 2]
}

/// The three-switch parking lot with a fan-out of three (`h1` through `h8`).
pub fn parking_lot_topology() -> Result<Topology, TopologyError> {
    TopologyBuilder::parking_lot().build(3, &parking_lot_profiles())
}

pub fn dual_switch_topology() -> Result<Topology, TopologyError> {
    TopologyBuilder::dual_switch().build(2, &[ImpairmentProfile::new(100, "10ms", 0.0, 1000)])
}

/// A call made on a [`RecordingEmulator`] or one of its processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Reset,
    Provision,
    Connections,
    PingAll,
    Spawn {
        host: String,
        argv: Vec<String>,
        sink: PathBuf,
    },
    IsListening {
        host: String,
        port: u16,
    },
    /// Carries the spawn index of the process.
    Poll(usize),
    Kill(usize),
    Teardown,
}

/// Records every call and fails on demand. Processes exit with `exit_code` as soon as they are
/// polled unless `keep_running` is set.
#[derive(Debug, Default, typed_builder::TypedBuilder)]
pub struct RecordingEmulator {
    #[builder(default, setter(skip))]
    calls: Arc<Mutex<Vec<Call>>>,
    #[builder(default, setter(skip))]
    probes: AtomicU32,
    #[builder(default, setter(skip))]
    spawned: usize,
    #[builder(default)]
    fail_reset: bool,
    #[builder(default)]
    fail_provision: bool,
    #[builder(default)]
    fail_teardown: bool,
    #[builder(default)]
    fail_connections: bool,
    #[builder(default)]
    fail_ping_all: bool,
    /// Host names on which `spawn` fails.
    #[builder(default)]
    fail_spawn_on: Vec<String>,
    #[builder(default)]
    panic_on_spawn: bool,
    /// How many host pairs the connectivity check reports as unreachable.
    #[builder(default)]
    lose_probes: usize,
    /// How many readiness probes answer "not listening" before one succeeds.
    #[builder(default)]
    listening_after: u32,
    #[builder(default)]
    keep_running: bool,
    #[builder(default)]
    exit_code: i32,
}

impl RecordingEmulator {
    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: Call) {
        record(&self.calls, call)
    }

    fn failure(what: &str) -> EmulatorError {
        EmulatorError::Command {
            command: what.to_owned(),
            stderr: "injected failure".to_owned(),
        }
    }
}

fn record(calls: &Mutex<Vec<Call>>, call: Call) {
    calls
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(call);
}

impl Emulator for RecordingEmulator {
    type Process = RecordingProcess;

    fn reset(&mut self) -> Result<(), EmulatorError> {
        self.record(Call::Reset);
        if self.fail_reset {
            return Err(Self::failure("reset"));
        }
        Ok(())
    }

    fn provision(&mut self, _topology: &Topology) -> Result<(), EmulatorError> {
        self.record(Call::Provision);
        if self.fail_provision {
            return Err(Self::failure("provision"));
        }
        Ok(())
    }

    fn connections(&self, topology: &Topology) -> Result<String, EmulatorError> {
        self.record(Call::Connections);
        if self.fail_connections {
            return Err(Self::failure("connections"));
        }
        Ok(topology.connections())
    }

    fn ping_all(&self, topology: &Topology) -> Result<Reachability, EmulatorError> {
        self.record(Call::PingAll);
        if self.fail_ping_all {
            return Err(Self::failure("ping_all"));
        }
        let pairs = topology.host_pairs().collect::<Vec<_>>();
        Ok(Reachability {
            sent: pairs.len(),
            unreachable: pairs
                .iter()
                .take(self.lose_probes)
                .map(|(x, y)| (x.id, y.id))
                .collect(),
        })
    }

    fn spawn(
        &mut self,
        host: &Host,
        argv: &[String],
        sink: &Path,
    ) -> Result<Self::Process, EmulatorError> {
        self.record(Call::Spawn {
            host: host.name(),
            argv: argv.to_vec(),
            sink: sink.to_owned(),
        });
        if self.panic_on_spawn {
            panic!("injected panic while spawning on {}", host.id);
        }
        if self.fail_spawn_on.contains(&host.name()) {
            return Err(Self::failure("spawn"));
        }
        let index = self.spawned;
        self.spawned += 1;
        Ok(RecordingProcess {
            index,
            running: self.keep_running,
            exit_code: self.exit_code,
            calls: Arc::clone(&self.calls),
        })
    }

    fn is_listening(&self, host: &Host, port: u16) -> Result<bool, EmulatorError> {
        self.record(Call::IsListening {
            host: host.name(),
            port,
        });
        Ok(self.probes.fetch_add(1, Ordering::SeqCst) >= self.listening_after)
    }

    fn teardown(&mut self) -> Result<(), EmulatorError> {
        self.record(Call::Teardown);
        if self.fail_teardown {
            return Err(Self::failure("teardown"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RecordingProcess {
    index: usize,
    running: bool,
    exit_code: i32,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl BackgroundProcess for RecordingProcess {
    fn poll(&mut self) -> Result<ProcessState, EmulatorError> {
        record(&self.calls, Call::Poll(self.index));
        Ok(if self.running {
            ProcessState::Running
        } else {
            ProcessState::Exited(Some(self.exit_code))
        })
    }

    fn kill(&mut self) -> Result<(), EmulatorError> {
        record(&self.calls, Call::Kill(self.index));
        self.running = false;
        Ok(())
    }
}
