//! The experiment orchestrator: provision, verify, launch, wait, reap, tear down.
//!
//! Only a handful of failures abort a run (see [`Error`]). Everything that goes wrong after the
//! environment is provisioned is recorded as a [`RunIssue`] and the run keeps going, so that a
//! single misbehaving generator does not cost the output of the others.

use std::fs;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::emulator::{BackgroundProcess, Emulator, EmulatorError, ProcessState, Reachability};
use crate::experiment::{Experiment, Readiness};
use crate::network::TopologyError;
use crate::units::Packets;
use crate::workload::{FlowId, GeneratorRole, TrafficFlow, WorkloadError};

/// Runs `experiment` on `emulator`.
///
/// Once the environment has been touched, [`Emulator::teardown`] is called exactly once before
/// this function returns or unwinds.
pub fn run<E: Emulator>(
    experiment: &Experiment,
    emulator: &mut E,
) -> Result<ExperimentResult, Error> {
    let flows = experiment.resolve_flows()?;
    fs::create_dir_all(&experiment.output_dir).map_err(|source| Error::OutputDir {
        path: experiment.output_dir.clone(),
        source,
    })?;
    let clock = Instant::now();
    let topology = &experiment.topology;
    let mut session = Session::new(emulator);

    info!(
        "Provisioning {} switches and {} hosts",
        topology.switches().len(),
        topology.hosts().len()
    );
    if let Err(source) = session.reset().and_then(|()| session.provision(topology)) {
        error!("Provisioning failed: {source}");
        let teardown = session.finish().err();
        return Err(Error::EmulationProvision { source, teardown });
    }

    let mut issues = Vec::new();
    match session.connections(topology) {
        Ok(summary) => summary.lines().for_each(|l| info!("{l}")),
        Err(e) => record(&mut issues, RunIssue::ConnectionSummary(e)),
    }
    info!("Testing connectivity between {} hosts", topology.hosts().len());
    let reachability = match session.ping_all(topology) {
        Ok(r) => {
            info!("{} of {} probes received", r.received(), r.sent);
            if !r.is_complete() {
                record(
                    &mut issues,
                    RunIssue::ConnectivityCheckWarning {
                        sent: r.sent,
                        lost: r.unreachable.len(),
                    },
                );
            }
            Some(r)
        }
        Err(e) => {
            record(&mut issues, RunIssue::ConnectivityCheckFailed(e));
            None
        }
    };

    info!("Launching {} flows", flows.len());
    let mut launched = Vec::with_capacity(flows.len());
    for flow in flows {
        let sink = experiment.sink_path(&flow);
        info!(
            "{} ({}): {} {} > {}",
            flow.id,
            flow.role,
            flow.src.id,
            flow.argv.join(" "),
            sink.display()
        );
        let offset = clock.elapsed();
        let process = match session.spawn(&flow.src, &flow.argv, &sink) {
            Ok(process) => Some(process),
            Err(source) => {
                record(
                    &mut issues,
                    RunIssue::FlowLaunchError {
                        flow: flow.id,
                        source,
                    },
                );
                None
            }
        };
        if process.is_some()
            && flow.role == GeneratorRole::Server
            && !await_ready(&*session, &flow, experiment.readiness)
        {
            record(&mut issues, RunIssue::ServerNotReady { flow: flow.id });
        }
        launched.push(Launched {
            launched_at: process.as_ref().map(|_| offset),
            process,
            flow,
            sink,
        });
    }

    let wait = experiment.duration + experiment.grace;
    info!("Waiting {:?} for the workload to finish", wait);
    thread::sleep(wait);

    info!("Reaping {} flows", launched.len());
    let outcomes = launched
        .into_iter()
        .map(|l| reap(l, &mut issues))
        .collect();

    info!("Tearing down");
    if let Err(e) = session.finish() {
        record(&mut issues, RunIssue::TeardownError(e));
    }

    let result = ExperimentResult {
        flows: outcomes,
        reachability,
        issues,
        elapsed: clock.elapsed(),
    };
    info!(
        "Run finished in {:?} with {} issues",
        result.elapsed,
        result.issues.len()
    );
    Ok(result)
}

fn record(issues: &mut Vec<RunIssue>, issue: RunIssue) {
    match std::error::Error::source(&issue) {
        Some(source) => warn!("{issue}: {source}"),
        None => warn!("{issue}"),
    }
    issues.push(issue);
}

fn await_ready<E: Emulator>(emulator: &E, flow: &TrafficFlow, readiness: Readiness) -> bool {
    match readiness {
        Readiness::FixedGap { gap_ms } => {
            thread::sleep(Duration::from_millis(gap_ms));
            true
        }
        Readiness::Probe {
            attempts,
            backoff_ms,
        } => {
            let port = flow.listen_port();
            let mut backoff = Duration::from_millis(backoff_ms);
            for attempt in 1..=attempts {
                match emulator.is_listening(&flow.src, port) {
                    Ok(true) => {
                        debug!("{} is listening on port {port}", flow.id);
                        return true;
                    }
                    Ok(false) => debug!("{} not listening yet (attempt {attempt})", flow.id),
                    Err(e) => debug!("Readiness probe {attempt} for {} failed: {e}", flow.id),
                }
                if attempt < attempts {
                    thread::sleep(backoff);
                    backoff = next_backoff(backoff);
                }
            }
            false
        }
    }
}

fn next_backoff(backoff: Duration) -> Duration {
    backoff.saturating_mul(2)
}

struct Launched<P> {
    flow: TrafficFlow,
    sink: PathBuf,
    launched_at: Option<Duration>,
    process: Option<P>,
}

fn reap<P: BackgroundProcess>(launched: Launched<P>, issues: &mut Vec<RunIssue>) -> FlowOutcome {
    let Launched {
        flow,
        sink,
        launched_at,
        process,
    } = launched;
    let status = match process {
        None => FlowStatus::NotLaunched,
        Some(mut process) => match process.poll() {
            Ok(ProcessState::Exited(code)) => {
                if let Some(code) = code.filter(|&c| c != 0) {
                    record(issues, RunIssue::FlowFailed { flow: flow.id, code });
                }
                FlowStatus::Exited(code)
            }
            Ok(ProcessState::Running) => {
                debug!("Killing {}", flow.id);
                if let Err(source) = process.kill() {
                    record(issues, RunIssue::FlowReapError { flow: flow.id, source });
                }
                FlowStatus::Terminated
            }
            Err(source) => {
                record(issues, RunIssue::FlowReapError { flow: flow.id, source });
                // Best effort; teardown removes whatever is left.
                let _ = process.kill();
                FlowStatus::Unknown
            }
        },
    };
    FlowOutcome {
        flow,
        sink,
        launched_at,
        status,
    }
}

/// Holds the emulator for the duration of a run and tears it down exactly once, either through
/// [`Session::finish`] or when dropped (early return or panic).
struct Session<'a, E: Emulator> {
    emulator: &'a mut E,
    finished: bool,
}

impl<'a, E: Emulator> Session<'a, E> {
    fn new(emulator: &'a mut E) -> Self {
        Self {
            emulator,
            finished: false,
        }
    }

    fn finish(mut self) -> Result<(), EmulatorError> {
        self.finished = true;
        self.emulator.teardown()
    }
}

impl<E: Emulator> Deref for Session<'_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.emulator
    }
}

impl<E: Emulator> DerefMut for Session<'_, E> {
    fn deref_mut(&mut self) -> &mut E {
        self.emulator
    }
}

impl<E: Emulator> Drop for Session<'_, E> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("Run aborted, tearing down");
        if let Err(e) = self.emulator.teardown() {
            error!("Teardown failed: {e}");
        }
    }
}

/// What a run produced.
#[derive(Debug)]
pub struct ExperimentResult {
    /// One outcome per flow, in plan order.
    pub flows: Vec<FlowOutcome>,
    /// `None` if the connectivity check could not run.
    pub reachability: Option<Reachability>,
    pub issues: Vec<RunIssue>,
    pub elapsed: Duration,
}

impl ExperimentResult {
    /// Whether the run completed without any recorded issue.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug)]
pub struct FlowOutcome {
    pub flow: TrafficFlow,
    /// Where the generator's output went.
    pub sink: PathBuf,
    /// Time from the start of the run to the launch.
    pub launched_at: Option<Duration>,
    pub status: FlowStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    NotLaunched,
    /// Exited on its own before reaping. `None` means it died from a signal.
    Exited(Option<i32>),
    /// Still running at reap time and killed.
    Terminated,
    /// Its state could not be determined.
    Unknown,
}

/// A non-fatal problem observed during a run.
#[derive(Debug, thiserror::Error)]
pub enum RunIssue {
    #[error("connection summary unavailable")]
    ConnectionSummary(#[source] EmulatorError),

    #[error("connectivity check lost {lost} of {sent} probes")]
    ConnectivityCheckWarning { sent: usize, lost: usize },

    #[error("connectivity check could not run")]
    ConnectivityCheckFailed(#[source] EmulatorError),

    #[error("server {flow} did not become ready")]
    ServerNotReady { flow: FlowId },

    #[error("failed to launch {flow}")]
    FlowLaunchError {
        flow: FlowId,
        #[source]
        source: EmulatorError,
    },

    #[error("{flow} exited with status {code}")]
    FlowFailed { flow: FlowId, code: i32 },

    #[error("failed to reap {flow}")]
    FlowReapError {
        flow: FlowId,
        #[source]
        source: EmulatorError,
    },

    #[error("teardown failed")]
    TeardownError(#[source] EmulatorError),
}

/// A run-aborting error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The topology could not be built.
    #[error("invalid topology")]
    InvalidTopologySpec(#[from] TopologyError),

    /// No queue size was given and the segments do not share one. Nothing was touched.
    #[error("segments have different queue sizes {0:?}; set a queue size to name output files")]
    MixedQueueSizes(Vec<Packets>),

    /// The workload plan does not fit the topology. Nothing was touched.
    #[error("invalid workload")]
    InvalidWorkload(#[from] WorkloadError),

    /// The output directory could not be created. Nothing was touched.
    #[error("cannot create output directory {path:?}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reset or provisioning failed. Teardown was attempted; its error, if any, is kept.
    #[error("failed to provision the emulation environment")]
    EmulationProvision {
        #[source]
        source: EmulatorError,
        teardown: Option<EmulatorError>,
    },
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use super::*;
    use crate::dry_run::DryRunEmulator;
    use crate::presets;
    use crate::testing::{Call, RecordingEmulator};

    fn quick(mut experiment: Experiment, dir: &tempfile::TempDir) -> Experiment {
        experiment.duration = Duration::from_millis(1);
        experiment.grace = Duration::ZERO;
        experiment.readiness = Readiness::FixedGap { gap_ms: 0 };
        experiment.output_dir = dir.path().to_owned();
        experiment
    }

    fn parking_lot(dir: &tempfile::TempDir) -> anyhow::Result<Experiment> {
        let experiment = presets::parking_lot("cubic", Packets::new(1000)).into_experiment()?;
        Ok(quick(experiment, dir))
    }

    fn teardowns(calls: &[Call]) -> usize {
        calls.iter().filter(|c| **c == Call::Teardown).count()
    }

    #[test]
    fn parking_lot_dry_run_writes_every_sink() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = parking_lot(&dir)?;
        let result = run(&experiment, &mut DryRunEmulator::new())?;
        assert!(result.is_clean(), "{:?}", result.issues);
        let mut files = fs::read_dir(dir.path())?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<Vec<_>, _>>()?;
        files.sort();
        assert_eq!(
            files,
            [
                "flow_cubic_1000.txt",
                "h8_server_cubic_1000.txt",
                "pingResult_cubic_1000.txt"
            ]
        );
        assert!(result
            .flows
            .iter()
            .all(|o| o.status == FlowStatus::Exited(Some(0))));
        Ok(())
    }

    #[test]
    fn flows_launch_in_plan_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = parking_lot(&dir)?;
        let mut emulator = RecordingEmulator::default();
        let result = run(&experiment, &mut emulator)?;
        let calls = emulator.calls();
        let hosts = calls
            .iter()
            .filter_map(|c| match c {
                Call::Spawn { host, .. } => Some(host.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(hosts, ["h8", "h1", "h3"]);
        assert_eq!(calls.first(), Some(&Call::Reset));
        assert_eq!(calls.last(), Some(&Call::Teardown));
        assert_eq!(teardowns(&calls), 1);
        let offsets = result
            .flows
            .iter()
            .map(|o| o.launched_at.unwrap())
            .collect::<Vec<_>>();
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        Ok(())
    }

    #[test]
    fn running_flows_are_killed_at_the_end() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = parking_lot(&dir)?;
        let mut emulator = RecordingEmulator::builder().keep_running(true).build();
        let result = run(&experiment, &mut emulator)?;
        assert!(result
            .flows
            .iter()
            .all(|o| o.status == FlowStatus::Terminated));
        let calls = emulator.calls();
        let kills = calls.iter().filter(|c| matches!(c, Call::Kill(..))).count();
        assert_eq!(kills, 3);
        let first_kill = calls.iter().position(|c| matches!(c, Call::Kill(..)));
        let teardown = calls.iter().position(|c| *c == Call::Teardown);
        assert!(first_kill < teardown);
        Ok(())
    }

    #[test]
    fn invalid_workload_touches_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = presets::parking_lot("cubic", Packets::new(1000));
        config.workload = crate::workload::WorkloadPlan::new(vec![
            crate::workload::FlowTemplate::prober("h1", "h42"),
        ]);
        let experiment = quick(config.into_experiment()?, &dir);
        let mut emulator = RecordingEmulator::default();
        let res = run(&experiment, &mut emulator);
        assert!(matches!(res, Err(Error::InvalidWorkload(..))));
        assert!(emulator.calls().is_empty());
        Ok(())
    }

    #[test]
    fn provision_failure_tears_down_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = parking_lot(&dir)?;
        let mut emulator = RecordingEmulator::builder().fail_provision(true).build();
        let res = run(&experiment, &mut emulator);
        assert!(matches!(
            res,
            Err(Error::EmulationProvision { teardown: None, .. })
        ));
        let calls = emulator.calls();
        assert_eq!(calls, [Call::Reset, Call::Provision, Call::Teardown]);
        Ok(())
    }

    #[test]
    fn teardown_error_after_provision_failure_is_kept() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = parking_lot(&dir)?;
        let mut emulator = RecordingEmulator::builder()
            .fail_provision(true)
            .fail_teardown(true)
            .build();
        let res = run(&experiment, &mut emulator);
        assert!(matches!(
            res,
            Err(Error::EmulationProvision {
                teardown: Some(..),
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn launch_failure_is_recorded_and_the_run_continues() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = parking_lot(&dir)?;
        let mut emulator = RecordingEmulator::builder()
            .fail_spawn_on(vec!["h1".into()])
            .build();
        let result = run(&experiment, &mut emulator)?;
        let statuses = result.flows.iter().map(|o| o.status).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            [
                FlowStatus::Exited(Some(0)),
                FlowStatus::NotLaunched,
                FlowStatus::Exited(Some(0))
            ]
        );
        assert!(matches!(
            result.issues.as_slice(),
            [RunIssue::FlowLaunchError { .. }]
        ));
        assert_eq!(teardowns(&emulator.calls()), 1);
        Ok(())
    }

    #[test]
    fn reset_failure_is_a_provision_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = parking_lot(&dir)?;
        let mut emulator = RecordingEmulator::builder().fail_reset(true).build();
        let res = run(&experiment, &mut emulator);
        assert!(matches!(
            res,
            Err(Error::EmulationProvision { teardown: None, .. })
        ));
        assert_eq!(emulator.calls(), [Call::Reset, Call::Teardown]);
        Ok(())
    }

    #[test]
    fn verification_failures_are_recorded_and_flows_still_run() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = parking_lot(&dir)?;
        let mut emulator = RecordingEmulator::builder()
            .fail_connections(true)
            .fail_ping_all(true)
            .build();
        let result = run(&experiment, &mut emulator)?;
        assert!(matches!(
            result.issues.as_slice(),
            [
                RunIssue::ConnectionSummary(..),
                RunIssue::ConnectivityCheckFailed(..)
            ]
        ));
        assert_eq!(result.reachability, None);
        assert!(result
            .flows
            .iter()
            .all(|o| o.status == FlowStatus::Exited(Some(0))));
        let calls = emulator.calls();
        let spawns = calls
            .iter()
            .filter(|c| matches!(c, Call::Spawn { .. }))
            .count();
        assert_eq!(spawns, 3);
        assert_eq!(teardowns(&calls), 1);
        assert_eq!(calls.last(), Some(&Call::Teardown));
        Ok(())
    }

    #[test]
    fn nonzero_exit_is_a_failed_flow() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = parking_lot(&dir)?;
        let mut emulator = RecordingEmulator::builder().exit_code(1).build();
        let result = run(&experiment, &mut emulator)?;
        assert_eq!(result.issues.len(), 3);
        assert!(result
            .issues
            .iter()
            .all(|i| matches!(i, RunIssue::FlowFailed { code: 1, .. })));
        assert!(result
            .flows
            .iter()
            .all(|o| o.status == FlowStatus::Exited(Some(1))));
        assert_eq!(teardowns(&emulator.calls()), 1);
        Ok(())
    }

    #[test]
    fn teardown_error_is_recorded_after_a_run() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = parking_lot(&dir)?;
        let mut emulator = RecordingEmulator::builder().fail_teardown(true).build();
        let result = run(&experiment, &mut emulator)?;
        assert!(matches!(
            result.issues.as_slice(),
            [RunIssue::TeardownError(..)]
        ));
        assert_eq!(teardowns(&emulator.calls()), 1);
        Ok(())
    }

    #[test]
    fn panic_during_launch_still_tears_down() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = parking_lot(&dir)?;
        let mut emulator = RecordingEmulator::builder().panic_on_spawn(true).build();
        let res = panic::catch_unwind(AssertUnwindSafe(|| run(&experiment, &mut emulator)));
        assert!(res.is_err());
        assert_eq!(teardowns(&emulator.calls()), 1);
        Ok(())
    }

    #[test]
    fn lost_probes_are_a_warning() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = parking_lot(&dir)?;
        let mut emulator = RecordingEmulator::builder().lose_probes(2).build();
        let result = run(&experiment, &mut emulator)?;
        assert!(matches!(
            result.issues.as_slice(),
            [RunIssue::ConnectivityCheckWarning { lost: 2, sent: 56 }]
        ));
        assert_eq!(result.flows.len(), 3);
        Ok(())
    }

    #[test]
    fn probe_readiness_waits_for_the_server() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut experiment = parking_lot(&dir)?;
        experiment.readiness = Readiness::Probe {
            attempts: 4,
            backoff_ms: 1,
        };
        let mut emulator = RecordingEmulator::builder().listening_after(2).build();
        let result = run(&experiment, &mut emulator)?;
        assert!(result.is_clean(), "{:?}", result.issues);
        let calls = emulator.calls();
        let probes = calls
            .iter()
            .filter(|c| matches!(c, Call::IsListening { .. }))
            .count();
        assert_eq!(probes, 3);
        // The client starts only after the last probe.
        let last_probe = calls
            .iter()
            .rposition(|c| matches!(c, Call::IsListening { .. }));
        let client = calls
            .iter()
            .position(|c| matches!(c, Call::Spawn { host, .. } if host == "h1"));
        assert!(last_probe < client);
        Ok(())
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        assert_eq!(
            next_backoff(Duration::from_millis(50)),
            Duration::from_millis(100)
        );
        assert_eq!(next_backoff(Duration::MAX), Duration::MAX);
    }

    #[test]
    fn unready_server_is_recorded() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut experiment = parking_lot(&dir)?;
        experiment.readiness = Readiness::Probe {
            attempts: 2,
            backoff_ms: 1,
        };
        let mut emulator = RecordingEmulator::builder().listening_after(u32::MAX).build();
        let result = run(&experiment, &mut emulator)?;
        assert!(matches!(
            result.issues.as_slice(),
            [RunIssue::ServerNotReady { .. }]
        ));
        assert_eq!(result.flows[1].status, FlowStatus::Exited(Some(0)));
        Ok(())
    }

    #[test]
    fn dual_switch_launches_both_clients() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = presets::dual_switch(Packets::new(100)).into_experiment()?;
        let experiment = quick(experiment, &dir);
        let mut emulator = RecordingEmulator::default();
        let result = run(&experiment, &mut emulator)?;
        let launches = emulator
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Spawn { host, argv, sink } => Some(format!(
                    "{host}: {} > {}",
                    argv.join(" "),
                    sink.file_name().unwrap().to_string_lossy()
                )),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        insta::assert_snapshot!(launches, @r###"
        h3: ping 10.0.0.4 -i 1 -c 1 > h3_ping_result_100
        h2: iperf3 -s -i 1 > h1_server_100
        h1: iperf3 -c 10.0.0.2 -t 1 -C cubic > flow1_cubic_100
        h1: iperf3 -c 10.0.0.2 -t 1 -C bbr > flow2_bbr_100
        "###);
        assert_eq!(result.flows.len(), 4);
        Ok(())
    }
}
