//! This module defines experiments ([`Experiment`]): a topology, a workload plan and the run-wide
//! parameters shared by building and running. [`ExperimentConfig`] is the serializable form read
//! from configuration files and produced by the [presets](crate::presets).

use std::path::PathBuf;
use std::time::Duration;

use itertools::Itertools;

use crate::builder::{Shape, TopologyBuilder};
use crate::constants::{DEFAULT_PROBE_ATTEMPTS, DEFAULT_PROBE_BACKOFF_MS};
use crate::network::{ImpairmentProfile, Topology};
use crate::run::Error;
use crate::units::Packets;
use crate::workload::{PlanContext, TrafficFlow, WorkloadError, WorkloadPlan};

/// An experiment. Immutable once built; [`run`](crate::run::run) only reads it.
#[derive(Debug, typed_builder::TypedBuilder)]
pub struct Experiment {
    /// The topology to realize.
    pub topology: Topology,
    /// Flows to launch, in order.
    pub workload: WorkloadPlan,
    /// How long the workload runs.
    pub duration: Duration,
    /// Extra time to wait after `duration` before tearing down.
    #[builder(default)]
    pub grace: Duration,
    /// The congestion-control variant, if the experiment takes one from the caller.
    #[builder(default, setter(into))]
    pub variant: Option<String>,
    /// The bottleneck queue size. Only used for naming output files; the profiles already
    /// carry it.
    pub queue_size: Packets,
    /// Where output sinks are created.
    #[builder(default = PathBuf::from("."), setter(into))]
    pub output_dir: PathBuf,
    /// How to decide a server is ready for clients.
    #[builder(default)]
    pub readiness: Readiness,
}

impl Experiment {
    /// Resolves the workload plan into concrete flows.
    pub fn resolve_flows(&self) -> Result<Vec<TrafficFlow>, WorkloadError> {
        if self.duration.is_zero() {
            return Err(WorkloadError::ZeroDuration);
        }
        let ctx = PlanContext {
            variant: self.variant.as_deref(),
            queue: self.queue_size,
            duration: self.duration,
        };
        self.workload.resolve(&self.topology, &ctx)
    }

    /// The full path of a flow's output file.
    pub fn sink_path(&self, flow: &TrafficFlow) -> PathBuf {
        self.output_dir.join(&flow.sink)
    }
}

/// How the orchestrator decides a server flow can accept connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Readiness {
    /// Wait a fixed time after launching the server.
    FixedGap { gap_ms: u64 },
    /// Ask the emulator whether the server's port is listening, backing off exponentially
    /// between attempts.
    Probe { attempts: u32, backoff_ms: u64 },
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::Probe {
            attempts: DEFAULT_PROBE_ATTEMPTS,
            backoff_ms: DEFAULT_PROBE_BACKOFF_MS,
        }
    }
}

/// The serializable description of an experiment.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub shape: Shape,
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
    /// One profile per bottleneck segment, in chain order.
    pub segments: Vec<ImpairmentProfile>,
    pub workload: WorkloadPlan,
    pub duration_secs: u64,
    #[serde(default)]
    pub grace_secs: u64,
    #[serde(default)]
    pub variant: Option<String>,
    /// The queue size output files are named after. When absent, every segment must share the
    /// same queue length and that one is used.
    #[serde(default)]
    pub queue_size: Option<Packets>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub readiness: Readiness,
}

fn default_fan_out() -> usize {
    3
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

impl ExperimentConfig {
    /// Sets the queue length of every segment and names output files after it.
    pub fn set_queue_size(&mut self, queue_size: Packets) {
        for segment in &mut self.segments {
            segment.max_queue = queue_size;
        }
        self.queue_size = Some(queue_size);
    }

    /// Builds the topology and returns the experiment. Segment profiles are used as given.
    ///
    /// Fails with [`Error::InvalidTopologySpec`] without building anything if the shape, fan-out
    /// and segments do not fit together, and with [`Error::MixedQueueSizes`] if no queue size is
    /// set and the segments disagree on one.
    pub fn into_experiment(self) -> Result<Experiment, Error> {
        let topology = TopologyBuilder::builder()
            .shape(self.shape)
            .build()
            .build(self.fan_out, &self.segments)?;
        let queue_size = match self.queue_size {
            Some(queue_size) => queue_size,
            None => shared_queue(&self.segments)?,
        };
        Ok(Experiment::builder()
            .topology(topology)
            .workload(self.workload)
            .duration(Duration::from_secs(self.duration_secs))
            .grace(Duration::from_secs(self.grace_secs))
            .variant(self.variant)
            .queue_size(queue_size)
            .output_dir(self.output_dir)
            .readiness(self.readiness)
            .build())
    }
}

fn shared_queue(segments: &[ImpairmentProfile]) -> Result<Packets, Error> {
    let queues = segments
        .iter()
        .map(|s| s.max_queue)
        .unique()
        .collect::<Vec<_>>();
    match queues.as_slice() {
        [queue] => Ok(*queue),
        _ => Err(Error::MixedQueueSizes(queues)),
    }
}
