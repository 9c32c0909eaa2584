//! Workload plans. A plan is an ordered list of [`FlowTemplate`]s which is resolved against a
//! topology into concrete [`TrafficFlow`]s: the generator command line, the hosts involved and
//! the name of the file the generator's output is written to.

use std::collections::HashSet;
use std::time::Duration;

use crate::constants::IPERF3_PORT;
use crate::network::{Host, HostId, Topology};
use crate::units::Packets;

identifier!(FlowId, "flow");

/// What a traffic generator does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorRole {
    /// A bulk-transfer receiver (`iperf3 -s`).
    Server,
    /// A bulk-transfer sender (`iperf3 -c`).
    Client,
    /// A latency probe (`ping`).
    Prober,
}

impl GeneratorRole {
    /// The sink template used when a flow does not name one.
    pub fn default_sink(&self) -> &'static str {
        match self {
            GeneratorRole::Server => "{src}_server_{variant}_{queue}.txt",
            GeneratorRole::Client => "flow_{variant}_{queue}.txt",
            GeneratorRole::Prober => "pingResult_{variant}_{queue}.txt",
        }
    }
}

impl std::fmt::Display for GeneratorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GeneratorRole::Server => "server",
            GeneratorRole::Client => "client",
            GeneratorRole::Prober => "prober",
        };
        write!(f, "{s}")
    }
}

/// One entry of a workload plan.
///
/// The sink is a file name template. Recognized placeholders are `{src}`, `{dst}`, `{role}`,
/// `{variant}` (the run's congestion-control variant), `{cc}` (this flow's variant) and
/// `{queue}` (the run's queue size).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FlowTemplate {
    pub role: GeneratorRole,
    pub src: String,
    #[serde(default)]
    pub dst: Option<String>,
    /// Overrides the run's congestion-control variant for this flow.
    #[serde(default)]
    pub congestion: Option<String>,
    /// Overrides the run's duration for this flow.
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub sink: Option<String>,
}

impl FlowTemplate {
    fn new(role: GeneratorRole, src: &str, dst: Option<&str>) -> Self {
        Self {
            role,
            src: src.to_owned(),
            dst: dst.map(str::to_owned),
            congestion: None,
            duration_secs: None,
            extra_args: Vec::new(),
            sink: None,
        }
    }

    pub fn server(src: &str) -> Self {
        Self::new(GeneratorRole::Server, src, None)
    }

    pub fn client(src: &str, dst: &str) -> Self {
        Self::new(GeneratorRole::Client, src, Some(dst))
    }

    pub fn prober(src: &str, dst: &str) -> Self {
        Self::new(GeneratorRole::Prober, src, Some(dst))
    }

    pub fn with_sink(self, sink: &str) -> Self {
        Self {
            sink: Some(sink.to_owned()),
            ..self
        }
    }

    pub fn with_congestion(self, congestion: &str) -> Self {
        Self {
            congestion: Some(congestion.to_owned()),
            ..self
        }
    }

    pub fn with_args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extra_args: args.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    fn sink_template(&self) -> &str {
        self.sink
            .as_deref()
            .unwrap_or_else(|| self.role.default_sink())
    }
}

/// An ordered sequence of flow templates. Flows are launched in plan order.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct WorkloadPlan(Vec<FlowTemplate>);

impl WorkloadPlan {
    pub fn new(flows: Vec<FlowTemplate>) -> Self {
        Self(flows)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowTemplate> + '_ {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolves every template against `topology`.
    ///
    /// Correctness properties:
    ///
    /// - Every flow names hosts that exist; clients and probers name a destination other than
    ///   their source.
    /// - Every client addresses a host on which a server flow appears earlier in the plan.
    /// - Every client has a congestion-control variant.
    /// - Every sink template contains `{queue}`, and `{variant}` whenever the run has a variant,
    ///   so runs differing in either never write to the same file.
    /// - Rendered sink names are plain file names and are unique within the run.
    pub fn resolve(
        &self,
        topology: &Topology,
        ctx: &PlanContext<'_>,
    ) -> Result<Vec<TrafficFlow>, WorkloadError> {
        let mut servers = HashSet::<HostId>::new();
        let mut sinks = HashSet::new();
        let mut flows = Vec::with_capacity(self.0.len());
        for (i, template) in self.0.iter().enumerate() {
            let id = FlowId::new(i + 1);
            let lookup = |name: &str| {
                topology
                    .host(name)
                    .cloned()
                    .ok_or_else(|| WorkloadError::UnknownHost {
                        flow: id,
                        name: name.to_owned(),
                    })
            };
            let src = lookup(&template.src)?;
            let dst = match (template.role, template.dst.as_deref()) {
                (GeneratorRole::Server, None) => None,
                (GeneratorRole::Server, Some(_)) => {
                    return Err(WorkloadError::ServerWithDestination(id))
                }
                (_, None) => return Err(WorkloadError::MissingDestination(id)),
                (_, Some(name)) => Some(lookup(name)?),
            };
            if let Some(dst) = &dst {
                if dst.id == src.id {
                    return Err(WorkloadError::SelfAddressed(id));
                }
            }
            if template.role == GeneratorRole::Server {
                servers.insert(src.id);
            }
            if let (GeneratorRole::Client, Some(dst)) = (template.role, &dst) {
                // CORRECTNESS: A client must never be launched before the server it addresses.
                if !servers.contains(&dst.id) {
                    return Err(WorkloadError::ClientBeforeServer {
                        flow: id,
                        dst: dst.id,
                    });
                }
            }

            let cc = template.congestion.as_deref().or(ctx.variant);
            let secs = match template.duration_secs {
                // Both generators treat a zero count as "run until killed".
                Some(0) => return Err(WorkloadError::ZeroDuration),
                Some(secs) => secs,
                None => ctx.duration.as_secs().max(1),
            };
            let argv = generator_argv(template, dst.as_ref(), cc, secs)
                .ok_or(WorkloadError::MissingCongestion(id))?;

            let sink = render_sink(template, &src, dst.as_ref(), cc, ctx).map_err(|reason| {
                WorkloadError::InvalidSink {
                    flow: id,
                    template: template.sink_template().to_owned(),
                    reason,
                }
            })?;
            if !sinks.insert(sink.clone()) {
                return Err(WorkloadError::DuplicateSink(sink));
            }

            flows.push(TrafficFlow {
                id,
                role: template.role,
                src,
                dst,
                argv,
                sink,
            });
        }
        Ok(flows)
    }
}

impl FromIterator<FlowTemplate> for WorkloadPlan {
    fn from_iter<T: IntoIterator<Item = FlowTemplate>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Run-wide values a plan is resolved with.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    /// The caller-supplied congestion-control variant, if the run takes one.
    pub variant: Option<&'a str>,
    pub queue: Packets,
    pub duration: Duration,
}

/// A resolved flow: one traffic-generator invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficFlow {
    pub id: FlowId,
    pub role: GeneratorRole,
    pub src: Host,
    pub dst: Option<Host>,
    pub argv: Vec<String>,
    /// The output file name, relative to the run's output directory.
    pub sink: String,
}

impl TrafficFlow {
    /// The port a server flow listens on.
    pub fn listen_port(&self) -> u16 {
        self.argv
            .iter()
            .position(|a| a == "-p" || a == "--port")
            .and_then(|i| self.argv.get(i + 1))
            .and_then(|p| p.parse().ok())
            .unwrap_or(IPERF3_PORT)
    }
}

/// Returns `None` if a client has no congestion-control variant.
fn generator_argv(
    template: &FlowTemplate,
    dst: Option<&Host>,
    cc: Option<&str>,
    secs: u64,
) -> Option<Vec<String>> {
    let dst_ip = || dst.map(|h| h.ip().to_string()).unwrap_or_default();
    let mut argv = match template.role {
        GeneratorRole::Server => vec!["iperf3".into(), "-s".into(), "-i".into(), "1".into()],
        GeneratorRole::Client => vec![
            "iperf3".into(),
            "-c".into(),
            dst_ip(),
            "-t".into(),
            secs.to_string(),
            "-C".into(),
            cc?.to_owned(),
        ],
        GeneratorRole::Prober => vec![
            "ping".into(),
            dst_ip(),
            "-i".into(),
            "1".into(),
            "-c".into(),
            secs.to_string(),
        ],
    };
    argv.extend(template.extra_args.iter().cloned());
    Some(argv)
}

fn render_sink(
    template: &FlowTemplate,
    src: &Host,
    dst: Option<&Host>,
    cc: Option<&str>,
    ctx: &PlanContext<'_>,
) -> Result<String, &'static str> {
    let pattern = template.sink_template();
    if !pattern.contains("{queue}") {
        return Err("must contain {queue}");
    }
    if ctx.variant.is_some() && !pattern.contains("{variant}") {
        return Err("must contain {variant}");
    }
    let variant = ctx.variant.or(cc);
    if (pattern.contains("{variant}") && variant.is_none())
        || (pattern.contains("{cc}") && cc.is_none())
    {
        return Err("uses a congestion-control variant the flow does not have");
    }
    if pattern.contains("{dst}") && dst.is_none() {
        return Err("uses {dst} but the flow has no destination");
    }
    let sink = pattern
        .replace("{src}", &src.name())
        .replace("{dst}", &dst.map(Host::name).unwrap_or_default())
        .replace("{role}", &template.role.to_string())
        .replace("{variant}", variant.unwrap_or_default())
        .replace("{cc}", cc.unwrap_or_default())
        .replace("{queue}", &ctx.queue.to_string());
    if sink.is_empty() || sink.contains('/') {
        return Err("must render to a plain file name");
    }
    Ok(sink)
}

/// Reported before any emulator resource is touched.
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("{flow} refers to unknown host {name}")]
    UnknownHost { flow: FlowId, name: String },

    #[error("{0} needs a destination host")]
    MissingDestination(FlowId),

    #[error("{0} is a server and cannot have a destination")]
    ServerWithDestination(FlowId),

    #[error("{0} addresses its own source host")]
    SelfAddressed(FlowId),

    #[error("{flow} addresses {dst} before any server is started there")]
    ClientBeforeServer { flow: FlowId, dst: HostId },

    #[error("{0} has no congestion-control variant")]
    MissingCongestion(FlowId),

    #[error("sink template {template:?} of {flow} {reason}")]
    InvalidSink {
        flow: FlowId,
        template: String,
        reason: &'static str,
    },

    #[error("two flows write to {0}")]
    DuplicateSink(String),

    #[error("experiment and flow durations must be positive")]
    ZeroDuration,
}
