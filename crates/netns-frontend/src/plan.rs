//! Translation of a topology into `ip` and `tc` invocations.

use lotbench_core::network::{
    Endpoint, Host, HostId, ImpairmentProfile, Interface, RateLimiter, SwitchId, Topology,
    HOST_PREFIX_LEN,
};

/// The Linux limit on network device names.
pub(crate) const MAX_IFNAME_LEN: usize = 15;

/// Something provisioning created and teardown must remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resource {
    Namespace(String),
    /// A bridge or a veth pair, named by its root-namespace end.
    Link(String),
}

/// One command of a provisioning plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Step {
    pub(crate) argv: Vec<String>,
    pub(crate) creates: Option<Resource>,
}

impl Step {
    fn run(argv: Vec<String>) -> Self {
        Self {
            argv,
            creates: None,
        }
    }

    fn creating(argv: Vec<String>, resource: Resource) -> Self {
        Self {
            argv,
            creates: Some(resource),
        }
    }
}

/// Maps topology nodes to kernel object names. Every name in the root namespace starts with
/// `{prefix}-`, which is how stale objects are found again.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Naming<'a> {
    pub(crate) prefix: &'a str,
}

impl Naming<'_> {
    pub(crate) fn namespace(&self, host: HostId) -> String {
        format!("{}-{host}", self.prefix)
    }

    pub(crate) fn bridge(&self, switch: SwitchId) -> String {
        format!("{}-{switch}", self.prefix)
    }

    /// Host-side devices live inside the host's namespace and keep the plain name.
    pub(crate) fn device(&self, iface: &Interface) -> String {
        match iface.node {
            Endpoint::Host(_) => iface.to_string(),
            Endpoint::Switch(_) => format!("{}-{iface}", self.prefix),
        }
    }

    pub(crate) fn owns(&self, name: &str) -> bool {
        name.strip_prefix(self.prefix)
            .map_or(false, |rest| rest.starts_with('-'))
    }
}

macro_rules! argv {
    ($($arg:expr),* $(,)?) => {
        vec![$($arg.to_string()),*]
    };
}

/// The commands that realize `topology`, in execution order.
pub(crate) fn provision_plan(topology: &Topology, naming: Naming<'_>) -> Vec<Step> {
    let mut steps = Vec::new();
    for switch in topology.switches() {
        let bridge = naming.bridge(switch.id);
        steps.push(Step::creating(
            argv!["ip", "link", "add", bridge, "type", "bridge"],
            Resource::Link(bridge.clone()),
        ));
        steps.push(Step::run(argv!["ip", "link", "set", bridge, "up"]));
    }
    for host in topology.hosts() {
        let ns = naming.namespace(host.id);
        steps.push(Step::creating(
            argv!["ip", "netns", "add", ns],
            Resource::Namespace(ns.clone()),
        ));
        steps.push(Step::run(argv!["ip", "-n", ns, "link", "set", "lo", "up"]));
    }
    for (link, (x, y)) in topology.links().iter().zip(topology.interfaces()) {
        match (x.node, y.node) {
            (Endpoint::Host(h), Endpoint::Switch(s)) => {
                access_steps(&mut steps, naming, h, s, &x, &y)
            }
            (Endpoint::Switch(s), Endpoint::Host(h)) => {
                access_steps(&mut steps, naming, h, s, &y, &x)
            }
            (Endpoint::Switch(sx), Endpoint::Switch(sy)) => {
                let (dx, dy) = (naming.device(&x), naming.device(&y));
                steps.push(Step::creating(
                    argv!["ip", "link", "add", dx, "type", "veth", "peer", "name", dy],
                    Resource::Link(dx.clone()),
                ));
                for (dev, switch) in [(&dx, sx), (&dy, sy)] {
                    steps.push(Step::run(argv![
                        "ip",
                        "link",
                        "set",
                        dev,
                        "master",
                        naming.bridge(switch)
                    ]));
                    steps.push(Step::run(argv!["ip", "link", "set", dev, "up"]));
                }
                if let Some(profile) = &link.profile {
                    for dev in [&dx, &dy] {
                        steps.extend(shaping_commands(dev, profile).into_iter().map(Step::run));
                    }
                }
            }
            // Rejected when the topology is built.
            (Endpoint::Host(_), Endpoint::Host(_)) => {}
        }
    }
    steps
}

fn access_steps(
    steps: &mut Vec<Step>,
    naming: Naming<'_>,
    host: HostId,
    switch: SwitchId,
    host_if: &Interface,
    switch_if: &Interface,
) {
    let ns = naming.namespace(host);
    let (hdev, sdev) = (naming.device(host_if), naming.device(switch_if));
    let addr = format!("{}/{HOST_PREFIX_LEN}", Host::new(host, switch).ip());
    steps.push(Step::creating(
        argv!["ip", "link", "add", sdev, "type", "veth", "peer", "name", hdev, "netns", ns],
        Resource::Link(sdev.clone()),
    ));
    steps.push(Step::run(argv![
        "ip",
        "link",
        "set",
        sdev,
        "master",
        naming.bridge(switch)
    ]));
    steps.push(Step::run(argv!["ip", "link", "set", sdev, "up"]));
    steps.push(Step::run(argv!["ip", "-n", ns, "addr", "add", addr, "dev", hdev]));
    steps.push(Step::run(argv!["ip", "-n", ns, "link", "set", hdev, "up"]));
}

/// The `tc` commands that shape egress on `dev` according to `profile`.
///
/// With HTB the rate is enforced by a token bucket and netem is chained below it for delay, loss
/// and the queue limit. Without it netem does everything, including the rate.
pub fn shaping_commands(dev: &str, profile: &ImpairmentProfile) -> Vec<Vec<String>> {
    let rate = format!("{}mbit", profile.bandwidth.into_u64());
    let mut netem = argv!["netem", "delay", profile.delay];
    if profile.loss > 0.0 {
        netem.extend(argv!["loss", format!("{}%", profile.loss)]);
    }
    match profile.discipline {
        RateLimiter::Htb => {
            netem.extend(argv!["limit", profile.max_queue]);
            vec![
                argv![
                    "tc", "qdisc", "add", "dev", dev, "root", "handle", "5:0", "htb", "default",
                    "1"
                ],
                argv![
                    "tc", "class", "add", "dev", dev, "parent", "5:0", "classid", "5:1", "htb",
                    "rate", rate, "burst", "15k"
                ],
                [argv!["tc", "qdisc", "add", "dev", dev, "parent", "5:1", "handle", "10:"], netem]
                    .concat(),
            ]
        }
        RateLimiter::None => {
            netem.extend(argv!["rate", rate, "limit", profile.max_queue]);
            vec![[argv!["tc", "qdisc", "add", "dev", dev, "root", "handle", "10:"], netem].concat()]
        }
    }
}

/// Every name the plan would create that is too long for the kernel.
pub(crate) fn overlong_names(steps: &[Step]) -> Vec<&str> {
    steps
        .iter()
        .filter_map(|s| match &s.creates {
            Some(Resource::Link(name)) => Some(name.as_str()),
            _ => None,
        })
        .filter(|name| name.len() > MAX_IFNAME_LEN)
        .collect()
}
