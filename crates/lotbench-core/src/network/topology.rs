use std::collections::HashMap;
use std::fmt::Write;

use itertools::Itertools;
use petgraph::graph::{NodeIndex, UnGraph};

use crate::network::types::{Endpoint, Host, HostId, Link, Switch, SwitchId};

/// A switch chain with attached hosts. Topologies are immutable once constructed.
#[derive(Debug, Clone)]
pub struct Topology {
    switches: Vec<Switch>,
    hosts: Vec<Host>,
    links: Vec<Link>,
    graph: UnGraph<Endpoint, usize>,
}

impl Topology {
    /// Creates a topology from switches (in chain order), hosts and links. This function returns
    /// an error if the parts do not form a valid topology.
    ///
    /// Correctness properties:
    ///
    /// - There is at least one switch, and switch positions follow declaration order.
    /// - Every switch and host has a unique ID.
    /// - Every host is bound to a declared switch.
    /// - Every link has distinct, declared endpoints, and no two links join the same pair.
    /// - Hosts are never linked to each other.
    /// - Only switch-to-switch links carry an impairment profile, and each profile is in range.
    /// - Every host has exactly one link, and it leads to the host's switch.
    /// - The switch subgraph is a simple path in declaration order.
    pub fn new(switches: Vec<Switch>, hosts: Vec<Host>, links: Vec<Link>) -> Result<Self, Error> {
        if switches.is_empty() {
            return Err(Error::NoSwitches);
        }
        let mut g = UnGraph::new_undirected();
        let mut idx_of = HashMap::new();
        for (position, switch) in switches.iter().enumerate() {
            // CORRECTNESS: Switch positions follow declaration order.
            if switch.position != position {
                return Err(Error::MisplacedSwitch {
                    id: switch.id,
                    position: switch.position,
                });
            }
            let endpoint = Endpoint::Switch(switch.id);
            // CORRECTNESS: Every switch must have a unique ID.
            if idx_of.insert(endpoint, g.add_node(endpoint)).is_some() {
                return Err(Error::DuplicateNode(endpoint));
            }
        }
        for host in &hosts {
            // CORRECTNESS: Every host is bound to a declared switch.
            if !idx_of.contains_key(&Endpoint::Switch(host.switch)) {
                return Err(Error::UndeclaredNode(host.switch.into()));
            }
            let endpoint = Endpoint::Host(host.id);
            // CORRECTNESS: Every host must have a unique ID.
            if idx_of.insert(endpoint, g.add_node(endpoint)).is_some() {
                return Err(Error::DuplicateNode(endpoint));
            }
        }
        for (i, link) in links.iter().enumerate() {
            let Link { a, b, .. } = *link;
            // CORRECTNESS: Every link must have distinct endpoints that were declared.
            if a == b {
                return Err(Error::NodeAdjacentSelf(a));
            }
            let (&ia, &ib) = match (idx_of.get(&a), idx_of.get(&b)) {
                (Some(ia), Some(ib)) => (ia, ib),
                (None, _) => return Err(Error::UndeclaredNode(a)),
                (_, None) => return Err(Error::UndeclaredNode(b)),
            };
            if !a.is_switch() && !b.is_switch() {
                return Err(Error::HostToHostLink { a, b });
            }
            // CORRECTNESS: Only bottleneck links carry a profile, and it must be in range.
            match &link.profile {
                Some(_) if !link.is_bottleneck() => {
                    return Err(Error::ProfileOnAccessLink { a, b });
                }
                Some(profile) => {
                    if let Some(reason) = profile.check() {
                        return Err(Error::InvalidProfile { a, b, reason });
                    }
                }
                None => {}
            }
            // CORRECTNESS: For any two nodes, there must be at most one link between them.
            if g.find_edge(ia, ib).is_some() {
                return Err(Error::DuplicateLink { a, b });
            }
            g.add_edge(ia, ib, i);
        }
        for host in &hosts {
            // CORRECTNESS: Every host has exactly one link, to its own switch.
            let idx = idx_of[&Endpoint::Host(host.id)];
            let neighbors = g.neighbors(idx).collect::<Vec<_>>();
            if neighbors.len() != 1 {
                return Err(Error::HostLinkCount {
                    id: host.id,
                    n: neighbors.len(),
                });
            }
            if g[neighbors[0]] != Endpoint::Switch(host.switch) {
                return Err(Error::HostMisattached {
                    id: host.id,
                    expected: host.switch,
                });
            }
        }
        // CORRECTNESS: The switch subgraph is a simple path in declaration order.
        let nr_bottlenecks = links.iter().filter(|l| l.is_bottleneck()).count();
        let chained = switches.iter().tuple_windows().all(|(x, y)| {
            let ix = idx_of[&Endpoint::Switch(x.id)];
            let iy = idx_of[&Endpoint::Switch(y.id)];
            g.find_edge(ix, iy).is_some()
        });
        if !chained || nr_bottlenecks != switches.len() - 1 {
            return Err(Error::NotAChain);
        }
        Ok(Self {
            switches,
            hosts,
            links,
            graph: g,
        })
    }

    pub fn switches(&self) -> &[Switch] {
        &self.switches
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Looks up a host by name, e.g. `h8`.
    pub fn host(&self, name: &str) -> Option<&Host> {
        let id = HostId::from_name(name)?;
        self.hosts.iter().find(|h| h.id == id)
    }

    pub fn hosts_on(&self, switch: SwitchId) -> impl Iterator<Item = &Host> + '_ {
        self.hosts.iter().filter(move |h| h.switch == switch)
    }

    pub fn bottlenecks(&self) -> impl Iterator<Item = &Link> + '_ {
        self.links.iter().filter(|l| l.is_bottleneck())
    }

    /// The number of hosts attached to each switch, in chain order.
    pub fn partition(&self) -> Vec<usize> {
        self.switches
            .iter()
            .map(|s| self.hosts_on(s.id).count())
            .collect()
    }

    /// All ordered pairs of distinct hosts.
    pub fn host_pairs(&self) -> impl Iterator<Item = (&Host, &Host)> + '_ {
        self.hosts
            .iter()
            .cartesian_product(self.hosts.iter())
            .filter(|(x, y)| x.id != y.id)
    }

    /// The interfaces at both ends of every link, in link order. Ports are numbered per node in
    /// the order links were declared; host ports start at 0 and switch ports at 1.
    pub fn interfaces(&self) -> Vec<(Interface, Interface)> {
        let mut next_port = HashMap::new();
        let mut port_for = |node: Endpoint| {
            let port = next_port.entry(node).or_insert(match node {
                Endpoint::Host(_) => 0,
                Endpoint::Switch(_) => 1,
            });
            let iface = Interface { node, port: *port };
            *port += 1;
            iface
        };
        self.links
            .iter()
            .map(|l| (port_for(l.a), port_for(l.b)))
            .collect()
    }

    /// A per-host summary of which switch port each host interface is plugged into.
    pub fn connections(&self) -> String {
        let mut s = String::new();
        let interfaces = self.interfaces();
        for host in &self.hosts {
            write!(s, "{}", host.id).unwrap();
            for (x, y) in &interfaces {
                if x.node == Endpoint::Host(host.id) {
                    write!(s, " {x}:{y}").unwrap();
                } else if y.node == Endpoint::Host(host.id) {
                    write!(s, " {y}:{x}").unwrap();
                }
            }
            writeln!(s).unwrap();
        }
        s
    }

    /// The link joining two nodes, if any.
    pub fn link_between(&self, x: Endpoint, y: Endpoint) -> Option<&Link> {
        let find = |e: Endpoint| self.graph.node_indices().find(|&i| self.graph[i] == e);
        let (ix, iy): (NodeIndex, NodeIndex) = (find(x)?, find(y)?);
        let eidx = self.graph.find_edge(ix, iy)?;
        Some(&self.links[self.graph[eidx]])
    }
}

/// A numbered port on a node, rendered as e.g. `s1-eth2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interface {
    pub node: Endpoint,
    pub port: usize,
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-eth{}", self.node, self.port)
    }
}

/// Reported as `InvalidTopologySpec` by the orchestrator. No partial topology is ever returned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fan-out must be positive")]
    ZeroFanOut,

    #[error("a switch chain needs at least two switches (got {0})")]
    TooFewSwitches(usize),

    #[error("expected {expected} segment profiles, got {got}")]
    ProfileCountMismatch { expected: usize, got: usize },

    #[error("topology has no switches")]
    NoSwitches,

    #[error("switch {id} declared at chain position {position}")]
    MisplacedSwitch { id: SwitchId, position: usize },

    #[error("duplicate node {0}")]
    DuplicateNode(Endpoint),

    #[error("node {0} is connected to itself")]
    NodeAdjacentSelf(Endpoint),

    #[error("node {0} is not declared")]
    UndeclaredNode(Endpoint),

    #[error("hosts {a} and {b} are linked directly")]
    HostToHostLink { a: Endpoint, b: Endpoint },

    #[error("access link {a}-{b} carries an impairment profile")]
    ProfileOnAccessLink { a: Endpoint, b: Endpoint },

    #[error("invalid profile on {a}-{b}: {reason}")]
    InvalidProfile {
        a: Endpoint,
        b: Endpoint,
        reason: &'static str,
    },

    #[error("duplicate links between {a} and {b}")]
    DuplicateLink { a: Endpoint, b: Endpoint },

    #[error("host {id} has {n} links (expected 1)")]
    HostLinkCount { id: HostId, n: usize },

    #[error("host {id} is not linked to its switch {expected}")]
    HostMisattached { id: HostId, expected: SwitchId },

    #[error("switches do not form a chain")]
    NotAChain,
}
