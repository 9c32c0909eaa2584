//! Builds parking-lot topologies: a chain of switches with blocks of hosts hanging off each one.
//!
//! ```text
//!         h2      h4      h6
//!         |       |       |
//! h1 --- s1 ---- s2 ---- s3 --- h8
//!         |       |       |
//!         h3      h5      h7
//! ```

use crate::network::{
    topology::Error, Host, HostId, ImpairmentProfile, Link, Switch, SwitchId, Topology,
};

/// The shape of the switch chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Shape {
    /// `switches` switches in a chain. The first and last switch get `fan_out` hosts each, every
    /// interior switch gets `fan_out - 1`.
    ParkingLot { switches: usize },
    /// Two switches with two hosts each (`h1`, `h3` on `s1`; `h2`, `h4` on `s2`), regardless of
    /// fan-out.
    DualSwitch,
}

impl Default for Shape {
    fn default() -> Self {
        Shape::ParkingLot { switches: 3 }
    }
}

impl Shape {
    pub fn nr_switches(&self) -> usize {
        match *self {
            Shape::ParkingLot { switches } => switches,
            Shape::DualSwitch => 2,
        }
    }

    /// The number of bottleneck segments, which is also the number of profiles `build` expects.
    pub fn nr_segments(&self) -> usize {
        self.nr_switches().saturating_sub(1)
    }
}

/// Produces [`Topology`] descriptors. Building has no side effects, and identical parameters
/// always yield identical switch and host names.
#[derive(Debug, Clone, Default, typed_builder::TypedBuilder)]
pub struct TopologyBuilder {
    #[builder(default)]
    shape: Shape,
}

impl TopologyBuilder {
    /// The three-switch parking lot.
    pub fn parking_lot() -> Self {
        Self::default()
    }

    /// The fixed two-switch testbed.
    pub fn dual_switch() -> Self {
        Self {
            shape: Shape::DualSwitch,
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Builds the topology. Segment `i` of `segment_profiles` is attached to the link between
    /// switch `i` and switch `i + 1`.
    ///
    /// Fails if `fan_out` is zero, the chain is shorter than two switches, or the number of
    /// profiles does not match the number of segments.
    pub fn build(
        &self,
        fan_out: usize,
        segment_profiles: &[ImpairmentProfile],
    ) -> Result<Topology, Error> {
        if fan_out == 0 {
            return Err(Error::ZeroFanOut);
        }
        let nr_switches = self.shape.nr_switches();
        if nr_switches < 2 {
            return Err(Error::TooFewSwitches(nr_switches));
        }
        let expected = self.shape.nr_segments();
        if segment_profiles.len() != expected {
            return Err(Error::ProfileCountMismatch {
                expected,
                got: segment_profiles.len(),
            });
        }

        let switches = (0..nr_switches)
            .map(|pos| Switch::new(SwitchId::new(pos + 1), pos))
            .collect::<Vec<_>>();
        let hosts = match self.shape {
            Shape::ParkingLot { .. } => parking_lot_hosts(&switches, fan_out),
            Shape::DualSwitch => dual_switch_hosts(),
        };

        // Bottlenecks first, so each switch's first port faces the chain.
        let mut links = switches
            .windows(2)
            .zip(segment_profiles)
            .map(|(pair, profile)| Link::new_bottleneck(pair[0].id, pair[1].id, profile.clone()))
            .collect::<Vec<_>>();
        links.extend(hosts.iter().map(|h| Link::new_access(h.id, h.switch)));

        Topology::new(switches, hosts, links)
    }
}

fn parking_lot_hosts(switches: &[Switch], fan_out: usize) -> Vec<Host> {
    let last = switches.len() - 1;
    let mut hosts = Vec::new();
    for (pos, switch) in switches.iter().enumerate() {
        let block = if pos == 0 || pos == last {
            fan_out
        } else {
            fan_out - 1
        };
        for _ in 0..block {
            hosts.push(Host::new(HostId::new(hosts.len() + 1), switch.id));
        }
    }
    hosts
}

fn dual_switch_hosts() -> Vec<Host> {
    let (s1, s2) = (SwitchId::new(1), SwitchId::new(2));
    [(1, s1), (3, s1), (2, s2), (4, s2)]
        .into_iter()
        .map(|(h, s)| Host::new(HostId::new(h), s))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Endpoint;
    use crate::testing;
    use crate::units::{Mbps, Packets};

    fn names(topo: &Topology) -> (Vec<String>, Vec<String>) {
        (
            topo.switches().iter().map(|s| s.name()).collect(),
            topo.hosts().iter().map(|h| h.name()).collect(),
        )
    }

    #[test]
    fn parking_lot_partition_holds_for_fan_outs() {
        let profiles = testing::parking_lot_profiles();
        for n in 1..=6 {
            let topo = TopologyBuilder::parking_lot().build(n, &profiles).unwrap();
            assert_eq!(topo.switches().len(), 3);
            assert_eq!(topo.hosts().len(), 3 * n - 1);
            assert_eq!(topo.partition(), vec![n, n - 1, n]);
        }
    }

    #[test]
    fn fan_out_three_matches_the_drawing() {
        let topo = TopologyBuilder::parking_lot()
            .build(3, &testing::parking_lot_profiles())
            .unwrap();
        let (switches, hosts) = names(&topo);
        assert_eq!(switches, ["s1", "s2", "s3"]);
        assert_eq!(hosts, ["h1", "h2", "h3", "h4", "h5", "h6", "h7", "h8"]);
        let on = |s| {
            topo.hosts_on(SwitchId::new(s))
                .map(|h| h.name())
                .collect::<Vec<_>>()
        };
        assert_eq!(on(1), ["h1", "h2", "h3"]);
        assert_eq!(on(2), ["h4", "h5"]);
        assert_eq!(on(3), ["h6", "h7", "h8"]);
        assert_eq!(topo.host("h8").unwrap().ip().to_string(), "10.0.0.8");
    }

    #[test]
    fn segments_carry_their_own_profile() {
        let first = ImpairmentProfile::new(50, "10ms", 0.0, 1000);
        let second = ImpairmentProfile::new(20, "30ms", 1.5, 200);
        let topo = TopologyBuilder::builder()
            .shape(Shape::ParkingLot { switches: 3 })
            .build()
            .build(2, &[first.clone(), second.clone()])
            .unwrap();
        let s = |i| Endpoint::Switch(SwitchId::new(i));
        let l12 = topo.link_between(s(1), s(2)).unwrap();
        let l23 = topo.link_between(s(2), s(3)).unwrap();
        assert_eq!(l12.profile.as_ref(), Some(&first));
        assert_eq!(l23.profile.as_ref(), Some(&second));
        assert!(topo.link_between(s(1), s(3)).is_none());
        assert_eq!(topo.bottlenecks().count(), 2);
        assert!(topo
            .links()
            .iter()
            .filter(|l| !l.is_bottleneck())
            .all(|l| l.profile.is_none()));
    }

    #[test]
    fn longer_chains_generalize_the_partition() {
        let profiles = vec![testing::profile(); 4];
        let topo = TopologyBuilder::builder()
            .shape(Shape::ParkingLot { switches: 5 })
            .build()
            .build(3, &profiles)
            .unwrap();
        assert_eq!(topo.partition(), vec![3, 2, 2, 2, 3]);
    }

    #[test]
    fn builds_are_deterministic() {
        let profiles = testing::parking_lot_profiles();
        let a = TopologyBuilder::parking_lot().build(4, &profiles).unwrap();
        let b = TopologyBuilder::parking_lot().build(4, &profiles).unwrap();
        assert_eq!(names(&a), names(&b));
        assert_eq!(a.links(), b.links());
    }

    #[test]
    fn profile_count_mismatch_fails() {
        let res = TopologyBuilder::parking_lot().build(3, &[testing::profile()]);
        assert!(matches!(
            res,
            Err(Error::ProfileCountMismatch {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn zero_fan_out_fails() {
        let res = TopologyBuilder::parking_lot().build(0, &testing::parking_lot_profiles());
        assert!(matches!(res, Err(Error::ZeroFanOut)));
    }

    #[test]
    fn single_switch_chain_fails() {
        let res = TopologyBuilder::builder()
            .shape(Shape::ParkingLot { switches: 1 })
            .build()
            .build(1, &[]);
        assert!(matches!(res, Err(Error::TooFewSwitches(1))));
    }

    #[test]
    fn dual_switch_is_fixed() {
        let profile = ImpairmentProfile::new(100, "10ms", 0.0, 1000);
        let topo = TopologyBuilder::dual_switch().build(1, &[profile]).unwrap();
        let (switches, hosts) = names(&topo);
        assert_eq!(switches, ["s1", "s2"]);
        assert_eq!(hosts, ["h1", "h3", "h2", "h4"]);
        assert_eq!(topo.partition(), vec![2, 2]);
        let bottleneck = topo.bottlenecks().next().unwrap();
        let profile = bottleneck.profile.as_ref().unwrap();
        assert_eq!(profile.bandwidth, Mbps::new(100));
        assert_eq!(profile.max_queue, Packets::new(1000));
        assert_eq!(profile.loss, 0.0);
    }
}
