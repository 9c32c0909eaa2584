use std::net::Ipv4Addr;

use crate::units::{Delay, Mbps, Packets};

identifier!(SwitchId, "s");
identifier!(HostId, "h");

/// A switch and its position in the chain (0-indexed).
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new, serde::Serialize, serde::Deserialize)]
pub struct Switch {
    pub id: SwitchId,
    pub position: usize,
}

impl Switch {
    pub fn name(&self) -> String {
        self.id.to_string()
    }
}

/// A host bound to exactly one switch.
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new, serde::Serialize, serde::Deserialize)]
pub struct Host {
    pub id: HostId,
    pub switch: SwitchId,
}

impl Host {
    pub fn name(&self) -> String {
        self.id.to_string()
    }

    /// The host's address in `10.0.0.0/8`, derived from its number (`h8` is `10.0.0.8`).
    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(HOST_SUBNET | self.id.inner() as u32)
    }
}

const HOST_SUBNET: u32 = 0x0a00_0000;

/// The prefix length of [`Host::ip`].
pub const HOST_PREFIX_LEN: u8 = 8;

/// One end of a link.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Switch(SwitchId),
    Host(HostId),
}

impl Endpoint {
    pub fn is_switch(&self) -> bool {
        matches!(self, Endpoint::Switch(_))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Switch(id) => write!(f, "{id}"),
            Endpoint::Host(id) => write!(f, "{id}"),
        }
    }
}

impl From<SwitchId> for Endpoint {
    fn from(id: SwitchId) -> Self {
        Endpoint::Switch(id)
    }
}

impl From<HostId> for Endpoint {
    fn from(id: HostId) -> Self {
        Endpoint::Host(id)
    }
}

/// An undirected link. Only bottleneck (switch-to-switch) links carry a profile; access links use
/// the emulator's defaults.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Link {
    pub a: Endpoint,
    pub b: Endpoint,
    #[serde(default)]
    pub profile: Option<ImpairmentProfile>,
}

impl Link {
    pub fn new_access(host: HostId, switch: SwitchId) -> Self {
        Self {
            a: host.into(),
            b: switch.into(),
            profile: None,
        }
    }

    pub fn new_bottleneck(a: SwitchId, b: SwitchId, profile: ImpairmentProfile) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
            profile: Some(profile),
        }
    }

    pub fn connects(&self, x: Endpoint, y: Endpoint) -> bool {
        self.a == x && self.b == y || self.a == y && self.b == x
    }

    pub fn is_bottleneck(&self) -> bool {
        self.a.is_switch() && self.b.is_switch()
    }
}

/// Bandwidth, delay, loss and queue limits applied to a bottleneck link.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ImpairmentProfile {
    pub bandwidth: Mbps,
    pub delay: Delay,
    /// Random loss in percent. Zero models a lossless bottleneck.
    #[serde(default)]
    pub loss: f64,
    pub max_queue: Packets,
    #[serde(default)]
    pub discipline: RateLimiter,
}

impl ImpairmentProfile {
    /// Creates an HTB-limited profile.
    pub fn new(bandwidth_mbps: u64, delay: impl Into<Delay>, loss: f64, max_queue: u64) -> Self {
        Self {
            bandwidth: Mbps::new(bandwidth_mbps),
            delay: delay.into(),
            loss,
            max_queue: Packets::new(max_queue),
            discipline: RateLimiter::Htb,
        }
    }

    pub fn with_discipline(self, discipline: RateLimiter) -> Self {
        Self { discipline, ..self }
    }

    /// Returns a description of the first out-of-range parameter, if any.
    pub(crate) fn check(&self) -> Option<&'static str> {
        if self.bandwidth == Mbps::ZERO {
            return Some("bandwidth must be positive");
        }
        if self.max_queue == Packets::ZERO {
            return Some("queue length must be positive");
        }
        if !(0.0..=100.0).contains(&self.loss) {
            return Some("loss must be a percentage between 0 and 100");
        }
        None
    }
}

/// How the bandwidth ceiling is enforced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimiter {
    /// Hierarchical token bucket.
    #[default]
    Htb,
    /// No token bucket; the emulator's shaper applies the rate directly.
    None,
}
