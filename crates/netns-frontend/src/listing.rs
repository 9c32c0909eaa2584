//! Parsers for `ip` listings, used to find objects a previous run left behind and to report
//! what a provisioned host actually has.

use lotbench_core::HostId;

/// Namespace names from `ip netns list`. Lines look like `lb-h1 (id: 3)` or just `lb-h1`.
pub(crate) fn namespaces(listing: &str) -> Vec<&str> {
    listing
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .collect()
}

/// Device names from `ip -o link show`. Lines look like
/// `7: lb-s1-eth2@if2: <BROADCAST,MULTICAST,UP> mtu 1500 ...`.
pub(crate) fn links(listing: &str) -> Vec<&str> {
    listing
        .lines()
        .filter_map(|l| l.split(": ").nth(1))
        .map(|name| name.split('@').next().unwrap_or(name))
        .collect()
}

/// Device names and operational states from `ip -o link show`, skipping loopback. A device
/// without a `state` field is reported as `UNKNOWN`.
pub(crate) fn link_states(listing: &str) -> Vec<(&str, &str)> {
    listing
        .lines()
        .filter_map(|l| {
            let name = l.split(": ").nth(1)?;
            let name = name.split('@').next().unwrap_or(name);
            let state = l
                .split_whitespace()
                .skip_while(|w| *w != "state")
                .nth(1)
                .unwrap_or("UNKNOWN");
            Some((name, state))
        })
        .filter(|(name, _)| *name != "lo")
        .collect()
}

/// One line of the connection summary: the host followed by its devices as seen inside its
/// namespace.
pub(crate) fn host_summary(host: HostId, listing: &str) -> String {
    let mut line = host.to_string();
    for (dev, state) in link_states(listing) {
        line.push_str(&format!(" {dev}:{state}"));
    }
    line
}

/// Process IDs from `ip netns pids`.
pub(crate) fn pids(listing: &str) -> Vec<u32> {
    listing
        .split_whitespace()
        .filter_map(|p| p.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespaces() {
        let listing = "lb-h2 (id: 1)\nlb-h1 (id: 0)\nother\n";
        assert_eq!(namespaces(listing), ["lb-h2", "lb-h1", "other"]);
        assert!(namespaces("").is_empty());
    }

    #[test]
    fn parses_links() {
        let listing = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT
4: lb-s1: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP mode DEFAULT
5: lb-s1-eth1@lb-s2-eth1: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc htb master lb-s1
7: lb-s1-eth2@if2: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue master lb-s1
";
        assert_eq!(links(listing), ["lo", "lb-s1", "lb-s1-eth1", "lb-s1-eth2"]);
    }

    #[test]
    fn summarizes_host_devices() {
        let listing = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT group default
2: h1-eth0@if7: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP mode DEFAULT
3: h1-eth1@if9: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN mode DEFAULT
";
        assert_eq!(
            link_states(listing),
            [("h1-eth0", "UP"), ("h1-eth1", "DOWN")]
        );
        assert_eq!(
            host_summary(HostId::new(1), listing),
            "h1 h1-eth0:UP h1-eth1:DOWN"
        );
        assert_eq!(host_summary(HostId::new(2), ""), "h2");
    }

    #[test]
    fn parses_pids() {
        assert_eq!(pids("812\n813\n"), [812, 813]);
        assert!(pids("").is_empty());
    }
}
