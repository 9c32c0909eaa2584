//! The two canned experiments.

use crate::builder::Shape;
use crate::experiment::{ExperimentConfig, Readiness};
use crate::network::ImpairmentProfile;
use crate::units::Packets;
use crate::workload::{FlowTemplate, WorkloadPlan};

/// The three-switch parking lot with three hosts per block: one bulk flow from `h1` to `h8`
/// under `variant`, with `h3` probing `h7` for latency. Both segments are 50 Mbps with 10 ms of
/// delay.
pub fn parking_lot(variant: &str, queue_size: Packets) -> ExperimentConfig {
    let segment = ImpairmentProfile::new(50, "10ms", 0.0, queue_size.into_u64());
    ExperimentConfig {
        shape: Shape::ParkingLot { switches: 3 },
        fan_out: 3,
        segments: vec![segment.clone(), segment],
        workload: WorkloadPlan::new(vec![
            FlowTemplate::server("h8"),
            FlowTemplate::client("h1", "h8"),
            FlowTemplate::prober("h3", "h7"),
        ]),
        duration_secs: 100,
        grace_secs: 0,
        variant: Some(variant.to_owned()),
        queue_size: Some(queue_size),
        output_dir: ".".into(),
        readiness: Readiness::default(),
    }
}

/// Two switches joined by a 100 Mbps, 10 ms bottleneck. `h1` sends a CUBIC and a BBR flow to
/// `h2` while `h3` probes `h4`.
pub fn dual_switch(queue_size: Packets) -> ExperimentConfig {
    ExperimentConfig {
        shape: Shape::DualSwitch,
        fan_out: 1,
        segments: vec![ImpairmentProfile::new(
            100,
            "10ms",
            0.0,
            queue_size.into_u64(),
        )],
        workload: WorkloadPlan::new(vec![
            FlowTemplate::prober("h3", "h4").with_sink("h3_ping_result_{queue}"),
            FlowTemplate::server("h2").with_sink("h1_server_{queue}"),
            FlowTemplate::client("h1", "h2")
                .with_congestion("cubic")
                .with_sink("flow1_{cc}_{queue}"),
            FlowTemplate::client("h1", "h2")
                .with_congestion("bbr")
                .with_sink("flow2_{cc}_{queue}"),
        ]),
        duration_secs: 500,
        grace_secs: 10,
        variant: None,
        queue_size: Some(queue_size),
        output_dir: ".".into(),
        readiness: Readiness::default(),
    }
}
