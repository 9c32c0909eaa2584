//! Experiment constants. These match the defaults of the tools the workloads invoke.

/// The port `iperf3 -s` listens on unless told otherwise.
pub const IPERF3_PORT: u16 = 5201;

/// The gap left after launching a server before anything addresses it.
pub const DEFAULT_READINESS_GAP_MS: u64 = 1000;

/// Readiness probe defaults.
pub const DEFAULT_PROBE_ATTEMPTS: u32 = 8;
pub const DEFAULT_PROBE_BACKOFF_MS: u64 = 50;
