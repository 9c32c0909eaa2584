//! Support code for the `lotbench` binary: reading experiment files, applying command-line
//! overrides and summarizing results.

#![warn(unreachable_pub, missing_debug_implementations, missing_docs)]

use std::fmt::Write;
use std::path::{Path, PathBuf};

use lotbench_core::{ExperimentConfig, ExperimentResult, FlowStatus, Packets, Readiness};

/// Reads an [`ExperimentConfig`] from a file in JSON or Dhall format.
pub fn read_config(path: impl AsRef<Path>) -> Result<ExperimentConfig, Error> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    let config = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents)?,
        Some("dhall") => serde_dhall::from_str(&contents).parse().map_err(Box::new)?,
        _ => return Err(Error::UnknownFileType(path.into())),
    };
    Ok(config)
}

/// Command-line values that replace those of an experiment.
#[derive(Debug, Default)]
pub struct Overrides {
    /// Run duration in seconds.
    pub duration_secs: Option<u64>,
    /// Grace period in seconds.
    pub grace_secs: Option<u64>,
    /// Queue size of every bottleneck segment.
    pub queue_size: Option<Packets>,
    /// Output directory.
    pub output_dir: Option<PathBuf>,
    /// Server readiness strategy.
    pub readiness: Option<Readiness>,
}

impl Overrides {
    /// Applies every value that is set.
    pub fn apply(self, config: &mut ExperimentConfig) {
        if let Some(secs) = self.duration_secs {
            config.duration_secs = secs;
        }
        if let Some(secs) = self.grace_secs {
            config.grace_secs = secs;
        }
        if let Some(queue_size) = self.queue_size {
            config.set_queue_size(queue_size);
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(readiness) = self.readiness {
            config.readiness = readiness;
        }
    }
}

/// A line per flow followed by the connectivity check and any recorded issues.
pub fn summarize(result: &ExperimentResult) -> String {
    let mut s = String::new();
    for outcome in &result.flows {
        let status = match outcome.status {
            FlowStatus::NotLaunched => "not launched".to_owned(),
            FlowStatus::Exited(Some(code)) => format!("exited ({code})"),
            FlowStatus::Exited(None) => "killed by a signal".to_owned(),
            FlowStatus::Terminated => "terminated".to_owned(),
            FlowStatus::Unknown => "unknown".to_owned(),
        };
        let sink = outcome
            .sink
            .file_name()
            .map(|f| f.to_string_lossy())
            .unwrap_or_default();
        writeln!(
            s,
            "{} {} on {}: {status}, output in {sink}",
            outcome.flow.id, outcome.flow.role, outcome.flow.src.id
        )
        .unwrap();
    }
    match &result.reachability {
        Some(r) => writeln!(
            s,
            "connectivity: {}/{} probes received ({:.1}% dropped)",
            r.received(),
            r.sent,
            r.dropped_pct()
        )
        .unwrap(),
        None => writeln!(s, "connectivity: not checked").unwrap(),
    }
    if result.issues.is_empty() {
        writeln!(s, "issues: none").unwrap();
    }
    for issue in &result.issues {
        writeln!(s, "issue: {issue}").unwrap();
    }
    s
}

/// Error kinds for reading experiment files.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown file type.
    #[error("unknown file type: {0}")]
    UnknownFileType(PathBuf),

    /// Error deserializing Dhall.
    #[error("Dhall error")]
    Dhall(#[from] Box<serde_dhall::Error>),

    /// Error deserializing JSON.
    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use lotbench_core::testing::RecordingEmulator;
    use lotbench_core::{presets, run, DryRunEmulator};

    #[test]
    fn reads_json_configs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lot.json");
        let config = presets::parking_lot("reno", Packets::new(64));
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        assert_eq!(read_config(&path)?, config);
        Ok(())
    }

    #[test]
    fn reads_dhall_configs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lot.dhall");
        std::fs::write(
            &path,
            r#"
let Role = < server | client | prober >

in  { segments =
      [ { bandwidth = 50, delay = "10ms", loss = 0.0, max_queue = 1000 }
      , { bandwidth = 50, delay = "10ms", loss = 0.0, max_queue = 200 }
      ]
    , workload =
      [ { role = Role.server, src = "h8", dst = None Text }
      , { role = Role.client, src = "h1", dst = Some "h8" }
      ]
    , duration_secs = 10
    , variant = Some "reno"
    , queue_size = Some 100
    }
"#,
        )?;
        let config = read_config(&path)?;
        assert_eq!(config.variant.as_deref(), Some("reno"));
        assert_eq!(config.readiness, Readiness::default());
        let experiment = config.into_experiment()?;
        let queues = experiment
            .topology
            .bottlenecks()
            .filter_map(|l| l.profile.as_ref())
            .map(|p| p.max_queue.into_u64())
            .collect::<Vec<_>>();
        assert_eq!(queues, [1000, 200]);
        let sinks = experiment
            .resolve_flows()?
            .into_iter()
            .map(|f| f.sink)
            .collect::<Vec<_>>();
        assert_eq!(sinks, ["h8_server_reno_100.txt", "flow_reno_100.txt"]);
        Ok(())
    }

    #[test]
    fn unknown_extension_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lot.yaml");
        std::fs::write(&path, "")?;
        assert!(matches!(read_config(&path), Err(Error::UnknownFileType(..))));
        Ok(())
    }

    #[test]
    fn overrides_replace_only_what_is_set() {
        let mut config = presets::dual_switch(Packets::new(1000));
        Overrides {
            duration_secs: Some(30),
            queue_size: Some(Packets::new(10)),
            ..Default::default()
        }
        .apply(&mut config);
        assert_eq!(config.duration_secs, 30);
        assert_eq!(config.grace_secs, 10);
        assert_eq!(config.queue_size, Some(Packets::new(10)));
        assert!(config
            .segments
            .iter()
            .all(|s| s.max_queue == Packets::new(10)));
    }

    fn quick(
        config: ExperimentConfig,
        dir: &tempfile::TempDir,
    ) -> anyhow::Result<lotbench_core::Experiment> {
        let mut experiment = config.into_experiment()?;
        experiment.duration = Duration::from_millis(1);
        experiment.output_dir = dir.path().to_owned();
        experiment.readiness = Readiness::FixedGap { gap_ms: 0 };
        Ok(experiment)
    }

    #[test]
    fn summary_of_a_clean_run() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = quick(presets::parking_lot("cubic", Packets::new(1000)), &dir)?;
        let result = run(&experiment, &mut DryRunEmulator::new())?;
        insta::assert_snapshot!(summarize(&result), @r###"
        flow1 server on h8: exited (0), output in h8_server_cubic_1000.txt
        flow2 client on h1: exited (0), output in flow_cubic_1000.txt
        flow3 prober on h3: exited (0), output in pingResult_cubic_1000.txt
        connectivity: 56/56 probes received (0.0% dropped)
        issues: none
        "###);
        Ok(())
    }

    #[test]
    fn summary_lists_issues() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let experiment = quick(presets::parking_lot("cubic", Packets::new(1000)), &dir)?;
        let mut emulator = RecordingEmulator::builder()
            .fail_spawn_on(vec!["h3".into()])
            .build();
        let result = run(&experiment, &mut emulator)?;
        insta::assert_snapshot!(summarize(&result), @r###"
        flow1 server on h8: exited (0), output in h8_server_cubic_1000.txt
        flow2 client on h1: exited (0), output in flow_cubic_1000.txt
        flow3 prober on h3: not launched, output in pingResult_cubic_1000.txt
        connectivity: 56/56 probes received (0.0% dropped)
        issue: failed to launch flow3
        "###);
        Ok(())
    }
}
