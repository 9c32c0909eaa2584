//! An [`Emulator`] backed by Linux network namespaces.
//!
//! Each host is a network namespace, each switch a bridge in the root namespace and each link a
//! veth pair. Bottleneck links are shaped on both ends with `tc`. Everything in this crate needs
//! root and iproute2.

#![warn(unreachable_pub, missing_debug_implementations, missing_docs)]

mod listing;
mod plan;

use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};

use log::{debug, info, warn};
use lotbench_core::{
    BackgroundProcess, Emulator, EmulatorError, Host, ProcessState, Reachability, Topology,
};

use plan::{Naming, Resource, MAX_IFNAME_LEN};

pub use plan::shaping_commands;

/// The default prefix of created object names.
pub const DEFAULT_PREFIX: &str = "lb";

/// Realizes topologies with network namespaces and bridges.
#[derive(Debug, typed_builder::TypedBuilder)]
pub struct NetnsEmulator {
    /// Prefix of every created object name. Device names are limited to 15 bytes, so keep it
    /// short.
    #[builder(default = DEFAULT_PREFIX.to_owned(), setter(into))]
    prefix: String,
    /// How long each connectivity probe waits for a reply.
    #[builder(default = 1)]
    ping_timeout_secs: u64,
    #[builder(default, setter(skip))]
    created: Vec<Resource>,
}

impl Default for NetnsEmulator {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl NetnsEmulator {
    /// The prefix of created object names.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn naming(&self) -> Naming<'_> {
        Naming {
            prefix: &self.prefix,
        }
    }

    fn owns_namespace(&self, ns: &str) -> bool {
        self.created
            .iter()
            .any(|r| matches!(r, Resource::Namespace(n) if n == ns))
    }
}

impl Emulator for NetnsEmulator {
    type Process = NetnsProcess;

    fn reset(&mut self) -> Result<(), EmulatorError> {
        check_privileges()?;
        let naming = self.naming();
        let listing = cmd_lib::run_fun!(ip netns list)?;
        for ns in listing::namespaces(&listing)
            .into_iter()
            .filter(|ns| naming.owns(ns))
        {
            info!("Removing stale namespace {ns}");
            kill_processes(ns)?;
            exec(&["ip", "netns", "del", ns])?;
        }
        let listing = cmd_lib::run_fun!(ip -o link show)?;
        for dev in listing::links(&listing)
            .into_iter()
            .filter(|dev| naming.owns(dev))
        {
            info!("Removing stale device {dev}");
            // The peer of a veth pair may already be gone with its other end.
            if let Err(e) = exec(&["ip", "link", "del", dev]) {
                debug!("{e}");
            }
        }
        self.created.clear();
        Ok(())
    }

    fn provision(&mut self, topology: &Topology) -> Result<(), EmulatorError> {
        let steps = plan::provision_plan(topology, self.naming());
        let overlong = plan::overlong_names(&steps);
        if !overlong.is_empty() {
            return Err(EmulatorError::Unavailable(format!(
                "device names longer than {MAX_IFNAME_LEN} bytes: {}",
                overlong.join(", ")
            )));
        }
        debug!("Running {} provisioning commands", steps.len());
        for step in steps {
            exec(&step.argv)?;
            if let Some(resource) = step.creates {
                self.created.push(resource);
            }
        }
        Ok(())
    }

    fn connections(&self, topology: &Topology) -> Result<String, EmulatorError> {
        if self.created.is_empty() {
            return Err(EmulatorError::NotProvisioned);
        }
        let naming = self.naming();
        let mut summary = String::new();
        for host in topology.hosts() {
            let ns = naming.namespace(host.id);
            let out = exec(&["ip", "-n", ns.as_str(), "-o", "link", "show"])?;
            summary.push_str(&listing::host_summary(
                host.id,
                &String::from_utf8_lossy(&out.stdout),
            ));
            summary.push('\n');
        }
        Ok(summary)
    }

    fn ping_all(&self, topology: &Topology) -> Result<Reachability, EmulatorError> {
        if self.created.is_empty() {
            return Err(EmulatorError::NotProvisioned);
        }
        let naming = self.naming();
        let timeout = self.ping_timeout_secs.to_string();
        let mut reachability = Reachability::default();
        for (src, dst) in topology.host_pairs() {
            let ns = naming.namespace(src.id);
            let ip = dst.ip().to_string();
            let out = raw(&[
                "ip",
                "netns",
                "exec",
                ns.as_str(),
                "ping",
                "-c",
                "1",
                "-W",
                timeout.as_str(),
                ip.as_str(),
            ])?;
            reachability.sent += 1;
            if !out.status.success() {
                debug!("{} -> {} unreachable", src.id, dst.id);
                reachability.unreachable.push((src.id, dst.id));
            }
        }
        Ok(reachability)
    }

    fn spawn(
        &mut self,
        host: &Host,
        argv: &[String],
        sink: &Path,
    ) -> Result<Self::Process, EmulatorError> {
        let ns = self.naming().namespace(host.id);
        if !self.owns_namespace(&ns) {
            return Err(EmulatorError::NotProvisioned);
        }
        let stdout = File::create(sink)?;
        let child = Command::new("ip")
            .args(["netns", "exec", ns.as_str()])
            .args(argv)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::null())
            .spawn()?;
        debug!("Started pid {} in {ns}", child.id());
        Ok(NetnsProcess {
            child,
            label: format!("{}: {}", host.id, argv.join(" ")),
        })
    }

    fn is_listening(&self, host: &Host, port: u16) -> Result<bool, EmulatorError> {
        let ns = self.naming().namespace(host.id);
        let port = format!(":{port}");
        let out = exec(&[
            "ip",
            "netns",
            "exec",
            ns.as_str(),
            "ss",
            "-ltnH",
            "sport",
            "=",
            port.as_str(),
        ])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    fn teardown(&mut self) -> Result<(), EmulatorError> {
        let mut first_error = None;
        // Reverse creation order: veth pairs, then namespaces, then bridges.
        while let Some(resource) = self.created.pop() {
            let res = match &resource {
                Resource::Namespace(ns) => kill_processes(ns)
                    .and_then(|()| exec(&["ip", "netns", "del", ns.as_str()]).map(drop)),
                Resource::Link(dev) => exec(&["ip", "link", "del", dev.as_str()]).map(drop),
            };
            if let Err(e) = res {
                warn!("Failed to remove {resource:?}: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A traffic generator running inside a host namespace.
#[derive(Debug)]
pub struct NetnsProcess {
    child: Child,
    label: String,
}

impl BackgroundProcess for NetnsProcess {
    fn poll(&mut self) -> Result<ProcessState, EmulatorError> {
        Ok(match self.child.try_wait()? {
            Some(status) => ProcessState::Exited(status.code()),
            None => ProcessState::Running,
        })
    }

    fn kill(&mut self) -> Result<(), EmulatorError> {
        debug!("Killing `{}`", self.label);
        match self.child.kill() {
            Ok(()) => {}
            // Already exited.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e.into()),
        }
        self.child.wait()?;
        Ok(())
    }
}

/// Fails unless running as root with iproute2 and tc available.
pub fn check_privileges() -> Result<(), EmulatorError> {
    let uid = cmd_lib::run_fun!(id -u)
        .map_err(|e| EmulatorError::Unavailable(format!("cannot determine user id: {e}")))?;
    if uid.trim() != "0" {
        return Err(EmulatorError::Unavailable(
            "network namespaces require root".to_owned(),
        ));
    }
    for tool in ["ip", "tc"] {
        raw(&[tool, "-V"])
            .map_err(|e| EmulatorError::Unavailable(format!("`{tool}` is not usable: {e}")))?;
    }
    Ok(())
}

fn kill_processes(ns: &str) -> Result<(), EmulatorError> {
    let listing = cmd_lib::run_fun!(ip netns pids $ns)?;
    for pid in listing::pids(&listing) {
        let pid = pid.to_string();
        debug!("Killing lingering pid {pid} in {ns}");
        // The process may exit on its own in the meantime.
        let _ = cmd_lib::run_cmd!(kill -9 $pid);
    }
    Ok(())
}

fn raw<S: AsRef<str>>(argv: &[S]) -> Result<Output, EmulatorError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| EmulatorError::Unavailable("empty command".to_owned()))?;
    debug!("$ {}", join(argv));
    let output = Command::new(program.as_ref())
        .args(args.iter().map(AsRef::as_ref))
        .output()?;
    Ok(output)
}

fn exec<S: AsRef<str>>(argv: &[S]) -> Result<Output, EmulatorError> {
    let output = raw(argv)?;
    if !output.status.success() {
        return Err(EmulatorError::Command {
            command: join(argv),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(output)
}

fn join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(" ")
}
