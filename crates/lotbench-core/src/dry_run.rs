//! An [`Emulator`] that only logs what it would do. Sinks are created empty so the output layout
//! of a run can be inspected without privileges.

use std::fs::File;
use std::path::Path;

use log::info;

use crate::emulator::{BackgroundProcess, Emulator, EmulatorError, ProcessState, Reachability};
use crate::network::{Host, Topology};

#[derive(Debug, Default)]
pub struct DryRunEmulator {
    provisioned: bool,
}

impl DryRunEmulator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Emulator for DryRunEmulator {
    type Process = DryRunProcess;

    fn reset(&mut self) -> Result<(), EmulatorError> {
        info!("[dry-run] reset emulation state");
        Ok(())
    }

    fn provision(&mut self, topology: &Topology) -> Result<(), EmulatorError> {
        for link in topology.links() {
            match &link.profile {
                Some(p) => info!(
                    "[dry-run] link {}-{}: {} delay {} loss {}% queue {} ({:?})",
                    link.a, link.b, p.bandwidth, p.delay, p.loss, p.max_queue, p.discipline
                ),
                None => info!("[dry-run] link {}-{}", link.a, link.b),
            }
        }
        self.provisioned = true;
        Ok(())
    }

    fn ping_all(&self, topology: &Topology) -> Result<Reachability, EmulatorError> {
        if !self.provisioned {
            return Err(EmulatorError::NotProvisioned);
        }
        Ok(Reachability {
            sent: topology.host_pairs().count(),
            unreachable: Vec::new(),
        })
    }

    fn spawn(
        &mut self,
        host: &Host,
        argv: &[String],
        sink: &Path,
    ) -> Result<Self::Process, EmulatorError> {
        info!(
            "[dry-run] {}: {} > {}",
            host.id,
            argv.join(" "),
            sink.display()
        );
        File::create(sink)?;
        Ok(DryRunProcess)
    }

    fn is_listening(&self, _host: &Host, _port: u16) -> Result<bool, EmulatorError> {
        Ok(true)
    }

    fn teardown(&mut self) -> Result<(), EmulatorError> {
        info!("[dry-run] teardown");
        self.provisioned = false;
        Ok(())
    }
}

#[derive(Debug)]
pub struct DryRunProcess;

impl BackgroundProcess for DryRunProcess {
    fn poll(&mut self) -> Result<ProcessState, EmulatorError> {
        Ok(ProcessState::Exited(Some(0)))
    }

    fn kill(&mut self) -> Result<(), EmulatorError> {
        Ok(())
    }
}
