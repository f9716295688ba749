//! QEMU launcher.
//!
//! The VM boots from a read-only tool image on a virtio-scsi controller.
//! The target device and the companion image are not on the command line:
//! the state machine hot-attaches them through the monitor once the guest
//! shell is up, so they show up as `/dev/sdb` and `/dev/sdc` in that order.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{PortPair, VmLauncher, VmProcess};
use crate::config::ProvisionConfig;
use crate::{Error, Result};

const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Launches `qemu-system-x86_64` as described by a [`ProvisionConfig`].
#[derive(Debug, Clone)]
pub struct QemuLauncher {
    binary: PathBuf,
    tool_image: PathBuf,
    memory: String,
}

impl QemuLauncher {
    pub fn new(config: &ProvisionConfig) -> Self {
        Self {
            binary: config.qemu_binary.clone(),
            tool_image: config.tool_image.clone(),
            memory: config.memory.clone(),
        }
    }

    /// Arguments for a VM whose console and monitor listen on `ports`.
    pub fn args(&self, ports: PortPair) -> Vec<String> {
        vec![
            "-m".to_string(),
            self.memory.clone(),
            "-drive".to_string(),
            format!(
                "file={},format=raw,if=none,id=disk0,readonly=on",
                self.tool_image.display()
            ),
            "-device".to_string(),
            "virtio-scsi-pci,id=scsi0".to_string(),
            "-device".to_string(),
            "scsi-hd,drive=disk0,bus=scsi0.0".to_string(),
            "-chardev".to_string(),
            format!(
                "socket,id=char0,host=127.0.0.1,port={},server=on,wait=off",
                ports.console
            ),
            "-serial".to_string(),
            "chardev:char0".to_string(),
            "-monitor".to_string(),
            format!("tcp:127.0.0.1:{},server=on,wait=off", ports.monitor),
            "-nographic".to_string(),
        ]
    }

    /// The full command line, for diagnostics.
    pub fn command_line(&self, ports: PortPair) -> String {
        let mut parts = vec![self.binary.display().to_string()];
        parts.extend(self.args(ports));
        parts.join(" ")
    }
}

#[async_trait::async_trait]
impl VmLauncher for QemuLauncher {
    async fn launch(&self, ports: PortPair) -> Result<Box<dyn VmProcess>> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(ports))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            Error::Launch(format!("failed to spawn {}: {}", self.binary.display(), e))
        })?;

        info!(
            pid = child.id(),
            console = ports.console,
            monitor = ports.monitor,
            memory = %self.memory,
            "provisioning VM spawned"
        );

        Ok(Box::new(QemuProcess { child }))
    }
}

/// Handle to a spawned QEMU process.
pub struct QemuProcess {
    child: Child,
}

#[async_trait::async_trait]
impl VmProcess for QemuProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Some(status) = self.child.try_wait()? {
            debug!(?status, "VM already exited");
            return Ok(());
        }

        // The guest normally powers itself off; give it a moment first.
        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(?status, "VM exited");
                return Ok(());
            }
            Err(_) => warn!("VM still running after {:?}, killing", EXIT_GRACE),
        }

        self.child.kill().await?;
        info!("VM killed");
        Ok(())
    }
}
