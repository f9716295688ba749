//! Provisioning VM lifecycle.
//!
//! A session needs exactly one throwaway VM with its serial console and
//! monitor listening on a [`PortPair`]. [`VmLauncher`] is the seam between
//! the orchestrator and whatever starts that VM:
//! - [`QemuLauncher`](qemu::QemuLauncher): spawns `qemu-system-x86_64`
//! - tests plug in a simulated guest that serves both ports itself

pub mod ports;
pub mod qemu;

use crate::error::Result;

pub use ports::{allocate_port_pair, PortPair};
pub use qemu::QemuLauncher;

/// Starts the provisioning VM.
#[async_trait::async_trait]
pub trait VmLauncher: Send + Sync {
    /// Start the VM with its console and monitor bound to `ports`.
    ///
    /// Returns as soon as the VM has been started; it does not wait for
    /// the guest to boot or for either port to accept connections.
    async fn launch(&self, ports: PortPair) -> Result<Box<dyn VmProcess>>;
}

/// A running provisioning VM.
#[async_trait::async_trait]
pub trait VmProcess: Send {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// Stop the VM and wait for it to exit. Safe to call on a VM that
    /// already exited.
    async fn terminate(&mut self) -> Result<()>;
}
