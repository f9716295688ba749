//! flashbox: provision block devices through a throwaway QEMU VM
//!
//! flashbox boots a small Linux tool image under QEMU, hot-attaches the
//! target device and a companion image through the QEMU monitor, and then
//! scripts the guest shell over the serial console: write a fresh partition
//! table, copy the image block-for-block, repair and grow the partition and
//! filesystem, drop a per-device identity file onto it, and power off.
//!
//! The guest has no agent and no structured output. Progress is driven by a
//! forward-only state machine that watches console lines for known
//! substrings and answers with the next command.
//!
//! # Key Features
//!
//! - **No guest agent**: works with any shell-bearing tool image
//! - **Pure state machine**: every stage is a testable `(state, line) -> transition`
//! - **Ordered status stream**: progress lines ending in a `FINISHED` sentinel
//! - **Pluggable VM launcher**: tests drive a simulated guest over real sockets
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use flashbox::{ProvisionConfig, ProvisionRequest, QemuLauncher, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProvisionConfig::with_base_dir("/opt/flashbox");
//!     config.validate()?;
//!
//!     let launcher = Arc::new(QemuLauncher::new(&config));
//!     let request = ProvisionRequest::new("/dev/sdd", "mgmt-01", "kiosk-17");
//!     let mut session = Session::new(config, request, launcher)?;
//!     let mut events = session.take_events().expect("fresh session");
//!
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("{}", event);
//!         }
//!     });
//!
//!     let report = session.run().await?;
//!     println!("{:?}", report.outcome);
//!     Ok(())
//! }
//! ```

// Core modules
pub mod config;
pub mod error;
pub mod identity;
pub mod logging;

// VM and its channels
pub mod channel;
pub mod vmm;

// Orchestration
pub mod machine;
pub mod session;

// Re-exports for convenience
pub use config::ProvisionConfig;
pub use error::{Error, Result};
pub use session::events::{SessionEvent, FINISHED_SENTINEL};
pub use session::{ProvisionRequest, Session, SessionHandle, SessionOutcome, SessionReport};
pub use vmm::QemuLauncher;

// Prelude for common imports
pub mod prelude {
    pub use crate::channel::ConnectPolicy;
    pub use crate::config::ProvisionConfig;
    pub use crate::error::{Error, Result};
    pub use crate::identity::{Identity, IdentitySettings};
    pub use crate::machine::{Machine, MachineContext, Stage};
    pub use crate::session::events::SessionEvent;
    pub use crate::session::{ProvisionRequest, Session, SessionHandle, SessionOutcome};
    pub use crate::vmm::{PortPair, QemuLauncher, VmLauncher, VmProcess};
}
