//! Provisioning session.
//!
//! A [`Session`] owns everything one provisioning run needs: the request,
//! the generated identity, the command queue and the status stream. Running
//! it allocates a port pair, starts the VM, connects both channels and then
//! hands control to two tasks:
//!
//! - the Line Reader, which feeds every console line to the state machine and
//!   applies the resulting transitions (this is the only writer of the
//!   machine state and of `running`)
//! - the Command Sender, which drains the command queue onto the console
//!
//! Once both have exited the sockets are dropped and the VM is terminated,
//! exactly once, whichever way the run ended.

pub mod events;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::channel::console::{read_loop, send_loop, LineHandler};
use crate::channel::monitor::{spawn_drain, MonitorChannel};
use crate::channel::{connect_with_retry, ChannelKind};
use crate::config::ProvisionConfig;
use crate::identity::Identity;
use crate::machine::{Action, DiskRole, Machine, MachineContext, Outcome, Stage};
use crate::vmm::{allocate_port_pair, PortPair, VmLauncher};
use crate::{Error, Result};

use events::{SessionEvent, StatusSink};

/// What the UI collaborator asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Host path of the target device (e.g. `/dev/sdd` or `\\.\PHYSICALDRIVE2`)
    pub device: String,
    pub management_id: String,
    pub device_id: String,
}

impl ProvisionRequest {
    pub fn new(
        device: impl Into<String>,
        management_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            management_id: management_id.into(),
            device_id: device_id.into(),
        }
    }

    /// All three fields must be non-blank.
    pub fn validate(&self) -> Result<()> {
        for (what, value) in [
            ("device", &self.device),
            ("management id", &self.management_id),
            ("device id", &self.device_id),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Request(format!("{} must not be empty", what)));
            }
        }
        Ok(())
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The pipeline reached its end and powered the VM off
    Completed,
    /// The pipeline jumped to its sink; the message is the operator hint
    Halted(String),
    /// The console closed before the pipeline finished
    Disconnected,
}

/// Summary returned by [`Session::run`].
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub uuid: Uuid,
    pub ports: PortPair,
    /// Stage the machine was in when the console reader stopped
    pub stage: Stage,
    pub outcome: SessionOutcome,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.outcome == SessionOutcome::Completed
    }
}

/// Cloneable handle for injecting operator commands into a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: UnboundedSender<String>,
}

impl SessionHandle {
    /// Queue a raw console command. It is sent in arrival order with the
    /// machine's own commands.
    pub fn send_command(&self, command: impl Into<String>) -> Result<()> {
        self.commands
            .send(command.into())
            .map_err(|_| Error::Console("session has ended".into()))
    }
}

/// One provisioning run.
pub struct Session {
    config: ProvisionConfig,
    request: ProvisionRequest,
    identity: Identity,
    launcher: Arc<dyn VmLauncher>,
    commands_tx: UnboundedSender<String>,
    commands_rx: UnboundedReceiver<String>,
    status: StatusSink,
    events: Option<UnboundedReceiver<SessionEvent>>,
    running: Arc<AtomicBool>,
}

impl Session {
    /// Validate the request and generate the identity payload. Nothing is
    /// started until [`Session::run`].
    pub fn new(
        config: ProvisionConfig,
        request: ProvisionRequest,
        launcher: Arc<dyn VmLauncher>,
    ) -> Result<Self> {
        request.validate()?;
        config.check_settle_scale()?;
        let identity = Identity::generate(
            &request.management_id,
            &request.device_id,
            &config.identity,
        )?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status, events) = StatusSink::channel();

        Ok(Self {
            config,
            request,
            identity,
            launcher,
            commands_tx,
            commands_rx,
            status,
            events: Some(events),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn request(&self) -> &ProvisionRequest {
        &self.request
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// The ordered status stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    /// Run the session to the end.
    ///
    /// Port exhaustion and launch failures are returned before anything
    /// needs tearing down. After launch the VM is always terminated before
    /// this returns, including when connecting fails.
    pub async fn run(self) -> Result<SessionReport> {
        let span = info_span!("session", uuid = %self.identity.uuid(), device = %self.request.device);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> Result<SessionReport> {
        let ports = allocate_port_pair(self.config.port_range.clone())?;
        info!(console = ports.console, monitor = ports.monitor, "ports allocated");

        let mut vm = self.launcher.launch(ports).await?;
        let uuid = self.identity.uuid();
        let running = self.running.clone();

        let result = self.drive(ports).await;
        running.store(false, Ordering::SeqCst);

        // Not reported on the status stream: Finished must stay last.
        if let Err(e) = vm.terminate().await {
            warn!(error = %e, "failed to terminate VM");
        }
        info!("session torn down");

        let (stage, outcome) = result?;
        Ok(SessionReport {
            uuid,
            ports,
            stage,
            outcome,
        })
    }

    /// Connect, run both loops, and return where the machine ended up. Both
    /// sockets are closed when this returns.
    async fn drive(self, ports: PortPair) -> Result<(Stage, SessionOutcome)> {
        let console = connect_with_retry(
            ChannelKind::Console,
            ports.console,
            &self.config.connect,
            &self.status,
        )
        .await?;
        let monitor = connect_with_retry(
            ChannelKind::Monitor,
            ports.monitor,
            &self.config.connect,
            &self.status,
        )
        .await?;
        self.status.status("Loading provisioning platform...");

        let (monitor_read, monitor_write) = monitor.into_split();
        let drain = spawn_drain(monitor_read);
        let (console_read, console_write) = console.into_split();

        let ctx = MachineContext::new(self.request.device.clone(), &self.identity);
        let mut driver = PipelineDriver {
            machine: Machine::new(ctx),
            commands: self.commands_tx.clone(),
            monitor: MonitorChannel::new(monitor_write),
            target: PathBuf::from(&self.request.device),
            config: self.config.clone(),
            running: self.running.clone(),
            status: self.status.clone(),
            outcome: None,
        };

        let reader_done = Arc::new(Notify::new());
        let reader = tokio::spawn({
            let running = self.running.clone();
            let done = reader_done.clone();
            let status = self.status.clone();
            async move {
                read_loop(console_read, &mut driver, running, done, &status).await;
                driver
            }
            .in_current_span()
        });
        let sender = tokio::spawn({
            let status = self.status.clone();
            let queue = self.commands_rx;
            async move {
                send_loop(console_write, queue, reader_done, &status).await;
            }
            .in_current_span()
        });

        let (reader, sender) = tokio::join!(reader, sender);
        drain.abort();
        if let Err(e) = sender {
            warn!(error = %e, "command sender task failed");
        }
        let driver = reader.map_err(|e| Error::Console(format!("line reader task failed: {}", e)))?;

        let stage = driver.machine.stage();
        let outcome = driver.outcome.unwrap_or(SessionOutcome::Disconnected);
        info!(%stage, ?outcome, "console loops finished");
        Ok((stage, outcome))
    }
}

/// The Line Reader's handler: feeds the machine and applies transitions.
struct PipelineDriver {
    machine: Machine,
    commands: UnboundedSender<String>,
    monitor: MonitorChannel<OwnedWriteHalf>,
    target: PathBuf,
    config: ProvisionConfig,
    running: Arc<AtomicBool>,
    status: StatusSink,
    outcome: Option<SessionOutcome>,
}

impl PipelineDriver {
    async fn apply(&mut self, action: Action) -> Result<()> {
        match action {
            Action::Console(command) => self
                .commands
                .send(command)
                .map_err(|_| Error::Console("command queue closed".into())),
            Action::Attach(role) => {
                let path = match role {
                    DiskRole::Target => &self.target,
                    DiskRole::Companion => &self.config.companion_image,
                };
                info!(drive = role.drive_id(), path = %path.display(), "attaching disk");
                self.monitor.attach_disk(path, role.drive_id()).await
            }
        }
    }
}

#[async_trait::async_trait]
impl LineHandler for PipelineDriver {
    async fn handle_line(&mut self, line: &str) {
        let from = self.machine.stage();
        let Some(transition) = self.machine.feed(line) else {
            return;
        };
        debug!(%from, to = %transition.next.stage, line, "transition");

        for message in transition.announce {
            self.status.status(message);
        }

        let settle = self.config.settle(transition.settle);
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        for message in transition.status {
            self.status.status(message);
        }
        for action in transition.actions {
            if let Err(e) = self.apply(action).await {
                warn!(error = %e, "action failed");
                self.status.status(format!("Processing error: {}", e));
            }
        }

        match transition.outcome {
            Outcome::Continue => {}
            Outcome::Halted(message) => {
                self.status.halted(message.clone());
                self.outcome = Some(SessionOutcome::Halted(message));
            }
            Outcome::Completed => {
                self.running.store(false, Ordering::SeqCst);
                self.status.finished();
                self.outcome = Some(SessionOutcome::Completed);
            }
        }
    }
}
