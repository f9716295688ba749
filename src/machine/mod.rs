//! Provisioning state machine.
//!
//! The pipeline is an immutable, ordered list of [`Stage`]s. Each console
//! line is offered to the current stage only; if the line carries that
//! stage's trigger the stage produces a [`Transition`] describing the settle
//! delay, the next state, status lines for the operator and the actions to
//! perform. Lines that match nothing are ignored.
//!
//! [`transition`] is a pure function of `(state, line, context)`. Applying a
//! transition (sleeping, writing to the console and monitor) is the
//! session's job, which keeps every stage unit-testable without a VM.
//!
//! The current stage only ever moves forward by one, or jumps straight to
//! [`Stage::Sink`] when the disk is in a state that needs a human.

pub mod triggers;

use std::fmt;
use std::time::Duration;

use crate::channel::console::POWEROFF_COMMAND;
use crate::identity::Identity;
use triggers::*;

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Initial,
    Ready,
    DeviceAttached,
    CompanionAttached,
    Format,
    WriteImage,
    PartitionRepair,
    FilesystemCheck,
    ResizeFilesystem,
    Mount,
    WriteIdentity,
    Unmount,
    Finish,
    Sink,
}

impl Stage {
    /// The immutable pipeline order.
    pub const PIPELINE: [Stage; 14] = [
        Stage::Initial,
        Stage::Ready,
        Stage::DeviceAttached,
        Stage::CompanionAttached,
        Stage::Format,
        Stage::WriteImage,
        Stage::PartitionRepair,
        Stage::FilesystemCheck,
        Stage::ResizeFilesystem,
        Stage::Mount,
        Stage::WriteIdentity,
        Stage::Unmount,
        Stage::Finish,
        Stage::Sink,
    ];

    /// Position in [`Stage::PIPELINE`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// The following stage; the sink is its own successor.
    pub fn next(self) -> Stage {
        Self::PIPELINE
            .get(self.index() + 1)
            .copied()
            .unwrap_or(Stage::Sink)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Initial => "initial",
            Stage::Ready => "ready",
            Stage::DeviceAttached => "device-attached",
            Stage::CompanionAttached => "companion-attached",
            Stage::Format => "format",
            Stage::WriteImage => "write-image",
            Stage::PartitionRepair => "partition-repair",
            Stage::FilesystemCheck => "filesystem-check",
            Stage::ResizeFilesystem => "resize-filesystem",
            Stage::Mount => "mount",
            Stage::WriteIdentity => "write-identity",
            Stage::Unmount => "unmount",
            Stage::Finish => "finish",
            Stage::Sink => "sink",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The current-state pointer plus the partition-repair legacy-boot flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineState {
    pub stage: Stage,
    /// Set when parted listed a legacy-boot partition; the next line must
    /// then be the data partition row.
    pub legacy_boot: bool,
}

impl MachineState {
    pub fn initial() -> Self {
        Self {
            stage: Stage::Initial,
            legacy_boot: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage == Stage::Sink
    }

    fn advanced(self) -> Self {
        Self {
            stage: self.stage.next(),
            ..self
        }
    }

    fn sink() -> Self {
        Self {
            stage: Stage::Sink,
            legacy_boot: false,
        }
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::initial()
    }
}

/// Which disk a monitor attach refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskRole {
    /// The host device being provisioned
    Target,
    /// The image copied onto it
    Companion,
}

impl DiskRole {
    /// Monitor drive id; attach order makes these `/dev/sdb` and `/dev/sdc`.
    pub fn drive_id(self) -> &'static str {
        match self {
            DiskRole::Target => "disk1",
            DiskRole::Companion => "disk2",
        }
    }
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Queue a console command
    Console(String),
    /// Hot-attach a disk through the monitor
    Attach(DiskRole),
}

/// What the session does after applying a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// Jumped to the sink; the message tells the operator what to do
    Halted(String),
    /// Provisioning finished; stop the session
    Completed,
}

/// Result of a matched trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: MachineState,
    /// Status lines emitted as soon as the trigger matches, before the settle
    pub announce: Vec<String>,
    /// Delay before the transition takes effect, letting the console settle
    pub settle: Duration,
    /// Status lines emitted after the settle
    pub status: Vec<String>,
    pub actions: Vec<Action>,
    pub outcome: Outcome,
}

impl Transition {
    fn to(next: MachineState, settle: Duration) -> Self {
        Self {
            next,
            announce: Vec::new(),
            settle,
            status: Vec::new(),
            actions: Vec::new(),
            outcome: Outcome::Continue,
        }
    }

    fn halt(settle: Duration, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            next: MachineState::sink(),
            announce: Vec::new(),
            settle,
            status: Vec::new(),
            actions: Vec::new(),
            outcome: Outcome::Halted(message),
        }
    }

    fn announce(mut self, line: impl Into<String>) -> Self {
        self.announce.push(line.into());
        self
    }

    fn status(mut self, line: impl Into<String>) -> Self {
        self.status.push(line.into());
        self
    }

    fn send(mut self, command: impl Into<String>) -> Self {
        self.actions.push(Action::Console(command.into()));
        self
    }

    fn attach(mut self, role: DiskRole) -> Self {
        self.actions.push(Action::Attach(role));
        self
    }

    fn completed(mut self) -> Self {
        self.outcome = Outcome::Completed;
        self
    }

    /// Console commands this transition queues, in order.
    pub fn commands(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                Action::Console(c) => Some(c.as_str()),
                Action::Attach(_) => None,
            })
            .collect()
    }
}

/// Device names and paths as seen from inside the provisioning VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestLayout {
    pub target: String,
    pub companion: String,
    pub data_partition: u32,
    pub mountpoint: String,
    /// Identity file path relative to the mounted filesystem root
    pub identity_path: String,
}

impl Default for GuestLayout {
    fn default() -> Self {
        Self {
            target: "/dev/sdb".to_string(),
            companion: "/dev/sdc".to_string(),
            data_partition: 2,
            mountpoint: "/mnt/disk".to_string(),
            identity_path: "etc/system.yaml".to_string(),
        }
    }
}

impl GuestLayout {
    fn partition(&self) -> String {
        format!("{}{}", self.target, self.data_partition)
    }
}

/// Per-session inputs the stages need.
#[derive(Debug, Clone)]
pub struct MachineContext {
    /// Host device label used in status lines
    pub device: String,
    pub layout: GuestLayout,
    uuid: String,
    identity_command: String,
}

impl MachineContext {
    pub fn new(device: impl Into<String>, identity: &Identity) -> Self {
        Self::with_layout(device, identity, GuestLayout::default())
    }

    pub fn with_layout(device: impl Into<String>, identity: &Identity, layout: GuestLayout) -> Self {
        let identity_command = format!(
            "echo -e \"{}\" > {}/{}",
            identity.escaped(),
            layout.mountpoint,
            layout.identity_path
        );
        Self {
            device: device.into(),
            layout,
            uuid: identity.uuid().to_string(),
            identity_command,
        }
    }

    /// The console command that writes the identity payload.
    pub fn identity_command(&self) -> &str {
        &self.identity_command
    }
}

const SETTLE_SHORT: Duration = Duration::from_millis(500);
const SETTLE_LONG: Duration = Duration::from_secs(1);
const SETTLE_FORMAT: Duration = Duration::from_secs(2);

/// Offer `line` to the current stage. `None` means no trigger matched and
/// nothing changes.
pub fn transition(state: MachineState, line: &str, ctx: &MachineContext) -> Option<Transition> {
    let layout = &ctx.layout;
    let device = &ctx.device;
    let advance = |settle| Transition::to(state.advanced(), settle);

    match state.stage {
        Stage::Initial => line.contains(BOOT_PROMPT).then(|| {
            advance(SETTLE_LONG)
                .status("Provisioning platform ready.")
                .send("")
                .send("")
        }),
        Stage::Ready => line.contains(SHELL_PROMPT).then(|| {
            advance(SETTLE_SHORT)
                .status("Attaching target disk...")
                .attach(DiskRole::Target)
        }),
        Stage::DeviceAttached => line.contains(ATTACHED).then(|| {
            advance(SETTLE_SHORT)
                .status("Attaching companion image...")
                .send("")
                .attach(DiskRole::Companion)
        }),
        Stage::CompanionAttached => line.contains(ATTACHED).then(|| {
            advance(SETTLE_SHORT)
                .send("")
                .send(format!("parted {} --script mklabel msdos", layout.target))
        }),
        Stage::Format => line.contains(TABLE_TYPE).then(|| {
            advance(SETTLE_FORMAT)
                .status(format!("Writing image to {}...", device))
                .send(format!("dd if={} of={} bs=4M", layout.companion, layout.target))
        }),
        Stage::WriteImage => line.contains(COPY_DONE).then(|| {
            advance(SETTLE_SHORT)
                .status(format!("Repairing {}...", device))
                .send(format!("parted {}", layout.target))
        }),
        Stage::PartitionRepair => partition_repair(state, line, ctx),
        Stage::FilesystemCheck => line.contains(QUIT_ACK).then(|| {
            advance(SETTLE_SHORT)
                .status(format!("Checking {} filesystem...", device))
                .send(format!("e2fsck -f -p {}", layout.partition()))
        }),
        Stage::ResizeFilesystem => line.contains(GROWABLE).then(|| {
            advance(SETTLE_SHORT)
                .status(format!("Growing {} filesystem...", device))
                .send(format!("resize2fs {}", layout.partition()))
        }),
        Stage::Mount | Stage::WriteIdentity | Stage::Unmount if line.contains(MOUNT_FAILED) => {
            Some(Transition::halt(
                Duration::ZERO,
                "Mount failed, restart and try again.",
            ))
        }
        Stage::Mount => line.contains(RESIZED).then(|| {
            advance(SETTLE_LONG)
                .status(format!("Mounting {}...", device))
                .send(format!(
                    "mkdir -p {mp} && mount {} {mp}",
                    layout.partition(),
                    mp = layout.mountpoint
                ))
        }),
        Stage::WriteIdentity => line
            .contains(MOUNTED)
            .then(|| advance(SETTLE_LONG).send(ctx.identity_command.clone())),
        Stage::Unmount => (line.contains(&ctx.uuid) || line.contains(IDENTITY_KEY)).then(|| {
            advance(SETTLE_SHORT)
                .status(format!("Unmounting {}...", device))
                .send(format!("umount {}", layout.mountpoint))
        }),
        Stage::Finish => line.contains(UNMOUNTED).then(|| {
            advance(SETTLE_SHORT)
                .announce("Image written successfully.")
                .status("Shutting down provisioning platform...")
                .send(POWEROFF_COMMAND)
                .completed()
        }),
        Stage::Sink => None,
    }
}

/// The interactive parted session. Sub-triggers keep the stage; only the
/// `resizepart` echo advances it, and an unrepairable layout halts.
fn partition_repair(state: MachineState, line: &str, ctx: &MachineContext) -> Option<Transition> {
    let stay = |settle| Transition::to(state, settle);

    if state.legacy_boot {
        if line.contains(DATA_FILESYSTEM) {
            let cleared = MachineState {
                legacy_boot: false,
                ..state
            };
            return Some(
                Transition::to(cleared, SETTLE_SHORT)
                    .send(format!("resizepart {} 100%", ctx.layout.data_partition)),
            );
        }
        return Some(
            Transition::halt(
                Duration::ZERO,
                "Unexpected disk layout, please request remote support.",
            )
            .send("quit"),
        );
    }

    if line.contains(IO_ERROR) {
        Some(stay(SETTLE_SHORT).send("Retry"))
    } else if line.contains(REPAIR_WELCOME) {
        Some(stay(SETTLE_SHORT).send("print"))
    } else if line.contains(CORRUPT) {
        Some(stay(SETTLE_SHORT).send("OK"))
    } else if line.contains(TABLE_CURRENT) {
        Some(
            stay(SETTLE_SHORT)
                .status(format!("Repairing {} partition table...", ctx.device))
                .send("Fix"),
        )
    } else if line.contains(LEGACY_BOOT) {
        Some(Transition::to(
            MachineState {
                legacy_boot: true,
                ..state
            },
            Duration::ZERO,
        ))
    } else if line.contains(RESIZE_DONE) {
        Some(Transition::to(state.advanced(), SETTLE_SHORT).send("quit"))
    } else if line.contains(INCONSISTENT) {
        Some(Transition::halt(
            SETTLE_SHORT,
            "Inconsistent disk layout, try deleting the partitions.",
        ))
    } else {
        None
    }
}

/// A [`MachineState`] bound to its context; feeds lines and keeps the
/// state current.
#[derive(Debug, Clone)]
pub struct Machine {
    state: MachineState,
    ctx: MachineContext,
}

impl Machine {
    pub fn new(ctx: MachineContext) -> Self {
        Self {
            state: MachineState::initial(),
            ctx,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn stage(&self) -> Stage {
        self.state.stage
    }

    pub fn context(&self) -> &MachineContext {
        &self.ctx
    }

    /// Offer a line to the current stage and, on a match, move to the
    /// transition's next state.
    pub fn feed(&mut self, line: &str) -> Option<Transition> {
        let t = transition(self.state, line, &self.ctx)?;
        debug_assert!(
            t.next.stage == Stage::Sink || t.next.stage.index() <= self.state.stage.index() + 1,
            "stage may only advance by one or jump to the sink"
        );
        debug_assert!(t.next.stage >= self.state.stage, "stage may never move backwards");
        self.state = t.next;
        Some(t)
    }
}
