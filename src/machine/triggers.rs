//! Console substrings that drive the pipeline.
//!
//! The guest shell has no structured output; these markers are the whole
//! contract between the tool image and the state machine.

/// Boot banner of the tool image ("Please press Enter to activate this console.")
pub const BOOT_PROMPT: &str = "Please";
/// Root shell prompt
pub const SHELL_PROMPT: &str = "#";
/// Kernel message after a hot-attached SCSI disk is probed
pub const ATTACHED: &str = "Attached";
/// Echo of the `mklabel msdos` command
pub const TABLE_TYPE: &str = "msdos";
/// `dd` summary ("N+0 records out")
pub const COPY_DONE: &str = "out";

/// parted hit a transient I/O error and offers Retry
pub const IO_ERROR: &str = "I/O";
/// parted interactive banner
pub const REPAIR_WELCOME: &str = "Welcome";
/// parted found a corrupt table and offers OK
pub const CORRUPT: &str = "corrupt";
/// parted offers to fix the table to use the current disk size
pub const TABLE_CURRENT: &str = "current";
/// Partition flag marking the legacy-boot layout
pub const LEGACY_BOOT: &str = "legacy_boot";
/// Data partition row expected right after the legacy-boot row
pub const DATA_FILESYSTEM: &str = "ext2";
/// Echo of the `resizepart` command
pub const RESIZE_DONE: &str = "resizepart";
/// parted reports a layout it cannot repair
pub const INCONSISTENT: &str = "inconsistency";

/// Echo of parted's `quit`
pub const QUIT_ACK: &str = "quit";
/// e2fsck summary ("... non-contiguous) ...")
pub const GROWABLE: &str = "contiguous";
/// resize2fs summary ("... is now N blocks long.")
pub const RESIZED: &str = "long";
/// mount rejected its arguments
pub const MOUNT_FAILED: &str = "argument";
/// Echo of the mkdir/mount command
pub const MOUNTED: &str = "mkdir";
/// Key of the unique id in the echoed identity payload
pub const IDENTITY_KEY: &str = "UUID:";
/// Echo of the umount command
pub const UNMOUNTED: &str = "umount";
