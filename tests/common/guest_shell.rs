//! A scripted stand-in for the tool image's shell.
//!
//! `GuestShell` answers console commands and monitor hot-plugs with the
//! console output the real guest produces (busybox shell echo, parted, dd,
//! e2fsck, resize2fs and kernel SCSI messages). It is synchronous; the
//! socket-serving wrapper lives in `fake_guest.rs`.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};

use flashbox::identity::unescape;

/// Partition table parted finds after the image copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskLayout {
    /// Legacy-boot partition followed by the ext2 data partition
    LegacyBoot,
    /// Legacy-boot partition followed by something that is not ext2
    Unexpected,
    /// parted reports a table inconsistency it cannot repair
    Inconsistent,
}

/// Knobs for the simulated disk and guest.
#[derive(Debug, Clone)]
pub struct GuestScript {
    pub layout: DiskLayout,
    /// parted first hits a transient I/O error
    pub io_error: bool,
    /// parted finds the backup GPT corrupt
    pub corrupt_table: bool,
    /// mount rejects the data partition
    pub mount_fails: bool,
}

impl Default for GuestScript {
    fn default() -> Self {
        Self {
            layout: DiskLayout::LegacyBoot,
            io_error: false,
            corrupt_table: false,
            mount_fails: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shell,
    Parted,
}

#[derive(Debug)]
pub struct GuestShell {
    script: GuestScript,
    mode: Mode,
    pending_prompts: VecDeque<Vec<String>>,
    /// Every console command received, in order
    pub console_log: Vec<String>,
    /// Every monitor command received, in order
    pub monitor_log: Vec<String>,
    /// Files written with `echo -e "..." > path`
    pub files: HashMap<String, String>,
    pub powered_off: bool,
}

impl GuestShell {
    pub fn new(script: GuestScript) -> Self {
        Self {
            script,
            mode: Mode::Shell,
            pending_prompts: VecDeque::new(),
            console_log: Vec::new(),
            monitor_log: Vec::new(),
            files: HashMap::new(),
            powered_off: false,
        }
    }

    /// Console output once the kernel has booted.
    pub fn boot(&self) -> Vec<String> {
        lines(&[
            "[    1.204511] Freeing unused kernel image memory: 1060K",
            "Please press Enter to activate this console.",
        ])
    }

    /// Console output caused by a monitor command.
    pub fn monitor(&mut self, command: &str) -> Vec<String> {
        self.monitor_log.push(command.to_string());
        if !command.starts_with("device_add") {
            return Vec::new();
        }
        if command.contains("drive=disk1") {
            lines(&[
                "scsi 0:0:1:0: Direct-Access     QEMU     QEMU HARDDISK    2.5+ PQ: 0 ANSI: 5",
                "sd 0:0:1:0: [sdb] Attached SCSI disk",
            ])
        } else if command.contains("drive=disk2") {
            lines(&[
                "scsi 0:0:2:0: Direct-Access     QEMU     QEMU HARDDISK    2.5+ PQ: 0 ANSI: 5",
                "sd 0:0:2:0: [sdc] Attached SCSI disk",
            ])
        } else {
            Vec::new()
        }
    }

    /// Console output (echo included) for one console command.
    pub fn console(&mut self, command: &str) -> Vec<String> {
        self.console_log.push(command.to_string());
        match self.mode {
            Mode::Shell => self.shell(command),
            Mode::Parted => self.parted(command),
        }
    }

    fn shell(&mut self, command: &str) -> Vec<String> {
        let mut out = vec![format!("/ # {}", command).trim_end().to_string()];

        if command == "parted /dev/sdb" {
            self.mode = Mode::Parted;
            out.extend(lines(&[
                "GNU Parted 3.4",
                "Using /dev/sdb",
                "Welcome to GNU Parted! Type 'help' to view a list of commands.",
            ]));
        } else if command.starts_with("dd ") {
            out.extend(lines(&[
                "1024+0 records in",
                "1024+0 records out",
                "4294967296 bytes (4.0GB) copied, 41.203188 seconds, 99.4MB/s",
            ]));
        } else if command.starts_with("e2fsck") {
            out.push("/dev/sdb2: 11/229376 files (0.0% non-contiguous), 31285/917504 blocks".into());
        } else if command.starts_with("resize2fs") {
            out.extend(lines(&[
                "resize2fs 1.46.5 (30-Dec-2021)",
                "Resizing the filesystem on /dev/sdb2 to 2097152 (4k) blocks.",
                "The filesystem on /dev/sdb2 is now 2097152 (4k) blocks long.",
            ]));
        } else if command.starts_with("mkdir -p") && self.script.mount_fails {
            out.push("mount: mounting /dev/sdb2 on /mnt/disk failed: Invalid argument".into());
        } else if let Some(rest) = command.strip_prefix("echo -e \"") {
            if let Some((payload, path)) = rest.rsplit_once("\" > ") {
                self.files.insert(path.to_string(), unescape(payload));
            }
        } else if command == "poweroff" {
            self.powered_off = true;
            out.push("The system is going down NOW!".into());
        }
        out
    }

    fn parted(&mut self, command: &str) -> Vec<String> {
        let mut out = vec![format!("(parted) {}", command)];

        match command {
            "print" => {
                if self.script.io_error {
                    self.pending_prompts.push_back(lines(&[
                        "Error: I/O error during read on /dev/sdb",
                        "Retry/Ignore/Cancel?",
                    ]));
                }
                if self.script.corrupt_table {
                    self.pending_prompts.push_back(lines(&[
                        "Error: The backup GPT table is corrupt, but the primary appears OK, so that will be used.",
                        "OK/Cancel?",
                    ]));
                }
                self.pending_prompts.push_back(lines(&[
                    "Warning: Not all of the space available to /dev/sdb appears to be used, you can fix the GPT to use all of the space (an extra 8388608 blocks) or continue with the current setting?",
                    "Fix/Ignore?",
                ]));
                out.extend(self.next_prompt_or_table());
            }
            "Retry" | "OK" | "Fix" => out.extend(self.next_prompt_or_table()),
            "quit" => {
                self.mode = Mode::Shell;
                out.push("Information: You may need to update /etc/fstab.".into());
            }
            _ => {}
        }
        out
    }

    fn next_prompt_or_table(&mut self) -> Vec<String> {
        match self.pending_prompts.pop_front() {
            Some(prompt) => prompt,
            None => self.table(),
        }
    }

    fn table(&self) -> Vec<String> {
        let mut out = lines(&[
            "Model: QEMU QEMU HARDDISK (scsi)",
            "Disk /dev/sdb: 8590MB",
            "Sector size (logical/physical): 512B/512B",
            "Partition Table: gpt",
            "Number  Start   End     Size    File system  Name  Flags",
        ]);
        match self.script.layout {
            DiskLayout::LegacyBoot => out.extend(lines(&[
                " 1      1049kB  538MB   537MB   fat32              boot, legacy_boot",
                " 2      538MB   4295MB  3757MB  ext2",
            ])),
            DiskLayout::Unexpected => out.extend(lines(&[
                " 1      1049kB  538MB   537MB   fat32              boot, legacy_boot",
                " 2      538MB   4295MB  3757MB  ntfs         data",
            ])),
            DiskLayout::Inconsistent => out.push(
                "Warning: The partition table has an inconsistency: partition 2 overlaps partition 1.".into(),
            ),
        }
        out
    }
}

fn lines(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|l| l.to_string()).collect()
}
