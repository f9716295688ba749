//! QEMU human-monitor channel used to hot-attach disks after boot.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{Error, Result};

/// SCSI bus every hot-attached disk joins; created by the launcher.
pub const SCSI_BUS: &str = "scsi0.0";

/// Write side of the monitor connection.
pub struct MonitorChannel<W> {
    writer: W,
}

impl<W> MonitorChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Attach the raw image or device at `path` as drive `drive_id`, then
    /// plug it into the SCSI bus. Both commands are attempted even if the
    /// first fails; the first failure is returned.
    pub async fn attach_disk(&mut self, path: &Path, drive_id: &str) -> Result<()> {
        let add = format!(
            "drive_add 0 file={},if=none,id={},format=raw",
            path.display(),
            drive_id
        );
        let plug = format!("device_add scsi-hd,drive={},bus={}", drive_id, SCSI_BUS);

        let first = self.send(&add).await;
        let second = self.send(&plug).await;
        first.and(second)
    }

    /// Send one newline-terminated monitor command.
    pub async fn send(&mut self, command: &str) -> Result<()> {
        debug!(target: "flashbox::monitor", ">> {}", command);
        self.writer
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .map_err(|e| Error::Monitor(format!("{}: {}", command, e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Monitor(format!("{}: {}", command, e)))
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Consume monitor output so QEMU never blocks writing to it. Lines are
/// traced at debug level; the task ends when the monitor closes.
pub fn spawn_drain<R>(reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        debug!(target: "flashbox::monitor", "<< {}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "monitor drain stopped");
                    break;
                }
            }
        }
    })
}
