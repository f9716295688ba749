//! Serial console I/O: line reassembly, the Line Reader and the Command Sender.
//!
//! The console is an unframed byte stream from the guest shell. The reader
//! turns it into trimmed, non-empty lines and hands each one to a
//! [`LineHandler`] in arrival order. The sender drains the command queue and
//! writes every command newline-terminated. The two loops share nothing but
//! the queue and a [`Notify`] the reader fires when it exits.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::session::events::StatusSink;

/// The command after which the sender stops.
pub const POWEROFF_COMMAND: &str = "poweroff";

const READ_CHUNK: usize = 4096;
const READ_RETRY_PAUSE: Duration = Duration::from_millis(200);

/// Receives console lines from [`read_loop`].
#[async_trait::async_trait]
pub trait LineHandler: Send {
    /// Handle one complete, trimmed, non-empty console line.
    async fn handle_line(&mut self, line: &str);
}

/// Reassembles newline-delimited lines from arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completed, trimmed, with
    /// blank lines dropped. Bytes after the last newline stay buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let remainder = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, remainder);

        complete
            .split(|b| *b == b'\n')
            .filter_map(|raw| {
                let line = String::from_utf8_lossy(raw);
                let line = line.trim();
                (!line.is_empty()).then(|| line.to_string())
            })
            .collect()
    }

    /// Bytes received after the last newline.
    pub fn remainder(&self) -> &[u8] {
        &self.pending
    }
}

/// Read the console until `running` is cleared or the stream closes,
/// dispatching every line to `handler`. Fires `done` on exit.
pub async fn read_loop<R, H>(
    mut reader: R,
    handler: &mut H,
    running: Arc<AtomicBool>,
    done: Arc<Notify>,
    status: &StatusSink,
) where
    R: AsyncRead + Unpin + Send,
    H: LineHandler + ?Sized,
{
    // Fires `done` on every exit path, including a panicking handler.
    let _done = NotifyOnDrop(done);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut lines = LineBuffer::new();

    while running.load(Ordering::SeqCst) {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                info!("console closed by the guest");
                break;
            }
            Ok(n) => {
                trace!(bytes = n, "console chunk");
                for line in lines.push(&chunk[..n]) {
                    debug!(target: "flashbox::console", "<< {}", line);
                    handler.handle_line(&line).await;
                }
            }
            Err(e) if is_disconnect(&e) => {
                warn!(error = %e, "console disconnected");
                status.status(format!("Console disconnected: {}", e));
                break;
            }
            Err(e) => {
                warn!(error = %e, "console read failed");
                status.status(format!("Console read error: {}", e));
                tokio::time::sleep(READ_RETRY_PAUSE).await;
            }
        }
    }
}

struct NotifyOnDrop(Arc<Notify>);

impl Drop for NotifyOnDrop {
    fn drop(&mut self) {
        self.0.notify_one();
    }
}

/// Drain `queue` onto the console until `poweroff` has been written, the
/// queue closes, or the reader has exited and nothing is left queued.
pub async fn send_loop<W>(
    mut writer: W,
    mut queue: UnboundedReceiver<String>,
    reader_done: Arc<Notify>,
    status: &StatusSink,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;
            command = queue.recv() => {
                let Some(command) = command else { break };
                if send_one(&mut writer, &command, status).await {
                    break;
                }
            }
            _ = reader_done.notified() => {
                while let Ok(command) = queue.try_recv() {
                    if send_one(&mut writer, &command, status).await {
                        break;
                    }
                }
                break;
            }
        }
    }

    debug!("command sender exiting");
}

/// Write one command. Returns true when it was the poweroff command.
async fn send_one<W>(writer: &mut W, command: &str, status: &StatusSink) -> bool
where
    W: AsyncWrite + Unpin + Send,
{
    debug!(target: "flashbox::console", ">> {}", command);
    let framed = format!("{}\n", command);
    let result = async {
        writer.write_all(framed.as_bytes()).await?;
        writer.flush().await
    }
    .await;

    if let Err(e) = result {
        warn!(command, error = %e, "console send failed");
        status.status(format!("Send error: {}", e));
    }
    command == POWEROFF_COMMAND
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
