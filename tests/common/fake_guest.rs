//! A `VmLauncher` that serves the console and monitor ports itself.
//!
//! Instead of spawning QEMU, `FakeLauncher::launch` binds both TCP servers on
//! the allocated ports and runs a `GuestShell` behind them, so a real
//! `Session` can be driven end to end over sockets.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use flashbox::vmm::{PortPair, VmLauncher, VmProcess};
use flashbox::{Error, Result};

use crate::guest_shell::{GuestScript, GuestShell};

pub struct FakeLauncher {
    pub shell: Arc<Mutex<GuestShell>>,
    pub terminations: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new(script: GuestScript) -> Self {
        Self {
            shell: Arc::new(Mutex::new(GuestShell::new(script))),
            terminations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn console_log(&self) -> Vec<String> {
        self.shell.lock().unwrap().console_log.clone()
    }

    pub fn monitor_log(&self) -> Vec<String> {
        self.shell.lock().unwrap().monitor_log.clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.shell.lock().unwrap().files.get(path).cloned()
    }
}

#[async_trait::async_trait]
impl VmLauncher for FakeLauncher {
    async fn launch(&self, ports: PortPair) -> Result<Box<dyn VmProcess>> {
        let console = TcpListener::bind((Ipv4Addr::LOCALHOST, ports.console))
            .await
            .map_err(|e| Error::Launch(format!("fake console bind: {}", e)))?;
        let monitor = TcpListener::bind((Ipv4Addr::LOCALHOST, ports.monitor))
            .await
            .map_err(|e| Error::Launch(format!("fake monitor bind: {}", e)))?;

        let task = tokio::spawn(serve(console, monitor, self.shell.clone()));
        Ok(Box::new(FakeVm {
            task,
            terminations: self.terminations.clone(),
        }))
    }
}

pub struct FakeVm {
    task: JoinHandle<()>,
    terminations: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl VmProcess for FakeVm {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn terminate(&mut self) -> Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        // Let the guest finish reading what the session already flushed.
        let _ = tokio::time::timeout(Duration::from_secs(2), &mut self.task).await;
        self.task.abort();
        Ok(())
    }
}

impl Drop for FakeVm {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(console: TcpListener, monitor: TcpListener, shell: Arc<Mutex<GuestShell>>) {
    let Ok((console, _)) = console.accept().await else {
        return;
    };
    let Ok((monitor, _)) = monitor.accept().await else {
        return;
    };
    let (console_read, mut console_write) = console.into_split();
    let (monitor_read, mut monitor_write) = monitor.into_split();
    let mut console_lines = BufReader::new(console_read).lines();
    let mut monitor_lines = BufReader::new(monitor_read).lines();

    let _ = monitor_write
        .write_all(b"QEMU 8.2.0 monitor - type 'help' for more information\r\n(qemu) ")
        .await;
    let boot = shell.lock().unwrap().boot();
    if write_lines(&mut console_write, boot).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            line = console_lines.next_line() => {
                let Ok(Some(command)) = line else { break };
                let (output, powered_off) = {
                    let mut shell = shell.lock().unwrap();
                    let output = shell.console(command.trim_end_matches('\r'));
                    (output, shell.powered_off)
                };
                if write_lines(&mut console_write, output).await.is_err() {
                    break;
                }
                if powered_off {
                    let _ = console_write.shutdown().await;
                    break;
                }
            }
            line = monitor_lines.next_line() => {
                let Ok(Some(command)) = line else { break };
                let output = shell.lock().unwrap().monitor(command.trim());
                let _ = monitor_write.write_all(b"(qemu) ").await;
                if write_lines(&mut console_write, output).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn write_lines(writer: &mut OwnedWriteHalf, lines: Vec<String>) -> std::io::Result<()> {
    for line in lines {
        writer.write_all(format!("{}\r\n", line).as_bytes()).await?;
    }
    writer.flush().await
}
