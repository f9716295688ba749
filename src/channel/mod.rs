//! TCP channels to the provisioning VM.
//!
//! QEMU exposes two TCP servers on localhost: the serial console (a plain
//! shell session) and the human monitor (device control). Both come up at
//! some point during boot, so connecting is a retry loop with a fixed
//! backoff. By default the loop never gives up; [`ConnectPolicy`] can cap it
//! by attempts or by wall-clock deadline.

pub mod console;
pub mod monitor;

use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::session::events::StatusSink;
use crate::{Error, Result};

/// Which of the two VM channels a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Console,
    Monitor,
}

impl ChannelKind {
    fn title(self) -> &'static str {
        match self {
            ChannelKind::Console => "Console",
            ChannelKind::Monitor => "Monitor",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Console => f.write_str("console"),
            ChannelKind::Monitor => f.write_str("monitor"),
        }
    }
}

/// Retry behaviour for channel connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Pause between failed attempts (default: 1s)
    pub backoff: Duration,
    /// Give up after this many attempts (default: never)
    pub max_attempts: Option<u32>,
    /// Give up once this much time has passed since the first attempt
    pub deadline: Option<Duration>,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            max_attempts: None,
            deadline: None,
        }
    }
}

impl ConnectPolicy {
    /// Bounded policy, mostly useful in tests.
    pub fn bounded(backoff: Duration, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: Some(max_attempts),
            deadline: None,
        }
    }

    fn exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        if let Some(max) = self.max_attempts {
            if attempts >= max {
                return true;
            }
        }
        if let Some(deadline) = self.deadline {
            if elapsed.saturating_add(self.backoff) > deadline {
                return true;
            }
        }
        false
    }
}

/// Connect to `127.0.0.1:port`, retrying according to `policy`.
pub async fn connect_with_retry(
    kind: ChannelKind,
    port: u16,
    policy: &ConnectPolicy,
    status: &StatusSink,
) -> Result<TcpStream> {
    status.status(format!("Connecting to {}...", kind));
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);
        match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
            Ok(stream) => {
                info!(channel = %kind, port, attempts, "channel connected");
                status.status(format!("{} connected.", kind.title()));
                return Ok(stream);
            }
            Err(e) => {
                debug!(channel = %kind, port, attempts, error = %e, "connect failed");
                if policy.exhausted(attempts, started.elapsed()) {
                    return Err(Error::ConnectExhausted {
                        channel: kind.to_string(),
                        attempts,
                    });
                }
                status.status(format!(
                    "Connecting to {} failed, retrying...",
                    kind
                ));
                tokio::time::sleep(policy.backoff).await;
            }
        }
    }
}
