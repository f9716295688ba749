//! Session status stream consumed by the UI collaborator.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Sentinel rendered for [`SessionEvent::Finished`].
pub const FINISHED_SENTINEL: &str = "FINISHED";

/// One entry of the ordered status stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "message", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Progress or diagnostic line
    Status(String),
    /// The pipeline jumped to its terminal state; the operator must restart
    Halted(String),
    /// Provisioning completed; always the last event of a successful session
    Finished,
}

impl SessionEvent {
    /// Render as a single JSON object (no trailing newline).
    pub fn to_json_line(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Status(msg) | SessionEvent::Halted(msg) => f.write_str(msg),
            SessionEvent::Finished => f.write_str(FINISHED_SENTINEL),
        }
    }
}

/// Producer side of the status stream. Every event is mirrored to tracing.
#[derive(Debug, Clone)]
pub struct StatusSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl StatusSink {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// A sink plus the receiver the UI reads from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "flashbox::status", "{}", message);
        self.emit(SessionEvent::Status(message));
    }

    pub fn halted(&self, message: impl Into<String>) {
        let message = message.into();
        error!(target: "flashbox::status", "halted: {}", message);
        self.emit(SessionEvent::Halted(message));
    }

    pub fn finished(&self) {
        info!(target: "flashbox::status", "{}", FINISHED_SENTINEL);
        self.emit(SessionEvent::Finished);
    }

    fn emit(&self, event: SessionEvent) {
        // A closed receiver only means nobody is watching anymore.
        let _ = self.tx.send(event);
    }
}
