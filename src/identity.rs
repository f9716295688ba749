//! Identity payload written onto the provisioned filesystem.
//!
//! Every session generates a fresh v4 UUID and renders it, together with the
//! operator-supplied management and device identifiers, into a small YAML
//! document. The document reaches the guest inside a single
//! `echo -e "..." > file` console command, so [`Identity::escaped`] returns a
//! form that survives the guest shell's double-quote expansion and `echo -e`
//! escape processing unchanged.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Fixed, non per-device values of the identity payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    /// Local port the provisioned agent listens on.
    pub local_port: u16,
    /// Upstream server hostnames.
    pub servers: Vec<String>,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval: u32,
    /// Heartbeat retries before the agent fails over.
    pub heartbeat_retries: u32,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            local_port: 56765,
            servers: (1..=6)
                .map(|i| format!("clent{}.duoruduochu.com", i))
                .collect(),
            heartbeat_interval: 10,
            heartbeat_retries: 3,
        }
    }
}

/// On-disk shape of `/etc/system.yaml`. Field order is the key order of the
/// written document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDocument {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "HeartbeatInterval")]
    pub heartbeat_interval: u32,
    #[serde(rename = "HeartbeatRetries")]
    pub heartbeat_retries: u32,
    #[serde(rename = "LocalPort")]
    pub local_port: u16,
    #[serde(rename = "ManagementID")]
    pub management_id: String,
    #[serde(rename = "Servers")]
    pub servers: Vec<String>,
    #[serde(rename = "UUID")]
    pub uuid: String,
}

/// A generated identity: the unique id plus its rendered YAML.
#[derive(Debug, Clone)]
pub struct Identity {
    uuid: Uuid,
    document: IdentityDocument,
    yaml: String,
}

impl Identity {
    /// Build a new identity with a freshly generated UUID.
    pub fn generate(
        management_id: &str,
        device_id: &str,
        settings: &IdentitySettings,
    ) -> Result<Self> {
        Self::with_uuid(Uuid::new_v4(), management_id, device_id, settings)
    }

    /// Build an identity around a caller-chosen UUID.
    pub fn with_uuid(
        uuid: Uuid,
        management_id: &str,
        device_id: &str,
        settings: &IdentitySettings,
    ) -> Result<Self> {
        if management_id.trim().is_empty() {
            return Err(Error::Request("management id must not be empty".into()));
        }
        if device_id.trim().is_empty() {
            return Err(Error::Request("device id must not be empty".into()));
        }

        let document = IdentityDocument {
            device_id: device_id.to_string(),
            heartbeat_interval: settings.heartbeat_interval,
            heartbeat_retries: settings.heartbeat_retries,
            local_port: settings.local_port,
            management_id: management_id.to_string(),
            servers: settings.servers.clone(),
            uuid: uuid.to_string(),
        };
        let yaml = serde_yaml::to_string(&document)?;

        Ok(Self {
            uuid,
            document,
            yaml,
        })
    }

    /// The generated unique identifier.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn document(&self) -> &IdentityDocument {
        &self.document
    }

    /// The payload as plain YAML.
    pub fn yaml(&self) -> &str {
        &self.yaml
    }

    /// The payload escaped for embedding between double quotes of an
    /// `echo -e` command.
    pub fn escaped(&self) -> String {
        escape(&self.yaml)
    }
}

/// Escape `raw` so that `echo -e "<escaped>"` run by a POSIX shell prints
/// `raw` verbatim.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + raw.len() / 8);
    for c in raw.chars() {
        match c {
            // shell turns `\\\\` into `\\`, echo -e turns that into `\`
            '\\' => out.push_str("\\\\\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            '$' => out.push_str("\\$"),
            '`' => out.push_str("\\`"),
            _ => out.push(c),
        }
    }
    out
}

/// Invert [`escape`]: what the guest writes to disk for an escaped payload.
pub fn unescape(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('"') => out.push('"'),
            Some('$') => out.push('$'),
            Some('`') => out.push('`'),
            Some('\\') => {
                // second half of a `\\\\` quad
                if chars.peek() == Some(&'\\') {
                    chars.next();
                    chars.next();
                }
                out.push('\\');
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
