//! Error types for flashbox

use thiserror::Error;

/// Result type alias using flashbox Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while provisioning a device
#[derive(Error, Debug)]
pub enum Error {
    /// Fewer than two free ports in the configured range
    #[error("No free console/monitor port pair in {start}..{end}")]
    PortExhausted { start: u16, end: u16 },

    /// The provisioning VM could not be started
    #[error("Launch error: {0}")]
    Launch(String),

    /// A channel connect gave up after its attempt cap or deadline
    #[error("Gave up connecting to {channel} after {attempts} attempts")]
    ConnectExhausted { channel: String, attempts: u32 },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid provisioning request (blank device or identifiers)
    #[error("Invalid request: {0}")]
    Request(String),

    /// Monitor channel errors
    #[error("Monitor error: {0}")]
    Monitor(String),

    /// Console channel errors
    #[error("Console error: {0}")]
    Console(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
