//! Configuration for provisioning sessions

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::channel::ConnectPolicy;
use crate::identity::IdentitySettings;
use crate::vmm::ports::DEFAULT_PORT_RANGE;
use crate::{Error, Result};

#[cfg(windows)]
const QEMU_BINARY_NAME: &str = "qemu-system-x86_64.exe";
#[cfg(not(windows))]
const QEMU_BINARY_NAME: &str = "qemu-system-x86_64";

/// Configuration shared by every provisioning session
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// QEMU system emulator binary
    pub qemu_binary: PathBuf,
    /// Boot/tool image the provisioning VM runs from (attached read-only)
    pub tool_image: PathBuf,
    /// Companion image copied block-for-block onto the target device
    pub companion_image: PathBuf,
    /// Guest memory ceiling in QEMU `-m` syntax (default: 512M)
    pub memory: String,
    /// Range scanned for the console/monitor port pair
    pub port_range: Range<u16>,
    /// Retry behaviour for the console and monitor connects
    pub connect: ConnectPolicy,
    /// Multiplier applied to every state settle delay (0 disables them)
    pub settle_scale: f64,
    /// Fixed fields of the identity payload
    pub identity: IdentitySettings,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self::with_base_dir(".")
    }
}

impl ProvisionConfig {
    /// Create a configuration with default values relative to the working directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Default layout under `base`: `qemutools/` holds the emulator and
    /// `img/` the tool and companion images.
    pub fn with_base_dir<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref();
        Self {
            qemu_binary: base.join("qemutools").join(QEMU_BINARY_NAME),
            tool_image: base.join("img").join("optool.img"),
            companion_image: base.join("img").join("netflex.img"),
            memory: "512M".to_string(),
            port_range: DEFAULT_PORT_RANGE,
            connect: ConnectPolicy::default(),
            settle_scale: 1.0,
            identity: IdentitySettings::default(),
        }
    }

    /// Load a YAML configuration file. Relative paths inside the file are
    /// resolved against the file's directory; omitted keys keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml(&content, base)
    }

    /// Parse YAML configuration text, resolving relative paths against `base`.
    pub fn from_yaml(content: &str, base: &Path) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(content)?;
        let mut config = Self::with_base_dir(base);

        if let Some(p) = file.qemu_binary {
            config.qemu_binary = resolve(base, p);
        }
        if let Some(p) = file.tool_image {
            config.tool_image = resolve(base, p);
        }
        if let Some(p) = file.companion_image {
            config.companion_image = resolve(base, p);
        }
        if let Some(memory) = file.memory {
            config.memory = memory;
        }
        if let Some(ports) = file.ports {
            config.port_range = ports.start..ports.end;
        }
        if let Some(connect) = file.connect {
            if let Some(backoff) = connect.backoff {
                config.connect.backoff = parse_duration("connect.backoff", &backoff)?;
            }
            config.connect.max_attempts = connect.max_attempts;
            if let Some(deadline) = connect.deadline {
                config.connect.deadline = Some(parse_duration("connect.deadline", &deadline)?);
            }
        }
        if let Some(scale) = file.settle_scale {
            config.settle_scale = scale;
        }
        if let Some(identity) = file.identity {
            config.identity = identity;
        }

        Ok(config)
    }

    /// Set the QEMU binary path
    pub fn qemu_binary<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.qemu_binary = path.into();
        self
    }

    /// Set the boot/tool image path
    pub fn tool_image<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.tool_image = path.into();
        self
    }

    /// Set the companion image path
    pub fn companion_image<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.companion_image = path.into();
        self
    }

    /// Set the guest memory ceiling
    pub fn memory<S: Into<String>>(mut self, memory: S) -> Self {
        self.memory = memory.into();
        self
    }

    /// Set the port scan range
    pub fn port_range(mut self, range: Range<u16>) -> Self {
        self.port_range = range;
        self
    }

    /// Set the connect retry policy
    pub fn connect(mut self, policy: ConnectPolicy) -> Self {
        self.connect = policy;
        self
    }

    /// Set the settle delay multiplier
    pub fn settle_scale(mut self, scale: f64) -> Self {
        self.settle_scale = scale;
        self
    }

    /// Set the identity payload's fixed fields
    pub fn identity(mut self, identity: IdentitySettings) -> Self {
        self.identity = identity;
        self
    }

    /// Scale a nominal settle delay by `settle_scale`. A scale that does not
    /// yield a representable delay leaves the nominal delay unscaled.
    pub fn settle(&self, nominal: Duration) -> Duration {
        Duration::try_from_secs_f64(nominal.as_secs_f64() * self.settle_scale).unwrap_or(nominal)
    }

    /// `settle_scale` must be finite and non-negative.
    pub fn check_settle_scale(&self) -> Result<()> {
        if !self.settle_scale.is_finite() || self.settle_scale < 0.0 {
            return Err(Error::Config(format!(
                "settle_scale must be a non-negative number, got {}",
                self.settle_scale
            )));
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (what, path) in [
            ("QEMU binary", &self.qemu_binary),
            ("Tool image", &self.tool_image),
            ("Companion image", &self.companion_image),
        ] {
            if !path.is_file() {
                return Err(Error::Config(format!("{} not found: {}", what, path.display())));
            }
        }

        if !is_memory_size(&self.memory) {
            return Err(Error::Config(format!(
                "Invalid memory size {:?} (expected e.g. 512M or 1G)",
                self.memory
            )));
        }

        if self.port_range.len() < 2 {
            return Err(Error::Config(format!(
                "Port range {}..{} must hold at least two ports",
                self.port_range.start, self.port_range.end
            )));
        }

        self.check_settle_scale()?;

        if self.connect.max_attempts == Some(0) {
            return Err(Error::Config("connect.max_attempts must be at least 1".into()));
        }

        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    qemu_binary: Option<PathBuf>,
    tool_image: Option<PathBuf>,
    companion_image: Option<PathBuf>,
    memory: Option<String>,
    ports: Option<PortsSection>,
    connect: Option<ConnectSection>,
    settle_scale: Option<f64>,
    identity: Option<IdentitySettings>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PortsSection {
    start: u16,
    end: u16,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConnectSection {
    backoff: Option<String>,
    max_attempts: Option<u32>,
    deadline: Option<String>,
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| Error::Config(format!("{}: invalid duration {:?}: {}", key, value, e)))
}

fn is_memory_size(s: &str) -> bool {
    let digits = s.trim_end_matches(['K', 'M', 'G', 'k', 'm', 'g']);
    let suffix_len = s.len() - digits.len();
    suffix_len <= 1 && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProvisionConfig::default();
        assert_eq!(config.memory, "512M");
        assert_eq!(config.port_range, 50000..60000);
        assert_eq!(config.connect.backoff, Duration::from_secs(1));
        assert_eq!(config.connect.max_attempts, None);
        assert!(config.tool_image.ends_with("img/optool.img"));
        assert!(config.companion_image.ends_with("img/netflex.img"));
    }

    #[test]
    fn test_builder_pattern() {
        let config = ProvisionConfig::new()
            .memory("1G")
            .port_range(40000..40010)
            .settle_scale(0.0)
            .qemu_binary("/usr/bin/qemu-system-x86_64");

        assert_eq!(config.memory, "1G");
        assert_eq!(config.port_range, 40000..40010);
        assert_eq!(config.settle(Duration::from_secs(2)), Duration::ZERO);
        assert_eq!(config.qemu_binary, PathBuf::from("/usr/bin/qemu-system-x86_64"));
    }

    #[test]
    fn test_settle_never_panics_on_bad_scale() {
        let nominal = Duration::from_millis(500);
        assert_eq!(ProvisionConfig::new().settle(nominal), nominal);
        assert_eq!(
            ProvisionConfig::new().settle_scale(0.5).settle(nominal),
            Duration::from_millis(250)
        );
        for scale in [-1.0, f64::NAN, f64::INFINITY] {
            let config = ProvisionConfig::new().settle_scale(scale);
            assert_eq!(config.settle(nominal), nominal, "scale {scale}");
            assert!(matches!(config.check_settle_scale(), Err(Error::Config(_))));
        }

        // Finite but too large to represent as a delay.
        assert_eq!(ProvisionConfig::new().settle_scale(1e300).settle(nominal), nominal);
    }

    #[test]
    fn test_from_yaml_resolves_relative_paths() {
        let yaml = r#"
qemu_binary: /opt/qemu/bin/qemu-system-x86_64
tool_image: images/tool.img
memory: 768M
ports:
  start: 41000
  end: 41100
connect:
  backoff: 250ms
  max_attempts: 40
  deadline: 2m
settle_scale: 0.5
identity:
  local_port: 9000
"#;
        let config = ProvisionConfig::from_yaml(yaml, Path::new("/etc/flashbox")).unwrap();
        assert_eq!(config.qemu_binary, PathBuf::from("/opt/qemu/bin/qemu-system-x86_64"));
        assert_eq!(config.tool_image, PathBuf::from("/etc/flashbox/images/tool.img"));
        assert_eq!(config.companion_image, PathBuf::from("/etc/flashbox/img/netflex.img"));
        assert_eq!(config.memory, "768M");
        assert_eq!(config.port_range, 41000..41100);
        assert_eq!(config.connect.backoff, Duration::from_millis(250));
        assert_eq!(config.connect.max_attempts, Some(40));
        assert_eq!(config.connect.deadline, Some(Duration::from_secs(120)));
        assert_eq!(config.settle_scale, 0.5);
        assert_eq!(config.identity.local_port, 9000);
        assert_eq!(config.identity.heartbeat_retries, 3);
    }

    #[test]
    fn test_from_yaml_rejects_bad_duration() {
        let err = ProvisionConfig::from_yaml("connect:\n  backoff: soon\n", Path::new("."))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_yaml_rejects_unknown_keys() {
        assert!(ProvisionConfig::from_yaml("memroy: 1G\n", Path::new(".")).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flashbox.yaml");
        fs::write(&path, "memory: 1G\n").unwrap();
        let config = ProvisionConfig::from_file(&path).unwrap();
        assert_eq!(config.memory, "1G");
        assert_eq!(config.tool_image, dir.path().join("img").join("optool.img"));
    }

    #[test]
    fn test_validation_missing_files() {
        let config = ProvisionConfig::with_base_dir("/tmp/nonexistent-flashbox");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_accepts_complete_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProvisionConfig::with_base_dir(dir.path());
        fs::create_dir_all(config.qemu_binary.parent().unwrap()).unwrap();
        fs::create_dir_all(config.tool_image.parent().unwrap()).unwrap();
        fs::write(&config.qemu_binary, b"").unwrap();
        fs::write(&config.tool_image, b"").unwrap();
        fs::write(&config.companion_image, b"").unwrap();
        config.validate().unwrap();

        assert!(config.clone().memory("lots").validate().is_err());
        assert!(config.clone().port_range(50000..50001).validate().is_err());
        assert!(config.clone().settle_scale(-1.0).validate().is_err());
    }

    #[test]
    fn test_memory_size_shapes() {
        assert!(is_memory_size("512M"));
        assert!(is_memory_size("2048"));
        assert!(is_memory_size("1g"));
        assert!(!is_memory_size("M"));
        assert!(!is_memory_size("512MB"));
        assert!(!is_memory_size("5x2M"));
    }
}
