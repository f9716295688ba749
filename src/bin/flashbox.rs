use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use flashbox::logging;
use flashbox::vmm::allocate_port_pair;
use flashbox::{
    ProvisionConfig, ProvisionRequest, QemuLauncher, Session, SessionEvent, SessionHandle,
};

#[derive(Debug, Parser)]
#[command(
    name = "flashbox",
    about = "Provision a block device through a throwaway QEMU VM",
    author,
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write the companion image and a fresh identity onto a device.
    Provision {
        /// Host path of the target device.
        #[arg(long)]
        device: String,
        #[arg(long)]
        management_id: String,
        #[arg(long)]
        device_id: String,
        /// YAML configuration file; defaults are relative to the working directory.
        #[arg(long)]
        config: Option<PathBuf>,
        /// QEMU system emulator binary.
        #[arg(long, env = "FLASHBOX_QEMU")]
        qemu: Option<PathBuf>,
        #[arg(long)]
        tool_image: Option<PathBuf>,
        #[arg(long)]
        companion_image: Option<PathBuf>,
        /// Forward stdin lines to the guest console.
        #[arg(long)]
        interactive: bool,
        /// Print status events as JSON lines.
        #[arg(long)]
        json: bool,
        /// Also write logs to this file.
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Load and validate a configuration, then print the QEMU command line.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Provision {
            device,
            management_id,
            device_id,
            config,
            qemu,
            tool_image,
            companion_image,
            interactive,
            json,
            log_file,
        } => {
            let _guard = logging::init(log_file.as_deref());
            let overrides = Overrides {
                qemu,
                tool_image,
                companion_image,
            };
            let request = ProvisionRequest::new(device, management_id, device_id);
            cmd_provision(config, overrides, request, interactive, json).await
        }
        Commands::CheckConfig { config } => {
            let _guard = logging::init(None);
            cmd_check_config(config)
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

struct Overrides {
    qemu: Option<PathBuf>,
    tool_image: Option<PathBuf>,
    companion_image: Option<PathBuf>,
}

fn load_config(path: Option<PathBuf>, overrides: Overrides) -> flashbox::Result<ProvisionConfig> {
    let mut config = match path {
        Some(path) => ProvisionConfig::from_file(path)?,
        None => ProvisionConfig::new(),
    };
    if let Some(p) = overrides.qemu {
        config = config.qemu_binary(p);
    }
    if let Some(p) = overrides.tool_image {
        config = config.tool_image(p);
    }
    if let Some(p) = overrides.companion_image {
        config = config.companion_image(p);
    }
    config.validate()?;
    Ok(config)
}

/// Returns whether provisioning finished.
async fn cmd_provision(
    config: Option<PathBuf>,
    overrides: Overrides,
    request: ProvisionRequest,
    interactive: bool,
    json: bool,
) -> flashbox::Result<bool> {
    let config = load_config(config, overrides)?;
    let launcher = Arc::new(QemuLauncher::new(&config));
    let mut session = Session::new(config, request, launcher)?;
    let Some(mut events) = session.take_events() else {
        return Ok(false);
    };
    info!(uuid = %session.identity().uuid(), "identity generated");

    if interactive {
        spawn_stdin_forwarder(session.handle());
    }

    let run = session.run();
    tokio::pin!(run);

    loop {
        tokio::select! {
            result = &mut run => {
                while let Ok(event) = events.try_recv() {
                    print_event(&event, json)?;
                }
                let report = result?;
                info!(outcome = ?report.outcome, stage = %report.stage, "session ended");
                return Ok(report.is_success());
            }
            Some(event) = events.recv() => {
                print_event(&event, json)?;
                if matches!(event, SessionEvent::Halted(_)) {
                    // Dropping the session kills the VM.
                    return Ok(false);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, shutting down");
                return Ok(false);
            }
        }
    }
}

fn cmd_check_config(path: PathBuf) -> flashbox::Result<bool> {
    let config = load_config(
        Some(path.clone()),
        Overrides {
            qemu: None,
            tool_image: None,
            companion_image: None,
        },
    )?;
    let ports = allocate_port_pair(config.port_range.clone())?;
    println!("valid: {}", path.display());
    println!("{}", QemuLauncher::new(&config).command_line(ports));
    Ok(true)
}

fn print_event(event: &SessionEvent, json: bool) -> flashbox::Result<()> {
    if json {
        println!("{}", event.to_json_line()?);
    } else {
        println!("{}", event);
    }
    Ok(())
}

fn spawn_stdin_forwarder(handle: SessionHandle) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if handle.send_command(line).is_err() {
                break;
            }
        }
    });
}
