//! Photocal Application
//!
//! Command-line entry point for the goggle light-discomfort calibration
//! experiment.
//!
//! # Usage
//!
//! ```bash
//! # Run a session against real hardware (prompts for participant info)
//! photocal run
//!
//! # Run against the built-in goggle simulator, no hardware needed
//! photocal run --device simulate
//!
//! # Pre-supply session identity from the command line
//! photocal run --participant p01 --session s1 --start 128
//!
//! # List serial ports / write a default configuration file
//! photocal devices
//! photocal init-config
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use photocal_native::config::{ExperimentConfig, DEFAULT_CONFIG_FILE};
use photocal_native::device::{self, DeviceError, GoggleBridge, MockGoggles};
use photocal_native::input::StdinSource;
use photocal_native::orchestrator::{run_session, SessionArgs, SessionInfo};

/// Photocal goggle calibration runner
#[derive(Parser, Debug)]
#[command(name = "photocal")]
#[command(author, version, about = "Goggle light-discomfort calibration", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Configuration file (created with defaults when missing)
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a calibration session (default if no subcommand)
    Run {
        /// Device connection: serial or simulate
        #[arg(short, long, default_value = "serial")]
        device: String,

        /// Serial port override (defaults to the config file value)
        #[arg(long)]
        port: Option<String>,

        /// Participant identifier (prompted when omitted)
        #[arg(long)]
        participant: Option<String>,

        /// Session identifier (prompted when omitted)
        #[arg(long)]
        session: Option<String>,

        /// Starting intensity, 1-255 (prompted when omitted)
        #[arg(long)]
        start: Option<u8>,
    },

    /// List available serial ports
    Devices,

    /// Write the default configuration file
    InitConfig,
}

struct RunOpts {
    device: String,
    port: Option<String>,
    participant: Option<String>,
    session: Option<String>,
    start: Option<u8>,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            device: "serial".to_string(),
            port: None,
            participant: None,
            session: None,
            start: None,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(&cli.log_level);
    info!("photocal v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        None => run(&cli.config, RunOpts::default()),
        Some(Commands::Run {
            device,
            port,
            participant,
            session,
            start,
        }) => run(
            &cli.config,
            RunOpts {
                device,
                port,
                participant,
                session,
                start,
            },
        ),
        Some(Commands::Devices) => list_devices(),
        Some(Commands::InitConfig) => init_config(&cli.config),
    }
}

fn init_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: logging already initialized");
    }
}

/// Run one calibration session and map its outcome to the exit code.
fn run(config_path: &PathBuf, opts: RunOpts) -> ExitCode {
    let mut config = match ExperimentConfig::load_or_create(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("CONFIGURATION ERROR: {err}");
            eprintln!(
                "Check {} and correct the offending value before starting a session.",
                config_path.display()
            );
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = opts.port {
        config.hardware.serial_port = port;
    }

    // Collect identity before any hardware is touched so a typo never
    // leaves the goggles waiting in an open state.
    let args = SessionArgs {
        participant_id: opts.participant,
        session_id: opts.session,
        start_intensity: opts.start,
    };
    let info = match SessionInfo::collect(&args, config.hardware.max_brightness) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("SESSION SETUP ERROR: {err}");
            return ExitCode::FAILURE;
        }
    };

    let bridge = match open_bridge(&config, &opts.device) {
        Ok(bridge) => bridge,
        Err(err) => {
            eprintln!("GOGGLES ERROR: {err}");
            eprintln!(
                "Check the serial connection and the hardware section of {}.",
                config_path.display()
            );
            return ExitCode::FAILURE;
        }
    };

    // Last-resort shutdown for interrupts arriving outside the poll loop.
    if let Err(err) = device::install_interrupt_handler(bridge.shutdown_handle()) {
        warn!("could not install interrupt handler: {err}");
    }

    // Prompts are done; the reader thread owns stdin from here on.
    let responses = Box::new(StdinSource::spawn());

    let outcome = run_session(config, config_path.clone(), bridge, responses, info);
    ExitCode::from(u8::try_from(outcome.exit_code()).unwrap_or(1))
}

fn open_bridge(config: &ExperimentConfig, device: &str) -> Result<GoggleBridge, DeviceError> {
    match device {
        "simulate" => {
            info!("using simulated goggles (no hardware attached)");
            GoggleBridge::with_transport(
                Box::new(MockGoggles::new()),
                config.hardware.max_brightness,
            )
        }
        other => {
            if other != "serial" {
                warn!("unknown device mode {other:?}, using serial");
            }
            GoggleBridge::open(
                &config.hardware.serial_port,
                config.hardware.baud_rate,
                config.hardware.max_brightness,
            )
        }
    }
}

/// List available serial ports
fn list_devices() -> ExitCode {
    match serialport::available_ports() {
        Ok(ports) if ports.is_empty() => {
            println!("No serial ports found.");
            ExitCode::SUCCESS
        }
        Ok(ports) => {
            println!("Available serial ports:");
            for port in ports {
                println!("  {} - {:?}", port.port_name, port.port_type);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error scanning serial ports: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Write the default configuration file
fn init_config(path: &PathBuf) -> ExitCode {
    if path.exists() {
        eprintln!(
            "Refusing to overwrite existing config {}; move it aside first.",
            path.display()
        );
        return ExitCode::FAILURE;
    }
    match ExperimentConfig::default().write_to(path) {
        Ok(()) => {
            println!("Wrote default configuration to {}", path.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Failed to write configuration: {err}");
            ExitCode::FAILURE
        }
    }
}
