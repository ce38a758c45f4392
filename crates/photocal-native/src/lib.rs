//! Photocal Native - host tier of the goggle calibration platform
//!
//! This crate owns everything that touches the outside world during an
//! experiment:
//! - Serial bridge to the light goggles (with the goggles-off-on-every-exit
//!   safety contract)
//! - Session persistence: trial log, metadata, staircase snapshot
//! - Experiment configuration
//! - Keyboard response polling
//! - The trial orchestrator driving it all
//!
//! The adaptive staircase itself lives in `photocal-core` and stays free of
//! I/O.
//!
//! # Modules
//!
//! - [`device`]: goggle serial bridge and simulator
//! - [`session`]: on-disk session artifacts
//! - [`config`]: configuration file handling
//! - [`input`]: non-blocking experimenter input
//! - [`display`]: operator console surface
//! - [`orchestrator`]: the trial state machine

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod device;
pub mod display;
pub mod input;
pub mod orchestrator;
pub mod session;

// Re-export key types
pub use config::{ConfigError, ExperimentConfig, DEFAULT_CONFIG_FILE};
pub use device::{DeviceError, GoggleBridge, MockGoggles};
pub use orchestrator::{run_session, SessionArgs, SessionInfo, SessionOutcome, SessionRunner};
pub use session::{PersistenceError, SessionLog};
