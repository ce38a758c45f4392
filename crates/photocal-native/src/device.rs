//! Goggle serial bridge.
//!
//! The goggles accept one command form: the decimal ASCII brightness level
//! (0-255) followed by a single line feed. Nothing is read back; the link is
//! fire-and-forget. Level 0 turns the goggles off.
//!
//! Safety contract: the goggles MUST be dark on every exit path. The bridge
//! commands level 0 when it opens, when [`GoggleBridge::shutdown`] runs, and
//! when the bridge is dropped. A [`ShutdownHandle`] shares the transport
//! with the process-wide interrupt handler so an external termination signal
//! can force the goggles off even while a trial is mid-flight; every one of
//! these releases is idempotent, so running more than one is harmless.

use std::io::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use photocal_core::INTENSITY_OFF;

/// Serial port read/write timeout.
const PORT_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Error Types
// ============================================================================

/// Errors from the goggle bridge.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Serial port could not be opened.
    #[error("failed to open serial port {port}: {source}")]
    Unavailable {
        /// Port path that was requested.
        port: String,
        /// Underlying serial error.
        #[source]
        source: serialport::Error,
    },

    /// Requested level exceeds the configured device limit.
    #[error("brightness {level} exceeds device limit {max}")]
    OutOfRange {
        /// Requested level.
        level: u8,
        /// Configured maximum.
        max: u8,
    },

    /// Bridge already shut down.
    #[error("goggle bridge is not open")]
    NotOpen,

    /// Transport write failed; goggle state must be treated as unknown.
    #[error("serial write failed: {source}")]
    Write {
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

// ============================================================================
// Transport
// ============================================================================

/// Byte-level transport beneath the bridge.
///
/// The seam exists so tests and `--device simulate` runs can substitute an
/// in-memory goggle simulator for the serial port.
pub trait GoggleTransport: Send {
    /// Write the full buffer and flush it to the device.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Real serial transport.
struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl GoggleTransport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }
}

// ============================================================================
// Bridge
// ============================================================================

type SharedTransport = Arc<Mutex<Box<dyn GoggleTransport>>>;

/// Encode a brightness command.
fn encode(level: u8) -> String {
    format!("{level}\n")
}

/// Lock the transport, tolerating a poisoned mutex.
///
/// A panic on another thread must never stop the goggles from being turned
/// off, so the shutdown paths recover the inner value instead of failing.
fn lock_transport(transport: &SharedTransport) -> MutexGuard<'_, Box<dyn GoggleTransport>> {
    transport
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Owned connection to the goggles.
///
/// State machine: `Closed -> Open -> Closed`. Commands are only valid while
/// open; shutdown is idempotent and also runs on drop.
pub struct GoggleBridge {
    transport: SharedTransport,
    interrupted: Arc<AtomicBool>,
    max_level: u8,
    current_level: u8,
    open: bool,
}

impl GoggleBridge {
    /// Open the serial port and immediately command the goggles off.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Unavailable`] when the port cannot be opened, or a
    /// write error from the initial off command.
    pub fn open(port: &str, baud_rate: u32, max_level: u8) -> DeviceResult<Self> {
        let serial = serialport::new(port, baud_rate)
            .timeout(PORT_TIMEOUT)
            .open()
            .map_err(|source| DeviceError::Unavailable {
                port: port.to_string(),
                source,
            })?;

        info!(port, baud_rate, "opened goggle serial port");
        Self::with_transport(Box::new(SerialTransport { port: serial }), max_level)
    }

    /// Build a bridge over an arbitrary transport (simulator, tests).
    ///
    /// # Errors
    ///
    /// Propagates a write error from the initial off command.
    pub fn with_transport(transport: Box<dyn GoggleTransport>, max_level: u8) -> DeviceResult<Self> {
        let mut bridge = Self {
            transport: Arc::new(Mutex::new(transport)),
            interrupted: Arc::new(AtomicBool::new(false)),
            max_level,
            current_level: INTENSITY_OFF,
            open: true,
        };

        // Goggles start dark no matter what state the hardware was left in.
        bridge.set_level(INTENSITY_OFF)?;
        Ok(bridge)
    }

    /// Command a brightness level.
    ///
    /// On [`DeviceError::Write`] the goggle state is unknown: the caller
    /// must attempt an immediate `set_level(0)` before propagating.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotOpen`] after shutdown, [`DeviceError::OutOfRange`]
    /// above the configured limit, [`DeviceError::Write`] on transport
    /// failure.
    pub fn set_level(&mut self, level: u8) -> DeviceResult<()> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        if level > self.max_level {
            return Err(DeviceError::OutOfRange {
                level,
                max: self.max_level,
            });
        }

        lock_transport(&self.transport)
            .write_all(encode(level).as_bytes())
            .map_err(|source| DeviceError::Write { source })?;

        self.current_level = level;
        debug!(level, "goggle level set");
        Ok(())
    }

    /// Last successfully commanded level.
    #[must_use]
    pub fn current_level(&self) -> u8 {
        self.current_level
    }

    /// Whether the bridge is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Turn the goggles off and close the bridge. Idempotent.
    ///
    /// This is the last line of defense, so a write failure here is logged
    /// and swallowed; there is no further recovery action.
    pub fn shutdown(&mut self) {
        if !self.open {
            return;
        }

        match lock_transport(&self.transport).write_all(encode(INTENSITY_OFF).as_bytes()) {
            Ok(()) => {
                self.current_level = INTENSITY_OFF;
                info!("goggles commanded off");
            }
            Err(err) => error!("failed to command goggles off during shutdown: {err}"),
        }
        self.open = false;
    }

    /// Handle for the process-wide last-resort shutdown path.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            transport: Arc::clone(&self.transport),
            interrupted: Arc::clone(&self.interrupted),
        }
    }

    /// Flag raised by the interrupt handler; polled by the trial loop.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }
}

impl Drop for GoggleBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Last-Resort Shutdown
// ============================================================================

/// Shared shutdown path for abnormal termination.
///
/// May run concurrently with in-flight bridge I/O; the transport mutex
/// serializes the writes and the off command is idempotent.
#[derive(Clone)]
pub struct ShutdownHandle {
    transport: SharedTransport,
    interrupted: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Best-effort off command, swallowing write errors.
    pub fn force_off(&self) {
        match lock_transport(&self.transport).write_all(encode(INTENSITY_OFF).as_bytes()) {
            Ok(()) => info!("goggles forced off"),
            Err(err) => error!("failed to force goggles off: {err}"),
        }
    }

    /// Raise the interrupt flag the trial loop polls.
    pub fn mark_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

/// Register the process-wide interrupt handler.
///
/// On SIGINT/SIGTERM the handler forces the goggles off immediately and
/// raises the interrupt flag; the trial loop observes the flag within one
/// poll interval and runs the orderly abort path (which shuts down again —
/// harmless, both releases are idempotent).
///
/// # Errors
///
/// Propagates [`ctrlc::Error`] when a handler is already installed.
pub fn install_interrupt_handler(handle: ShutdownHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        warn!("termination signal received, forcing goggles off");
        handle.force_off();
        handle.mark_interrupted();
    })
}

// ============================================================================
// Mock Goggles
// ============================================================================

/// In-memory goggle simulator.
///
/// Parses the same line protocol the hardware speaks, records every command,
/// and can inject write failures. Backs `--device simulate` runs and the
/// test suite. Clones share state, so a copy kept outside the bridge can
/// inspect what the bridge sent.
#[derive(Clone, Default)]
pub struct MockGoggles {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    buffer: Vec<u8>,
    commands: Vec<u8>,
    malformed: u32,
    fail_next_writes: u32,
}

impl MockGoggles {
    /// New simulator with no history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a broken-pipe error.
    pub fn fail_next_writes(&self, n: u32) {
        self.lock().fail_next_writes = n;
    }

    /// Every brightness command received, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<u8> {
        self.lock().commands.clone()
    }

    /// The level the simulated goggles are currently at.
    #[must_use]
    pub fn current_level(&self) -> u8 {
        self.lock().commands.last().copied().unwrap_or(INTENSITY_OFF)
    }

    /// True when the last received command turned the goggles off.
    #[must_use]
    pub fn is_safe(&self) -> bool {
        self.current_level() == INTENSITY_OFF
    }

    /// Count of lines that failed protocol validation.
    #[must_use]
    pub fn malformed_count(&self) -> u32 {
        self.lock().malformed
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl GoggleTransport for MockGoggles {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        if state.fail_next_writes > 0 {
            state.fail_next_writes -= 1;
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected write failure",
            ));
        }

        state.buffer.extend_from_slice(bytes);
        while let Some(newline) = state.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = state.buffer.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            match text.trim().parse::<u8>() {
                Ok(level) => state.commands.push(level),
                Err(_) => {
                    state.malformed += 1;
                    warn!(line = %text, "mock goggles received malformed command");
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_bridge(max_level: u8) -> (GoggleBridge, MockGoggles) {
        let mock = MockGoggles::new();
        let bridge =
            GoggleBridge::with_transport(Box::new(mock.clone()), max_level).expect("open bridge");
        (bridge, mock)
    }

    #[test]
    fn test_open_commands_goggles_off() {
        let (_bridge, mock) = mock_bridge(255);
        assert_eq!(mock.commands(), vec![0]);
    }

    #[test]
    fn test_set_level_encodes_decimal_line() {
        let (mut bridge, mock) = mock_bridge(255);
        bridge.set_level(128).unwrap();
        bridge.set_level(255).unwrap();
        assert_eq!(mock.commands(), vec![0, 128, 255]);
        assert_eq!(bridge.current_level(), 255);
    }

    #[test]
    fn test_set_level_rejects_above_limit() {
        let (mut bridge, mock) = mock_bridge(100);
        let err = bridge.set_level(101).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::OutOfRange { level: 101, max: 100 }
        ));
        // Nothing was sent.
        assert_eq!(mock.commands(), vec![0]);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_closes() {
        let (mut bridge, mock) = mock_bridge(255);
        bridge.set_level(64).unwrap();
        bridge.shutdown();
        bridge.shutdown();
        assert!(!bridge.is_open());
        assert_eq!(mock.commands(), vec![0, 64, 0]);
        assert!(matches!(bridge.set_level(10), Err(DeviceError::NotOpen)));
    }

    #[test]
    fn test_drop_turns_goggles_off() {
        let mock = MockGoggles::new();
        {
            let mut bridge =
                GoggleBridge::with_transport(Box::new(mock.clone()), 255).expect("open bridge");
            bridge.set_level(200).unwrap();
        }
        assert!(mock.is_safe());
        assert_eq!(mock.commands(), vec![0, 200, 0]);
    }

    #[test]
    fn test_write_failure_surfaces_and_retry_recovers() {
        let (mut bridge, mock) = mock_bridge(255);
        mock.fail_next_writes(1);

        let err = bridge.set_level(128).unwrap_err();
        assert!(matches!(err, DeviceError::Write { .. }));

        // The caller's forced off retry goes through once the fault clears.
        bridge.set_level(0).unwrap();
        assert!(mock.is_safe());
    }

    #[test]
    fn test_shutdown_swallows_write_failure() {
        let (mut bridge, mock) = mock_bridge(255);
        bridge.set_level(40).unwrap();
        mock.fail_next_writes(1);
        bridge.shutdown();
        assert!(!bridge.is_open());
        // The off command was lost; the simulator still shows 40.
        assert_eq!(mock.current_level(), 40);
    }

    #[test]
    fn test_force_off_runs_alongside_bridge() {
        let (mut bridge, mock) = mock_bridge(255);
        bridge.set_level(90).unwrap();

        let handle = bridge.shutdown_handle();
        handle.force_off();
        handle.mark_interrupted();

        assert!(mock.is_safe());
        assert!(bridge.interrupt_flag().load(Ordering::SeqCst));

        // The scoped release still runs afterwards.
        bridge.shutdown();
        assert_eq!(mock.commands(), vec![0, 90, 0, 0]);
    }

    #[test]
    fn test_mock_rejects_malformed_lines() {
        let mut mock = MockGoggles::new();
        mock.write_all(b"300\n").unwrap();
        mock.write_all(b"abc\n").unwrap();
        mock.write_all(b"42\n").unwrap();
        assert_eq!(mock.malformed_count(), 2);
        assert_eq!(mock.commands(), vec![42]);
    }
}
