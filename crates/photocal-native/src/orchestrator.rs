//! Trial orchestration.
//!
//! A session is a single thread walking a fixed state machine:
//! `Initializing -> Running -> Completed | Aborted | Crashed`. Each trial
//! runs pre-stimulus, stimulus, inter-trial and finalize phases in order.
//! Timed phases are blocking sleeps sliced at the poll interval so the loop
//! can observe keystrokes and the interrupt flag without disturbing the
//! phase clock.
//!
//! Failure ordering is fixed: device safety first (goggles off), partial
//! data second (metadata, snapshot), operator messaging last. A trial's row
//! is durably written before its outcome reaches the staircase, so a crash
//! between trials never loses a completed trial.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};

use photocal_core::{
    Response, Staircase, StaircaseConfig, StaircaseError, StaircaseSummary, TrialRecord,
    INTENSITY_OFF,
};

use crate::config::ExperimentConfig;
use crate::device::{DeviceError, GoggleBridge};
use crate::display;
use crate::input::{ResponseKey, ResponseSource};
use crate::session::{self, PersistenceError, SessionLog};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that crash a running session.
#[derive(Debug, Error)]
pub enum ExperimentError {
    /// Goggle bridge failure that survived the forced-off retry.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Trial data could not be made durable.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Staircase contract violation (a bug in the trial loop).
    #[error(transparent)]
    Staircase(#[from] StaircaseError),

    /// A session field supplied on the command line failed validation.
    #[error("invalid {field}: {value:?}")]
    InvalidSessionField {
        /// Which field.
        field: &'static str,
        /// The rejected value.
        value: String,
    },

    /// Stdin closed while collecting session info.
    #[error("input closed while collecting session info")]
    InputClosed,

    /// Session info prompt failed.
    #[error("failed to read session info: {source}")]
    Prompt {
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Session Identity
// ============================================================================

/// How the session ends, and the process exit code it maps to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Staircase converged (or hit the trial ceiling) and results were
    /// written.
    Completed,
    /// Experimenter pressed the abort key or the process was interrupted.
    Aborted,
    /// An unrecoverable fault stopped the session.
    Crashed,
}

impl SessionOutcome {
    /// Process exit code for this outcome.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Crashed => 1,
            Self::Aborted => 2,
        }
    }
}

/// Identity and starting point of one session.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    /// Participant identifier (validated).
    pub participant_id: String,
    /// Session identifier (validated).
    pub session_id: String,
    /// First intensity to present (1 to the device limit).
    pub start_intensity: u8,
}

/// Optional pre-supplied session fields (from the command line).
#[derive(Clone, Debug, Default)]
pub struct SessionArgs {
    /// Participant identifier.
    pub participant_id: Option<String>,
    /// Session identifier.
    pub session_id: Option<String>,
    /// Starting intensity.
    pub start_intensity: Option<u8>,
}

impl SessionInfo {
    /// Resolve the session info, prompting interactively for anything not
    /// supplied. Pre-supplied values are validated but never re-prompted;
    /// an invalid one is an error.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::InvalidSessionField`] for a rejected command-line
    /// value, [`ExperimentError::InputClosed`]/[`ExperimentError::Prompt`]
    /// when interactive input is unavailable.
    pub fn collect(args: &SessionArgs, max_brightness: u8) -> Result<Self, ExperimentError> {
        Ok(Self {
            participant_id: resolve_id("participant ID", args.participant_id.as_deref())?,
            session_id: resolve_id("session ID", args.session_id.as_deref())?,
            start_intensity: resolve_start(args.start_intensity, max_brightness)?,
        })
    }
}

fn prompt_line(label: &str) -> Result<String, ExperimentError> {
    display::prompt(label)
        .map_err(|source| ExperimentError::Prompt { source })?
        .ok_or(ExperimentError::InputClosed)
}

fn resolve_id(field: &'static str, provided: Option<&str>) -> Result<String, ExperimentError> {
    if let Some(value) = provided {
        if session::validate_id(value) {
            return Ok(value.to_string());
        }
        return Err(ExperimentError::InvalidSessionField {
            field,
            value: value.to_string(),
        });
    }
    loop {
        let value = prompt_line(&format!("Enter {field}"))?;
        if session::validate_id(&value) {
            return Ok(value);
        }
        println!("Invalid {field}: use letters, digits, underscores and hyphens only.");
    }
}

fn resolve_start(provided: Option<u8>, max_brightness: u8) -> Result<u8, ExperimentError> {
    let in_range = |v: u8| v >= 1 && v <= max_brightness;
    if let Some(value) = provided {
        if in_range(value) {
            return Ok(value);
        }
        return Err(ExperimentError::InvalidSessionField {
            field: "starting intensity",
            value: value.to_string(),
        });
    }
    loop {
        let value = prompt_line(&format!("Enter starting intensity (1-{max_brightness})"))?;
        match value.parse::<u8>() {
            Ok(parsed) if in_range(parsed) => return Ok(parsed),
            _ => println!(
                "Invalid starting intensity: enter an integer between 1 and {max_brightness}."
            ),
        }
    }
}

// ============================================================================
// Session Runner
// ============================================================================

#[derive(Copy, Clone, PartialEq, Eq)]
enum PhaseExit {
    Elapsed,
    Abort,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum TrialControl {
    Continue,
    Abort,
}

/// Owns every session resource for the duration of one run.
pub struct SessionRunner {
    config: ExperimentConfig,
    info: SessionInfo,
    bridge: GoggleBridge,
    responses: Box<dyn ResponseSource>,
    interrupted: Arc<AtomicBool>,
    staircase: Staircase,
    log: SessionLog,
}

impl SessionRunner {
    /// Set up the staircase and session files.
    ///
    /// The bridge is consumed either way; on error it is dropped here and
    /// its drop handler turns the goggles off.
    ///
    /// # Errors
    ///
    /// [`ExperimentError`] when the staircase config or session files cannot
    /// be set up.
    pub fn new(
        config: ExperimentConfig,
        config_path: &Path,
        bridge: GoggleBridge,
        responses: Box<dyn ResponseSource>,
        info: SessionInfo,
    ) -> Result<Self, ExperimentError> {
        let staircase = Staircase::new(StaircaseConfig {
            start_intensity: info.start_intensity,
            ..config.staircase.clone()
        })?;

        let log = SessionLog::create(
            &config.paths.data_dir,
            &info.participant_id,
            &info.session_id,
            &session::file_stamp(),
            info.start_intensity,
            config_path,
        )?;

        let interrupted = bridge.interrupt_flag();
        Ok(Self {
            config,
            info,
            bridge,
            responses,
            interrupted,
            staircase,
            log,
        })
    }

    /// Run the session to one of its terminal states.
    #[must_use]
    pub fn run(mut self) -> SessionOutcome {
        display::session_banner(&self.info.participant_id, &self.info.session_id);
        display::instructions();
        info!(
            participant = %self.info.participant_id,
            session = %self.info.session_id,
            start_intensity = self.info.start_intensity,
            "session running"
        );

        match self.trial_loop() {
            Ok(TrialControl::Continue) => self.finish_completed(),
            Ok(TrialControl::Abort) => self.finish_aborted(),
            Err(err) => self.finish_crashed(&err),
        }
    }

    fn trial_loop(&mut self) -> Result<TrialControl, ExperimentError> {
        let mut trial_number = 0;
        while !self.staircase.is_terminated() {
            trial_number += 1;
            if self.run_trial(trial_number)? == TrialControl::Abort {
                return Ok(TrialControl::Abort);
            }
        }
        Ok(TrialControl::Continue)
    }

    fn run_trial(&mut self, trial_number: u32) -> Result<TrialControl, ExperimentError> {
        let intensity = self.staircase.current_intensity();
        display::trial_header(
            trial_number,
            self.config.staircase.max_trials,
            intensity,
            self.staircase.reversal_count(),
        );

        let mut pending: Option<Response> = None;

        // Pre-stimulus: countdown only. y/n are ignored, q still aborts.
        display::pre_stimulus(self.config.timing.pre_stimulus_secs);
        if self.wait_phase(self.config.timing.pre_stimulus(), false, &mut pending)
            == PhaseExit::Abort
        {
            return Ok(TrialControl::Abort);
        }

        // Stimulus: goggles on, response window opens.
        self.command_level(intensity)?;
        display::stimulus_on(intensity, self.config.timing.stimulus_secs);
        let stimulus_exit = self.wait_phase(self.config.timing.stimulus(), true, &mut pending);

        // Goggles dark at the end of the stimulus phase - not at the end of
        // the trial, and even when the phase ended in an abort.
        self.command_level(INTENSITY_OFF)?;
        if stimulus_exit == PhaseExit::Abort {
            return Ok(TrialControl::Abort);
        }

        // Inter-trial interval: the response window stays open.
        display::response_window(self.config.timing.inter_trial_secs);
        if self.wait_phase(self.config.timing.inter_trial(), true, &mut pending)
            == PhaseExit::Abort
        {
            return Ok(TrialControl::Abort);
        }

        // Finalize: freeze the response, persist the row, then advance the
        // staircase.
        let response = pending.unwrap_or(Response::Comfortable);
        let record = TrialRecord {
            trial_number,
            intensity,
            uncomfortable: response.is_uncomfortable(),
            reversals_so_far: u32::try_from(self.staircase.reversal_count()).unwrap_or(u32::MAX),
            timestamp: session::record_stamp(),
        };
        self.log.append_trial(&record)?;

        let outcome = self.staircase.record_response(response)?;
        display::trial_result(response.label(), outcome.reversal);
        info!(
            trial = trial_number,
            intensity,
            response = response.label(),
            reversal = outcome.reversal,
            next_intensity = outcome.next_intensity,
            "trial finalized"
        );
        Ok(TrialControl::Continue)
    }

    /// Sleep for `duration` in poll-interval slices, draining queued keys on
    /// every slice. Input handling never stretches or shortens the phase.
    fn wait_phase(
        &mut self,
        duration: Duration,
        monitoring: bool,
        pending: &mut Option<Response>,
    ) -> PhaseExit {
        let poll = self.config.timing.poll_interval();
        let deadline = Instant::now() + duration;
        loop {
            // Drain everything queued; the latest recognized key wins.
            while let Some(key) = self.responses.poll() {
                match key {
                    ResponseKey::Abort => {
                        info!("abort key received");
                        return PhaseExit::Abort;
                    }
                    ResponseKey::Uncomfortable | ResponseKey::Comfortable if monitoring => {
                        let response = if key == ResponseKey::Uncomfortable {
                            Response::Uncomfortable
                        } else {
                            Response::Comfortable
                        };
                        if *pending != Some(response) {
                            display::response_noted(response.label());
                        }
                        *pending = Some(response);
                    }
                    // Response keys outside the window are dropped.
                    _ => {}
                }
            }

            if self.interrupted.load(Ordering::SeqCst) {
                warn!("interrupt received, aborting session");
                return PhaseExit::Abort;
            }

            let now = Instant::now();
            if now >= deadline {
                return PhaseExit::Elapsed;
            }
            thread::sleep((deadline - now).min(poll));
        }
    }

    /// Command a level, applying the write-failure policy: on a write error
    /// the goggle state is unknown, so force an immediate off command, then
    /// propagate the original failure.
    fn command_level(&mut self, level: u8) -> Result<(), DeviceError> {
        match self.bridge.set_level(level) {
            Ok(()) => Ok(()),
            Err(err @ DeviceError::Write { .. }) => {
                warn!(level, "serial write failed, forcing goggles off");
                if let Err(retry) = self.bridge.set_level(INTENSITY_OFF) {
                    error!("forced off also failed, goggle state unknown: {retry}");
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn finish_completed(mut self) -> SessionOutcome {
        self.bridge.shutdown();
        let summary = self.staircase.summary();
        self.persist_final(|log, summary| log.finalize_completed(summary), &summary);
        display::completion(&summary);
        info!(
            trials = summary.trial_count,
            reversals = summary.reversal_count,
            threshold = summary.threshold,
            "session completed"
        );
        SessionOutcome::Completed
    }

    fn finish_aborted(mut self) -> SessionOutcome {
        self.bridge.shutdown();
        let summary = self.staircase.summary();
        self.persist_final(|log, summary| log.finalize_partial(summary, true), &summary);
        display::aborted(&summary);
        warn!(
            trials = summary.trial_count,
            reversals = summary.reversal_count,
            "session aborted by experimenter"
        );
        SessionOutcome::Aborted
    }

    fn finish_crashed(mut self, err: &ExperimentError) -> SessionOutcome {
        self.bridge.shutdown();
        let summary = self.staircase.summary();
        self.persist_final(|log, summary| log.finalize_partial(summary, false), &summary);
        display::fatal(err, &summary);
        error!(
            trials = summary.trial_count,
            reversals = summary.reversal_count,
            "session crashed: {err}"
        );
        SessionOutcome::Crashed
    }

    /// Persistence on the way out is best-effort: failures are logged but
    /// never stop the remaining teardown.
    fn persist_final<F>(&mut self, finalize: F, summary: &StaircaseSummary)
    where
        F: FnOnce(&mut SessionLog, &StaircaseSummary) -> Result<(), PersistenceError>,
    {
        if let Err(err) = finalize(&mut self.log, summary) {
            error!("failed to finalize session metadata: {err}");
        }
        if let Err(err) = self.log.write_snapshot(&self.staircase) {
            error!("failed to write staircase snapshot: {err}");
        }
    }
}

/// Run one session end to end, translating setup failures into
/// [`SessionOutcome::Crashed`].
pub fn run_session(
    config: ExperimentConfig,
    config_path: PathBuf,
    bridge: GoggleBridge,
    responses: Box<dyn ResponseSource>,
    info: SessionInfo,
) -> SessionOutcome {
    let start_intensity = info.start_intensity;
    match SessionRunner::new(config, &config_path, bridge, responses, info) {
        Ok(runner) => runner.run(),
        Err(err) => {
            // The bridge was consumed and dropped: goggles are already off.
            let summary = StaircaseSummary {
                trial_count: 0,
                reversal_count: 0,
                reversal_intensities: Vec::new(),
                threshold: None,
                start_intensity,
                terminated: false,
            };
            display::fatal(&err, &summary);
            error!("session setup failed: {err}");
            SessionOutcome::Crashed
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(SessionOutcome::Completed.exit_code(), 0);
        assert_eq!(SessionOutcome::Crashed.exit_code(), 1);
        assert_eq!(SessionOutcome::Aborted.exit_code(), 2);
    }

    #[test]
    fn test_collect_accepts_valid_cli_values() {
        let args = SessionArgs {
            participant_id: Some("p01".into()),
            session_id: Some("s-1".into()),
            start_intensity: Some(128),
        };
        let info = SessionInfo::collect(&args, 255).unwrap();
        assert_eq!(info.participant_id, "p01");
        assert_eq!(info.session_id, "s-1");
        assert_eq!(info.start_intensity, 128);
    }

    #[test]
    fn test_collect_rejects_bad_cli_values() {
        let args = SessionArgs {
            participant_id: Some("p 01".into()),
            session_id: Some("s1".into()),
            start_intensity: Some(100),
        };
        assert!(matches!(
            SessionInfo::collect(&args, 255),
            Err(ExperimentError::InvalidSessionField {
                field: "participant ID",
                ..
            })
        ));

        let args = SessionArgs {
            participant_id: Some("p01".into()),
            session_id: Some("s1".into()),
            start_intensity: Some(200),
        };
        assert!(matches!(
            SessionInfo::collect(&args, 150),
            Err(ExperimentError::InvalidSessionField {
                field: "starting intensity",
                ..
            })
        ));
    }
}
