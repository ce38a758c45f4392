//! Adaptive 1-up-1-down staircase procedure.
//!
//! The staircase converges on the brightness level at which the subject
//! reports discomfort about 50% of the time. A comfortable response raises
//! the next intensity by the current step size, an uncomfortable response
//! lowers it. Each time the adjustment direction flips (a *reversal*) the
//! intensity at the flip is recorded and the step size advances to the next,
//! smaller entry of the configured schedule, saturating at the last entry.
//!
//! The engine is a pure state machine: it performs no I/O and owns no
//! clock, so a recorded session can be replayed exactly.

use serde::{Deserialize, Serialize};

use crate::error::StaircaseError;
use crate::types::{Direction, Response, INTENSITY_MIN};

// ============================================================================
// Configuration
// ============================================================================

/// Staircase parameters, validated at construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaircaseConfig {
    /// First intensity to present (1-255).
    pub start_intensity: u8,

    /// Step sizes used in order, advancing one entry per reversal and
    /// saturating at the last entry.
    pub step_sizes: Vec<u8>,

    /// Reversal count at which the staircase is considered converged.
    pub target_reversals: usize,

    /// Absolute trial ceiling, independent of convergence.
    pub max_trials: u32,

    /// Number of trailing reversals averaged for the threshold estimate.
    pub threshold_window: usize,
}

impl Default for StaircaseConfig {
    fn default() -> Self {
        Self {
            start_intensity: 128,
            step_sizes: vec![32, 16, 8, 4, 2, 1],
            target_reversals: 8,
            max_trials: 30,
            threshold_window: 6,
        }
    }
}

impl StaircaseConfig {
    /// Validate all parameters.
    ///
    /// # Errors
    ///
    /// Returns a [`StaircaseError`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), StaircaseError> {
        if self.start_intensity < INTENSITY_MIN {
            return Err(StaircaseError::StartOutOfRange {
                value: self.start_intensity,
            });
        }
        if self.step_sizes.is_empty() {
            return Err(StaircaseError::EmptySteps);
        }
        if let Some(index) = self.step_sizes.iter().position(|&s| s == 0) {
            return Err(StaircaseError::ZeroStep { index });
        }
        if self.target_reversals == 0 {
            return Err(StaircaseError::ZeroTargetReversals);
        }
        if self.max_trials == 0 {
            return Err(StaircaseError::ZeroMaxTrials);
        }
        if self.threshold_window == 0 {
            return Err(StaircaseError::ZeroThresholdWindow);
        }
        Ok(())
    }
}

// ============================================================================
// Transition Summary
// ============================================================================

/// What a single [`Staircase::record_response`] call did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrialOutcome {
    /// Intensity that was presented on this trial.
    pub presented: u8,
    /// Whether the adjustment direction flipped on this trial.
    pub reversal: bool,
    /// Intensity the staircase will present next (clamped to 1-255).
    pub next_intensity: u8,
    /// Whether the staircase terminated with this trial.
    pub terminated: bool,
}

/// Snapshot of the staircase totals, persisted at session end.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StaircaseSummary {
    /// Trials completed.
    pub trial_count: u32,
    /// Reversals recorded.
    pub reversal_count: usize,
    /// Intensity at each reversal, in order.
    pub reversal_intensities: Vec<u8>,
    /// Threshold estimate, absent while no reversal exists.
    pub threshold: Option<f64>,
    /// Configured starting intensity.
    pub start_intensity: u8,
    /// Whether the staircase reached termination.
    pub terminated: bool,
}

// ============================================================================
// Engine
// ============================================================================

/// Adaptive staircase state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Staircase {
    config: StaircaseConfig,
    current_intensity: u8,
    direction: Option<Direction>,
    step_index: usize,
    reversals: Vec<u8>,
    trial_count: u32,
    terminated: bool,
}

impl Staircase {
    /// Create a staircase from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StaircaseError`] if the configuration is invalid.
    pub fn new(config: StaircaseConfig) -> Result<Self, StaircaseError> {
        config.validate()?;
        Ok(Self {
            current_intensity: config.start_intensity,
            config,
            direction: None,
            step_index: 0,
            reversals: Vec::new(),
            trial_count: 0,
            terminated: false,
        })
    }

    /// Intensity to present on the next trial.
    #[must_use]
    pub fn current_intensity(&self) -> u8 {
        self.current_intensity
    }

    /// Trials completed so far.
    #[must_use]
    pub fn trial_count(&self) -> u32 {
        self.trial_count
    }

    /// Reversals recorded so far.
    #[must_use]
    pub fn reversal_count(&self) -> usize {
        self.reversals.len()
    }

    /// Intensities at which reversals occurred, in order.
    #[must_use]
    pub fn reversal_intensities(&self) -> &[u8] {
        &self.reversals
    }

    /// Whether the staircase has converged or hit the trial ceiling.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// The configuration this staircase was built with.
    #[must_use]
    pub fn config(&self) -> &StaircaseConfig {
        &self.config
    }

    /// Apply one trial's response and advance the staircase.
    ///
    /// The new direction follows from the response alone (comfortable = up,
    /// uncomfortable = down). A flip relative to the previous direction
    /// records the pre-change intensity as a reversal and advances the step
    /// schedule; the smaller step applies immediately to this change. The
    /// next intensity is clamped to the 1-255 test range. Trial 1 has no
    /// prior direction and can never record a reversal.
    ///
    /// # Errors
    ///
    /// [`StaircaseError::Terminated`] if the staircase already terminated.
    pub fn record_response(&mut self, response: Response) -> Result<TrialOutcome, StaircaseError> {
        if self.terminated {
            return Err(StaircaseError::Terminated {
                trial_count: self.trial_count,
            });
        }

        let presented = self.current_intensity;
        let new_direction = Direction::from_response(response);
        let reversal = self
            .direction
            .map_or(false, |previous| previous != new_direction);

        if reversal {
            self.reversals.push(presented);
            if self.step_index + 1 < self.config.step_sizes.len() {
                self.step_index += 1;
            }
        }

        let step = self.config.step_sizes[self.step_index];
        let next_intensity = match new_direction {
            Direction::Up => presented.saturating_add(step),
            Direction::Down => presented.saturating_sub(step).max(INTENSITY_MIN),
        };

        self.current_intensity = next_intensity;
        self.direction = Some(new_direction);
        self.trial_count += 1;

        if self.reversals.len() >= self.config.target_reversals
            || self.trial_count >= self.config.max_trials
        {
            self.terminated = true;
        }

        Ok(TrialOutcome {
            presented,
            reversal,
            next_intensity,
            terminated: self.terminated,
        })
    }

    /// Threshold estimate: mean of the last `threshold_window` reversal
    /// intensities, or of all of them when fewer have occurred.
    ///
    /// `None` until the first reversal exists.
    #[must_use]
    pub fn threshold(&self) -> Option<f64> {
        if self.reversals.is_empty() {
            return None;
        }
        let window = self.config.threshold_window;
        let tail = if self.reversals.len() > window {
            &self.reversals[self.reversals.len() - window..]
        } else {
            &self.reversals[..]
        };
        let sum: f64 = tail.iter().map(|&v| f64::from(v)).sum();
        #[allow(clippy::cast_precision_loss)]
        let count = tail.len() as f64;
        Some(sum / count)
    }

    /// Snapshot of the totals for persistence and display.
    #[must_use]
    pub fn summary(&self) -> StaircaseSummary {
        StaircaseSummary {
            trial_count: self.trial_count,
            reversal_count: self.reversals.len(),
            reversal_intensities: self.reversals.clone(),
            threshold: self.threshold(),
            start_intensity: self.config.start_intensity,
            terminated: self.terminated,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::INTENSITY_MAX;

    fn staircase(start: u8, steps: &[u8], target_reversals: usize, max_trials: u32) -> Staircase {
        Staircase::new(StaircaseConfig {
            start_intensity: start,
            step_sizes: steps.to_vec(),
            target_reversals,
            max_trials,
            threshold_window: 6,
        })
        .expect("valid config")
    }

    fn drive(stair: &mut Staircase, responses: &[Response]) -> Vec<u8> {
        let mut presented = Vec::new();
        for &response in responses {
            let outcome = stair.record_response(response).expect("advance");
            presented.push(outcome.presented);
        }
        presented
    }

    #[test]
    fn test_reference_trajectory() {
        use Response::{Comfortable as C, Uncomfortable as U};

        let mut stair = staircase(128, &[32, 16, 8, 4, 2, 1], 8, 30);
        let presented = drive(&mut stair, &[C, C, U, C, U]);

        assert_eq!(presented, vec![128, 160, 192, 176, 184]);
        assert_eq!(stair.current_intensity(), 180);
        assert_eq!(stair.reversal_intensities(), &[192, 176, 184]);
        assert_eq!(stair.trial_count(), 5);
        assert!(!stair.is_terminated());
    }

    #[test]
    fn test_no_reversal_on_first_trial() {
        let mut stair = staircase(128, &[32], 1, 30);
        let outcome = stair.record_response(Response::Uncomfortable).unwrap();
        assert!(!outcome.reversal);
        assert_eq!(stair.reversal_count(), 0);
    }

    #[test]
    fn test_reversal_iff_direction_flips() {
        use Response::{Comfortable as C, Uncomfortable as U};

        let mut stair = staircase(100, &[10], 100, 100);
        let expected_flips = [false, false, true, false, true, true];
        for (response, expected) in [C, C, U, U, C, U].into_iter().zip(expected_flips) {
            let outcome = stair.record_response(response).unwrap();
            assert_eq!(outcome.reversal, expected);
        }
        assert_eq!(stair.reversal_count(), 3);
    }

    #[test]
    fn test_intensity_never_leaves_test_range() {
        use Response::{Comfortable as C, Uncomfortable as U};

        // Hammer both boundaries with large steps.
        let mut stair = staircase(250, &[100], 100, 200);
        for response in [C, C, C, U, U, U, U, U, C, C, U, C, U, C] {
            let outcome = stair.record_response(response).unwrap();
            assert!(outcome.presented >= INTENSITY_MIN);
            assert!(outcome.next_intensity >= INTENSITY_MIN);
            assert!(outcome.next_intensity <= INTENSITY_MAX);
        }
    }

    #[test]
    fn test_clamp_at_ceiling() {
        let mut stair = staircase(250, &[32], 10, 30);
        let outcome = stair.record_response(Response::Comfortable).unwrap();
        assert_eq!(outcome.next_intensity, INTENSITY_MAX);
    }

    #[test]
    fn test_uncomfortable_at_floor_clamps_and_reverses() {
        use Response::{Comfortable as C, Uncomfortable as U};

        let mut stair = staircase(2, &[8, 8, 8], 10, 30);
        // Up, then down to the floor, then down again: still Down, no flip.
        drive(&mut stair, &[C, U, U]);
        assert_eq!(stair.reversal_count(), 1);
        assert_eq!(stair.current_intensity(), INTENSITY_MIN);

        // Comfortable at the floor flips Up; the following Uncomfortable
        // flips Down again even though the level is still pinned low.
        let up = stair.record_response(C).unwrap();
        assert!(up.reversal);
        let down = stair.record_response(U).unwrap();
        assert!(down.reversal);
    }

    #[test]
    fn test_step_index_saturates_at_schedule_end() {
        use Response::{Comfortable as C, Uncomfortable as U};

        let mut stair = staircase(128, &[16, 4], 100, 100);
        // Alternate responses: every trial after the second is a reversal.
        let responses: Vec<Response> = (0..10).map(|i| if i % 2 == 0 { C } else { U }).collect();
        drive(&mut stair, &responses);

        // Schedule exhausted after the second reversal; the step stays 4.
        let before = stair.current_intensity();
        let outcome = stair.record_response(C).unwrap();
        assert_eq!(outcome.next_intensity, before + 4);
    }

    #[test]
    fn test_terminates_on_target_reversals() {
        use Response::{Comfortable as C, Uncomfortable as U};

        let mut stair = staircase(128, &[8], 3, 100);
        for response in [C, U, C, U] {
            stair.record_response(response).unwrap();
        }
        assert!(stair.is_terminated());
        assert_eq!(stair.reversal_count(), 3);
        assert_eq!(stair.trial_count(), 4);
    }

    #[test]
    fn test_terminates_on_trial_ceiling_without_convergence() {
        let mut stair = staircase(128, &[8], 50, 4);
        for _ in 0..4 {
            stair.record_response(Response::Comfortable).unwrap();
        }
        assert!(stair.is_terminated());
        assert_eq!(stair.reversal_count(), 0);
    }

    #[test]
    fn test_rejects_response_after_termination() {
        let mut stair = staircase(128, &[8], 50, 1);
        stair.record_response(Response::Comfortable).unwrap();
        assert!(stair.is_terminated());

        let err = stair.record_response(Response::Comfortable).unwrap_err();
        assert_eq!(err, StaircaseError::Terminated { trial_count: 1 });
    }

    #[test]
    fn test_threshold_none_without_reversals() {
        let mut stair = staircase(128, &[8], 50, 30);
        assert_eq!(stair.threshold(), None);
        stair.record_response(Response::Comfortable).unwrap();
        assert_eq!(stair.threshold(), None);
    }

    #[test]
    fn test_threshold_mean_of_all_when_few_reversals() {
        use Response::{Comfortable as C, Uncomfortable as U};

        let mut stair = staircase(128, &[32, 16, 8, 4, 2, 1], 8, 30);
        drive(&mut stair, &[C, C, U, C, U]);
        // Reversals at 192, 176, 184.
        let threshold = stair.threshold().unwrap();
        assert!((threshold - 184.0).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_mean_of_last_window() {
        use Response::{Comfortable as C, Uncomfortable as U};

        let mut stair = staircase(128, &[2], 100, 100);
        // Alternating responses reverse on every trial after the first.
        let responses: Vec<Response> = (0..8).map(|i| if i % 2 == 0 { C } else { U }).collect();
        drive(&mut stair, &responses);
        assert_eq!(stair.reversal_count(), 7);

        let last_six = &stair.reversal_intensities()[1..7];
        let expected: f64 =
            last_six.iter().map(|&v| f64::from(v)).sum::<f64>() / last_six.len() as f64;
        assert!((stair.threshold().unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_config_rejects_zero_start() {
        let config = StaircaseConfig {
            start_intensity: 0,
            ..StaircaseConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(StaircaseError::StartOutOfRange { value: 0 })
        );
    }

    #[test]
    fn test_config_rejects_empty_and_zero_steps() {
        let empty = StaircaseConfig {
            step_sizes: vec![],
            ..StaircaseConfig::default()
        };
        assert_eq!(empty.validate(), Err(StaircaseError::EmptySteps));

        let zero = StaircaseConfig {
            step_sizes: vec![8, 0, 2],
            ..StaircaseConfig::default()
        };
        assert_eq!(zero.validate(), Err(StaircaseError::ZeroStep { index: 1 }));
    }

    #[test]
    fn test_config_rejects_zero_limits() {
        let reversals = StaircaseConfig {
            target_reversals: 0,
            ..StaircaseConfig::default()
        };
        assert_eq!(
            reversals.validate(),
            Err(StaircaseError::ZeroTargetReversals)
        );

        let trials = StaircaseConfig {
            max_trials: 0,
            ..StaircaseConfig::default()
        };
        assert_eq!(trials.validate(), Err(StaircaseError::ZeroMaxTrials));

        let window = StaircaseConfig {
            threshold_window: 0,
            ..StaircaseConfig::default()
        };
        assert_eq!(window.validate(), Err(StaircaseError::ZeroThresholdWindow));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(StaircaseConfig::default().validate().is_ok());
    }
}
