//! Error types for the staircase engine.

use thiserror::Error;

use crate::types::{INTENSITY_MAX, INTENSITY_MIN};

/// Errors raised by staircase construction and transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StaircaseError {
    /// Starting intensity outside the presentable test range.
    #[error("start intensity {value} outside test range [{INTENSITY_MIN}, {INTENSITY_MAX}]")]
    StartOutOfRange {
        /// The configured value.
        value: u8,
    },

    /// Step-size schedule has no entries.
    #[error("step size schedule is empty")]
    EmptySteps,

    /// A step-size entry of zero would stall the staircase.
    #[error("step size at schedule index {index} is zero")]
    ZeroStep {
        /// Index of the offending entry.
        index: usize,
    },

    /// Target reversal count of zero can never converge on anything.
    #[error("target reversal count must be at least 1")]
    ZeroTargetReversals,

    /// A trial ceiling of zero would terminate before the first trial.
    #[error("maximum trial count must be at least 1")]
    ZeroMaxTrials,

    /// A threshold window of zero would average nothing.
    #[error("threshold window must be at least 1")]
    ZeroThresholdWindow,

    /// A response was fed into a staircase that already terminated.
    ///
    /// This is a caller bug: the trial loop must stop once the engine
    /// reports termination.
    #[error("staircase already terminated after {trial_count} trials")]
    Terminated {
        /// Trials completed when termination was reached.
        trial_count: u32,
    },
}
