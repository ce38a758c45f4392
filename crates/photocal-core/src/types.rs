//! Core types for the Photocal platform
//!
//! The goggle hardware accepts an 8-bit brightness level. Level 0 is the
//! off/safe state and is reserved for shutdown; stimuli are always presented
//! in the 1-255 test range.

use serde::{Deserialize, Serialize};

/// Brightness level that turns the goggles off. Never used as a stimulus.
pub const INTENSITY_OFF: u8 = 0;

/// Lowest presentable stimulus intensity.
pub const INTENSITY_MIN: u8 = 1;

/// Highest presentable stimulus intensity.
pub const INTENSITY_MAX: u8 = 255;

// ============================================================================
// Responses
// ============================================================================

/// The subject's judgement of a single stimulus, as relayed by the
/// experimenter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Response {
    /// Subject reported discomfort.
    Uncomfortable,
    /// Subject tolerated the stimulus (including "no report").
    Comfortable,
}

impl Response {
    /// True for [`Response::Uncomfortable`].
    #[must_use]
    pub const fn is_uncomfortable(self) -> bool {
        matches!(self, Self::Uncomfortable)
    }

    /// Encoding used in the trial log: 1 = uncomfortable, 0 = comfortable.
    #[must_use]
    pub const fn as_flag(self) -> u8 {
        match self {
            Self::Uncomfortable => 1,
            Self::Comfortable => 0,
        }
    }

    /// Lower-case label for display and logging.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Uncomfortable => "uncomfortable",
            Self::Comfortable => "comfortable",
        }
    }
}

// ============================================================================
// Adjustment Direction
// ============================================================================

/// Direction the staircase moves after a response.
///
/// Derived from the response alone, not from the realized intensity change,
/// so clamping at the range boundary never masks a direction flip.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Intensity increases (subject was comfortable).
    Up,
    /// Intensity decreases (subject was uncomfortable).
    Down,
}

impl Direction {
    /// The 1-up-1-down rule: comfortable goes up, uncomfortable goes down.
    #[must_use]
    pub const fn from_response(response: Response) -> Self {
        match response {
            Response::Comfortable => Self::Up,
            Response::Uncomfortable => Self::Down,
        }
    }
}

// ============================================================================
// Trial Records
// ============================================================================

/// One completed trial, frozen at the moment its response window closed.
///
/// Records are append-only: once written to the session log they are never
/// mutated or deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// 1-based sequential trial number.
    pub trial_number: u32,
    /// Brightness level that was presented (1-255).
    pub intensity: u8,
    /// Whether the subject reported discomfort.
    pub uncomfortable: bool,
    /// Reversal count before this trial's outcome was applied.
    pub reversals_so_far: u32,
    /// Wall-clock timestamp of finalization.
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_flag_encoding() {
        assert_eq!(Response::Uncomfortable.as_flag(), 1);
        assert_eq!(Response::Comfortable.as_flag(), 0);
    }

    #[test]
    fn test_direction_from_response() {
        assert_eq!(
            Direction::from_response(Response::Comfortable),
            Direction::Up
        );
        assert_eq!(
            Direction::from_response(Response::Uncomfortable),
            Direction::Down
        );
    }
}
