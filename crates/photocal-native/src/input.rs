//! Experimenter response input.
//!
//! The trial loop never blocks on the keyboard: a background thread reads
//! stdin line by line and forwards recognized keys over a channel, and the
//! loop drains the channel between sleep slices. During the response window
//! the most recent recognized key wins; the abort key is honored in every
//! phase.

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

/// A recognized experimenter keystroke.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseKey {
    /// `y` - subject reported discomfort.
    Uncomfortable,
    /// `n` - subject tolerated the stimulus.
    Comfortable,
    /// `q` - stop the session now.
    Abort,
}

impl ResponseKey {
    /// Parse one input line; unrecognized lines yield `None`.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "y" => Some(Self::Uncomfortable),
            "n" => Some(Self::Comfortable),
            "q" => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Non-blocking source of experimenter keys.
pub trait ResponseSource: Send {
    /// Return the next queued key, if any, without waiting.
    fn poll(&mut self) -> Option<ResponseKey>;
}

// ============================================================================
// Stdin Source
// ============================================================================

/// Keys typed at the terminal, one per line.
pub struct StdinSource {
    rx: Receiver<ResponseKey>,
}

impl StdinSource {
    /// Spawn the reader thread.
    ///
    /// Call this only after all blocking prompts (participant info) are
    /// done: the thread takes stdin for the rest of the process. The thread
    /// exits on stdin EOF or when the session drops the source.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("response-input".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                let mut lines = stdin.lock();
                let mut line = String::new();
                loop {
                    line.clear();
                    match lines.read_line(&mut line) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if let Some(key) = ResponseKey::parse(&line) {
                                debug!(?key, "response key received");
                                if tx.send(key).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            })
            .expect("spawn response input thread");
        Self { rx }
    }
}

impl ResponseSource for StdinSource {
    fn poll(&mut self) -> Option<ResponseKey> {
        self.rx.try_recv().ok()
    }
}

// ============================================================================
// Timed Script (tests, rehearsals)
// ============================================================================

/// Replays keys at fixed offsets from construction time.
///
/// Used by the test suite to land keys inside specific trial phases.
pub struct TimedScript {
    start: Instant,
    events: VecDeque<(Duration, ResponseKey)>,
}

impl TimedScript {
    /// Build a script; events must be in ascending time order.
    #[must_use]
    pub fn new(events: Vec<(Duration, ResponseKey)>) -> Self {
        Self {
            start: Instant::now(),
            events: events.into(),
        }
    }
}

impl ResponseSource for TimedScript {
    fn poll(&mut self) -> Option<ResponseKey> {
        let due = self
            .events
            .front()
            .is_some_and(|&(at, _)| self.start.elapsed() >= at);
        if due {
            self.events.pop_front().map(|(_, key)| key)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keys() {
        assert_eq!(ResponseKey::parse("y"), Some(ResponseKey::Uncomfortable));
        assert_eq!(ResponseKey::parse(" Y \n"), Some(ResponseKey::Uncomfortable));
        assert_eq!(ResponseKey::parse("n"), Some(ResponseKey::Comfortable));
        assert_eq!(ResponseKey::parse("q"), Some(ResponseKey::Abort));
        assert_eq!(ResponseKey::parse("yes"), None);
        assert_eq!(ResponseKey::parse(""), None);
    }

    #[test]
    fn test_timed_script_delivers_in_order() {
        let mut script = TimedScript::new(vec![
            (Duration::ZERO, ResponseKey::Uncomfortable),
            (Duration::ZERO, ResponseKey::Comfortable),
            (Duration::from_secs(3600), ResponseKey::Abort),
        ]);
        assert_eq!(script.poll(), Some(ResponseKey::Uncomfortable));
        assert_eq!(script.poll(), Some(ResponseKey::Comfortable));
        // The far-future event is not due yet.
        assert_eq!(script.poll(), None);
    }
}
