//! Console surface for the experimenter.
//!
//! The subject wears the goggles and never sees this terminal; everything
//! here is operator guidance. Kept to plain stdout so it works on the bare
//! TTYs common on lab machines.

use std::io::{self, Write};

use photocal_core::StaircaseSummary;

/// Width of the banner rules.
const RULE_WIDTH: usize = 60;

fn rule() -> String {
    "=".repeat(RULE_WIDTH)
}

/// Session banner shown once the experiment starts.
pub fn session_banner(participant_id: &str, session_id: &str) {
    println!();
    println!("{}", rule());
    println!("  GOGGLE CALIBRATION - photocal v{}", env!("CARGO_PKG_VERSION"));
    println!("{}", rule());
    println!("  Participant: {participant_id}");
    println!("  Session:     {session_id}");
    println!();
}

/// Operator instructions, shown before the first trial.
pub fn instructions() {
    println!("During each trial, ask the subject: \"Uncomfortable?\"");
    println!("  y <Enter>  subject reports discomfort");
    println!("  n <Enter>  subject is comfortable (also the default)");
    println!("  q <Enter>  abort the session (any time)");
    println!();
}

/// Header printed at the top of every trial.
pub fn trial_header(trial_number: u32, max_trials: u32, intensity: u8, reversals: usize) {
    println!("{}", "-".repeat(RULE_WIDTH));
    println!(
        "Trial {trial_number}/{max_trials}  |  brightness {intensity}  |  reversals {reversals}"
    );
}

/// Pre-stimulus countdown notice.
pub fn pre_stimulus(secs: f64) {
    println!("Stimulus in {secs:.1} s ...");
}

/// Stimulus phase notice.
pub fn stimulus_on(intensity: u8, secs: f64) {
    println!("STIMULUS ON  (brightness {intensity}, {secs:.1} s)");
}

/// Response window notice; runs through the inter-trial interval.
pub fn response_window(secs: f64) {
    println!("Stimulus off. Response window open for {secs:.1} s  [y/n, q aborts]");
}

/// Echo the response state each time a recognized key changes it.
pub fn response_noted(label: &str) {
    println!("  response: {label}");
}

/// Result line at the end of a trial.
pub fn trial_result(label: &str, reversal: bool) {
    if reversal {
        println!("Recorded: {label}  (reversal)");
    } else {
        println!("Recorded: {label}");
    }
    println!();
}

/// Completion summary.
pub fn completion(summary: &StaircaseSummary) {
    println!();
    println!("{}", rule());
    println!("  EXPERIMENT COMPLETE");
    println!("{}", rule());
    println!("  Trials:    {}", summary.trial_count);
    println!("  Reversals: {}", summary.reversal_count);
    match summary.threshold {
        Some(threshold) => println!("  Estimated discomfort threshold: {threshold:.1}"),
        None => println!("  Estimated discomfort threshold: undefined (no reversals)"),
    }
    println!();
}

/// Abort summary - stopped by the experimenter, not an error.
pub fn aborted(summary: &StaircaseSummary) {
    println!();
    println!("{}", rule());
    println!("  EXPERIMENT ABORTED by experimenter");
    println!(
        "  Captured {} trials, {} reversals. Goggles are off; data saved.",
        summary.trial_count, summary.reversal_count
    );
    println!("{}", rule());
}

/// Fatal error summary - stopped because something broke.
pub fn fatal(error: &dyn std::error::Error, summary: &StaircaseSummary) {
    eprintln!();
    eprintln!("{}", rule());
    eprintln!("  EXPERIMENT STOPPED DUE TO ERROR");
    eprintln!("  {error}");
    let mut source = error.source();
    while let Some(cause) = source {
        eprintln!("    caused by: {cause}");
        source = cause.source();
    }
    eprintln!(
        "  Captured {} trials, {} reversals before the failure.",
        summary.trial_count, summary.reversal_count
    );
    eprintln!("{}", rule());
}

/// Print a prompt and read one trimmed line from stdin.
///
/// Returns `None` on EOF (non-interactive stdin ran dry).
///
/// # Errors
///
/// Propagates stdin read failures.
pub fn prompt(label: &str) -> io::Result<Option<String>> {
    print!("{label}: ");
    io::stdout().flush()?;

    let mut line = String::new();
    let bytes = io::stdin().read_line(&mut line)?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}
