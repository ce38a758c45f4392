//! End-to-end session runs against the goggle simulator.
//!
//! Phase durations are shrunk to tens of milliseconds and scripted key
//! events are placed well inside their target windows, so the assertions
//! hold with plenty of margin on a loaded CI machine.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use photocal_native::config::ExperimentConfig;
use photocal_native::device::{GoggleBridge, MockGoggles};
use photocal_native::input::{ResponseKey, TimedScript};
use photocal_native::orchestrator::{run_session, SessionInfo, SessionOutcome};
use photocal_native::session::{read_metadata, SessionLog, TRIAL_LOG_HEADER};

fn test_config(data_dir: PathBuf) -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.staircase.step_sizes = vec![16, 8];
    config.staircase.target_reversals = 8;
    config.staircase.max_trials = 3;
    config.timing.pre_stimulus_secs = 0.0;
    config.timing.stimulus_secs = 0.08;
    config.timing.inter_trial_secs = 0.08;
    config.timing.poll_interval_ms = 5;
    config.paths.data_dir = data_dir;
    config
}

fn info(start: u8) -> SessionInfo {
    SessionInfo {
        participant_id: "p01".to_string(),
        session_id: "s1".to_string(),
        start_intensity: start,
    }
}

fn mock_bridge() -> (GoggleBridge, MockGoggles) {
    let mock = MockGoggles::new();
    let bridge =
        GoggleBridge::with_transport(Box::new(mock.clone()), 255).expect("open mock bridge");
    (bridge, mock)
}

fn find_artifact(data_dir: &Path, suffix: &str) -> PathBuf {
    fs::read_dir(data_dir)
        .expect("data dir exists")
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .find(|path| path.to_string_lossy().ends_with(suffix))
        .unwrap_or_else(|| panic!("no {suffix} artifact in {}", data_dir.display()))
}

#[test]
fn session_completes_at_trial_ceiling_with_default_comfortable() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let config = test_config(data_dir.clone());
    let (bridge, mock) = mock_bridge();

    let outcome = run_session(
        config,
        dir.path().join("photocal.json"),
        bridge,
        Box::new(TimedScript::new(Vec::new())),
        info(100),
    );
    assert_eq!(outcome, SessionOutcome::Completed);

    // No key was ever pressed: every trial defaults to comfortable and the
    // staircase climbs by the first step size until the ceiling cuts it off.
    // Open 0, then level/0 per trial, then the shutdown 0.
    assert_eq!(mock.commands(), vec![0, 100, 0, 116, 0, 132, 0, 0]);
    assert!(mock.is_safe());

    let trials = fs::read_to_string(find_artifact(&data_dir, ".csv")).unwrap();
    let lines: Vec<&str> = trials.lines().collect();
    assert_eq!(lines[0], TRIAL_LOG_HEADER);
    assert_eq!(lines.len(), 4);
    assert!(lines[1].starts_with("100,0,1,0,"));
    assert!(lines[2].starts_with("116,0,2,0,"));
    assert!(lines[3].starts_with("132,0,3,0,"));

    let metadata = read_metadata(&find_artifact(&data_dir, ".meta")).unwrap();
    assert_eq!(metadata["experiment_completed"], "true");
    assert_eq!(metadata["experiment_aborted"], "false");
    assert_eq!(metadata["total_trials"], "3");
    assert_eq!(metadata["total_reversals"], "0");
    assert_eq!(metadata["starting_intensity"], "100");
    // No reversal ever happened: no threshold is fabricated.
    assert!(!metadata.contains_key("final_threshold"));

    // The snapshot parses back with the full trial history.
    let snapshot = fs::read_to_string(find_artifact(&data_dir, ".staircase.json")).unwrap();
    let staircase: photocal_core::Staircase = serde_json::from_str(&snapshot).unwrap();
    assert_eq!(staircase.trial_count(), 3);
    assert!(staircase.is_terminated());
}

#[test]
fn last_key_wins_within_response_window() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let mut config = test_config(data_dir.clone());
    config.staircase.max_trials = 1;
    config.timing.stimulus_secs = 0.15;
    config.timing.inter_trial_secs = 0.15;
    let (bridge, mock) = mock_bridge();

    // All four keys land inside the stimulus+ITI response window; the final
    // `n` must win.
    let script = TimedScript::new(vec![
        (Duration::from_millis(30), ResponseKey::Uncomfortable),
        (Duration::from_millis(60), ResponseKey::Comfortable),
        (Duration::from_millis(90), ResponseKey::Uncomfortable),
        (Duration::from_millis(120), ResponseKey::Comfortable),
    ]);

    let outcome = run_session(
        config,
        dir.path().join("photocal.json"),
        bridge,
        Box::new(script),
        info(100),
    );
    assert_eq!(outcome, SessionOutcome::Completed);
    assert!(mock.is_safe());

    let trials = fs::read_to_string(find_artifact(&data_dir, ".csv")).unwrap();
    let row = trials.lines().nth(1).expect("one trial row");
    assert!(row.starts_with("100,0,1,0,"), "unexpected row: {row}");
}

#[test]
fn abort_key_stops_session_and_marks_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let mut config = test_config(data_dir.clone());
    config.timing.stimulus_secs = 0.3;
    let (bridge, mock) = mock_bridge();

    // Abort mid-stimulus of the first trial, with a wide margin on both
    // sides of the 300 ms stimulus window.
    let script = TimedScript::new(vec![(Duration::from_millis(100), ResponseKey::Abort)]);

    let outcome = run_session(
        config,
        dir.path().join("photocal.json"),
        bridge,
        Box::new(script),
        info(100),
    );
    assert_eq!(outcome, SessionOutcome::Aborted);

    // Stimulus came on, then off at the abort, then the shutdown off.
    assert_eq!(mock.commands(), vec![0, 100, 0, 0]);
    assert!(mock.is_safe());

    // The aborted trial was never finalized: only the header exists.
    let trials = fs::read_to_string(find_artifact(&data_dir, ".csv")).unwrap();
    assert_eq!(trials.lines().count(), 1);

    let metadata = read_metadata(&find_artifact(&data_dir, ".meta")).unwrap();
    assert_eq!(metadata["experiment_completed"], "false");
    assert_eq!(metadata["experiment_aborted"], "true");
    assert_eq!(metadata["total_trials"], "0");
}

#[test]
fn persistent_write_failure_crashes_but_forces_goggles_off() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let config = test_config(data_dir.clone());
    let (bridge, mock) = mock_bridge();

    // The first stimulus write fails; the forced off retry succeeds.
    mock.fail_next_writes(1);

    let outcome = run_session(
        config,
        dir.path().join("photocal.json"),
        bridge,
        Box::new(TimedScript::new(Vec::new())),
        info(100),
    );
    assert_eq!(outcome, SessionOutcome::Crashed);

    // Open 0, failed stimulus write (absent), forced 0, shutdown 0.
    assert_eq!(mock.commands(), vec![0, 0, 0]);
    assert!(mock.is_safe());

    let metadata = read_metadata(&find_artifact(&data_dir, ".meta")).unwrap();
    assert_eq!(metadata["experiment_completed"], "false");
    assert_eq!(metadata["experiment_aborted"], "false");
    assert_eq!(metadata["total_trials"], "0");
}

#[test]
fn crash_mid_trial_leaves_consistent_artifacts() {
    // Simulate a process dying after a stimulus but before finalize: the
    // session log is simply dropped without any finalize call, and the
    // bridge is dropped mid-level.
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    fs::create_dir_all(&data_dir).unwrap();
    let mock = MockGoggles::new();

    {
        let mut bridge =
            GoggleBridge::with_transport(Box::new(mock.clone()), 255).expect("open mock bridge");
        let mut log = SessionLog::create(
            &data_dir,
            "p01",
            "s1",
            "20260805_093000",
            100,
            Path::new("photocal.json"),
        )
        .unwrap();

        // One completed trial, then a second stimulus with no finalize.
        log.append_trial(&photocal_core::TrialRecord {
            trial_number: 1,
            intensity: 100,
            uncomfortable: false,
            reversals_so_far: 0,
            timestamp: "2026-08-05 09:30:10.000".to_string(),
        })
        .unwrap();
        bridge.set_level(116).unwrap();
        // Process "dies" here: everything drops.
    }

    // The goggles still went dark (scoped release ran on drop).
    assert!(mock.is_safe());

    // The trial log holds exactly the completed trial.
    let trials = fs::read_to_string(find_artifact(&data_dir, ".csv")).unwrap();
    assert_eq!(trials.lines().count(), 2);

    // Metadata still reads as an unfinished session.
    let metadata = read_metadata(&find_artifact(&data_dir, ".meta")).unwrap();
    assert_eq!(metadata["experiment_completed"], "false");
    assert_eq!(metadata["experiment_aborted"], "false");
    assert!(!metadata.contains_key("total_trials"));
}
