//! Tests for run records: defaults, eligibility and serialization.

use chrono::{Duration, TimeZone, Utc};

use stepwise::engine::types::*;

fn sample_run() -> Run {
    let mut run = Run::new("deploy", "/srv/machines/deploy", vec![0, 159, 146, 150, b'\n']);
    run.id = 42;
    run.last_state = Some("start".to_string());
    run.next_state = "verify".to_string();
    run.status_message = "waiting for rollout".to_string();
    run.running = true;
    run.next_run_at = Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 5).unwrap());
    run.generation = 7;
    run
}

#[test]
fn new_run_starts_at_start() {
    let run = Run::new("deploy", "/srv/machines/deploy", b"payload".to_vec());
    assert_eq!(run.id, 0);
    assert_eq!(run.next_state, START_STATE);
    assert!(run.last_state.is_none());
    assert!(!run.running);
    assert!(run.next_run_at.is_none());
    assert!(run.finished.is_none());
    assert_eq!(run.input, b"payload");
    assert_eq!(run.phase(), RunPhase::Waiting);
}

#[test]
fn step_path_joins_next_state() {
    let mut run = Run::new("deploy", "/srv/machines/deploy", Vec::new());
    assert_eq!(
        run.step_path(),
        std::path::PathBuf::from("/srv/machines/deploy/start")
    );
    run.next_state = "verify".to_string();
    assert_eq!(
        run.step_path(),
        std::path::PathBuf::from("/srv/machines/deploy/verify")
    );
}

#[test]
fn eligibility_rules() {
    let now = Utc::now();
    let mut run = Run::new("m", "/tmp/m", Vec::new());
    assert!(run.is_eligible(now));

    run.next_run_at = Some(now);
    assert!(run.is_eligible(now), "due exactly now is eligible");

    run.next_run_at = Some(now + Duration::seconds(5));
    assert!(!run.is_eligible(now));
    assert!(run.is_eligible(now + Duration::seconds(5)));

    run.next_run_at = None;
    run.running = true;
    assert!(!run.is_eligible(now));
    assert_eq!(run.phase(), RunPhase::Running);

    run.running = false;
    run.next_state = STOP_STATE.to_string();
    assert!(!run.is_eligible(now));
    assert_eq!(run.phase(), RunPhase::Stopped);
}

#[test]
fn run_serialization_round_trip() {
    let mut run = sample_run();
    run.finished = Some(Utc::now());

    let json = serde_json::to_string(&run).unwrap();
    let back: Run = serde_json::from_str(&json).unwrap();
    assert_eq!(back, run);
}

#[test]
fn input_is_base64_in_json() {
    let mut run = sample_run();
    run.input = b"hello".to_vec();

    let value = serde_json::to_value(&run).unwrap();
    assert_eq!(value["input"], serde_json::json!("aGVsbG8="));
}

#[test]
fn optional_fields_are_omitted() {
    let run = Run::new("m", "/tmp/m", Vec::new());
    let value = serde_json::to_value(&run).unwrap();
    assert!(value.get("last_state").is_none());
    assert!(value.get("next_run_at").is_none());
    assert!(value.get("finished").is_none());
}

#[test]
fn phase_display_pads() {
    assert_eq!(format!("{:<9}|", RunPhase::Waiting), "waiting  |");
    assert_eq!(RunPhase::Stopped.to_string(), "stopped");
}
