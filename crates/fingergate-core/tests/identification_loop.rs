mod support;

use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fingergate_core::identification::IdentificationTiming;
use fingergate_core::{AppError, EventSink, IdentificationEvent};
use tempfile::TempDir;

use support::{
    enroll_finger, fast_config, finger, harness, harness_with, harness_with_sinks, wait_until,
    Caller,
};

/// Holds the identification thread inside `notify` until released.
struct GateSink {
    gate: Mutex<Receiver<()>>,
}

impl EventSink for GateSink {
    fn notify(&self, _event: &IdentificationEvent) {
        let _ = self
            .gate
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(5));
    }
}

fn slow_debounce_harness(debounce: Duration) -> support::Harness {
    let mut config = fast_config();
    config.identification = IdentificationTiming {
        debounce,
        ..config.identification
    };
    harness_with(config, TempDir::new().unwrap())
}

#[test]
fn identified_event_carries_record_and_score() {
    let h = harness();
    let alice = enroll_finger(&h, "Alice", 0);
    assert!(h.service.start_identification().unwrap());

    h.script.push_identification(finger(0));
    match h.events.recv_timeout(Duration::from_secs(2)).unwrap() {
        IdentificationEvent::Identified { record, score, at } => {
            assert_eq!(record.id, alice.id);
            assert!(score > 0);
            assert!(!at.is_empty());
        }
        other => panic!("unexpected event: {other:?}"),
    }
    h.service.stop_identification();
}

#[test]
fn unknown_finger_emits_unidentified() {
    let h = harness();
    enroll_finger(&h, "Alice", 0);
    h.service.start_identification().unwrap();

    h.script.push_identification(finger(3));
    let event = h.events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(event, IdentificationEvent::Unidentified { .. }));
    h.service.stop_identification();
}

#[test]
fn repeated_capture_within_debounce_yields_one_event() {
    let h = slow_debounce_harness(Duration::from_secs(5));
    enroll_finger(&h, "Alice", 1);
    h.service.start_identification().unwrap();

    h.script.push_identification(finger(1));
    h.script.push_identification(finger(1));
    let first = h.events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(first.is_identified());
    assert!(h.events.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(h.script.pending_identification(), 1);

    let started = Instant::now();
    h.service.stop_identification();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!h.service.is_identification_running());
}

#[test]
fn enrollment_pauses_identification_and_resumes_it() {
    let h = harness();
    assert!(h.service.start_identification().unwrap());
    assert!(wait_until(Duration::from_secs(2), || h
        .script
        .count(Caller::Identification)
        >= 3));

    for _ in 0..3 {
        h.script.push_enrollment(finger(2));
    }
    let record = h.service.enroll("Bob", None, None).unwrap().record;
    assert!(h.service.is_identification_running());

    let calls = h.script.calls();
    let first = calls
        .iter()
        .position(|c| *c == Caller::Enrollment)
        .expect("enrollment captured");
    let last = calls
        .iter()
        .rposition(|c| *c == Caller::Enrollment)
        .expect("enrollment captured");
    assert!(calls[first..=last]
        .iter()
        .all(|caller| *caller == Caller::Enrollment));

    let before = h.script.count(Caller::Identification);
    assert!(wait_until(Duration::from_secs(2), || h
        .script
        .count(Caller::Identification)
        > before));

    h.script.push_identification(finger(2));
    let event = h.events.recv_timeout(Duration::from_secs(2)).unwrap();
    match event {
        IdentificationEvent::Identified { record: found, .. } => assert_eq!(found.id, record.id),
        other => panic!("unexpected event: {other:?}"),
    }
    h.service.stop_identification();
}

#[test]
fn failed_enrollment_still_resumes_identification() {
    let h = harness();
    h.service.start_identification().unwrap();
    let err = h
        .service
        .enroll("Carol", None, Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(matches!(err, AppError::Timeout { captured: 0, .. }));
    assert!(h.service.is_identification_running());
    assert!(!h.service.is_enrollment_in_progress());
    h.service.stop_identification();
}

#[test]
fn stop_while_idle_is_bounded() {
    let h = harness();
    assert!(h.service.start_identification().unwrap());
    assert!(!h.service.start_identification().unwrap());
    assert!(h.service.status().unwrap().identification_running);

    let started = Instant::now();
    h.service.stop_identification();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!h.service.is_identification_running());

    h.service.stop_identification();
    assert!(h.service.start_identification().unwrap());
    h.service.stop_identification();
}

#[test]
fn deleted_identity_is_no_longer_identified() {
    let h = harness();
    let alice = enroll_finger(&h, "Alice", 0);
    h.service.delete(&alice.id).unwrap();
    h.service.start_identification().unwrap();

    h.script.push_identification(finger(0));
    let event = h.events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(event, IdentificationEvent::Unidentified { .. }));
    h.service.stop_identification();
}

#[test]
fn lost_sensor_stops_the_loop() {
    let h = harness();
    h.script.set_lost(true);
    h.service.start_identification().unwrap();
    assert!(wait_until(Duration::from_secs(2), || !h
        .service
        .is_identification_running()));
    let calls = h.script.count(Caller::Identification);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.script.count(Caller::Identification), calls);

    h.script.set_lost(false);
    assert!(h.service.start_identification().unwrap());
    h.service.stop_identification();
}

#[test]
fn lost_sensor_is_reported_to_the_hook() {
    let h = harness();
    let (tx, rx) = mpsc::channel();
    h.service.on_sensor_lost(move |err| {
        let _ = tx.send(err);
    });
    h.script.set_lost(true);
    h.service.start_identification().unwrap();

    let err = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(err.is_device_lost());
    assert_eq!(err.exit_status(), 4);
    assert!(!h.service.is_identification_running());
}

#[test]
fn failed_poll_is_logged_and_loop_continues() {
    let h = harness();
    let alice = enroll_finger(&h, "Alice", 0);
    h.script.fail_acquires(2);
    h.script.push_identification(finger(0));
    h.service.start_identification().unwrap();

    match h.events.recv_timeout(Duration::from_secs(2)).unwrap() {
        IdentificationEvent::Identified { record, .. } => assert_eq!(record.id, alice.id),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(h.script.count(Caller::Identification) >= 3);
    assert!(h.service.is_identification_running());
    h.service.stop_identification();
}

#[test]
fn overrunning_worker_is_detached_and_enrollment_proceeds() {
    let (release, gate) = mpsc::channel();
    let gate_sink: Arc<dyn EventSink> = Arc::new(GateSink {
        gate: Mutex::new(gate),
    });
    let mut config = fast_config();
    config.identification.stop_grace = Duration::from_millis(100);
    let h = harness_with_sinks(config, TempDir::new().unwrap(), vec![gate_sink]);

    h.service.start_identification().unwrap();
    h.script.push_identification(finger(3));
    let event = h.events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(event, IdentificationEvent::Unidentified { .. }));

    let started = Instant::now();
    h.service.stop_identification();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(1));
    assert!(!h.service.is_identification_running());

    let bob = enroll_finger(&h, "Bob", 2);
    assert!(h.service.start_identification().unwrap());
    release.send(()).unwrap();

    h.script.push_identification(finger(2));
    match h.events.recv_timeout(Duration::from_secs(2)).unwrap() {
        IdentificationEvent::Identified { record, .. } => assert_eq!(record.id, bob.id),
        other => panic!("unexpected event: {other:?}"),
    }
    release.send(()).unwrap();
    assert!(h.events.recv_timeout(Duration::from_millis(200)).is_err());
    h.service.stop_identification();
}
