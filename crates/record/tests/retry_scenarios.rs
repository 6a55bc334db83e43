//! End-to-end lifecycle scenarios for durable retry records.

use chrono::{DateTime, Duration, Utc};
use record::{
    BackoffPolicy, DurableRecord, Payload, RecordError, RecordFamily, RecordState, RetryPolicy,
};

fn record(family: RecordFamily, now: DateTime<Utc>, policy: &RetryPolicy) -> DurableRecord {
    DurableRecord::new(
        family,
        "charge_card",
        "billing",
        Payload::raw("charge", serde_json::json!({"amount": 1200})),
        now,
        policy,
    )
}

// ============================================================================
// Task scenarios
// ============================================================================

#[test]
fn test_task_succeeds_on_third_attempt() {
    let start = Utc::now();
    let policy = RetryPolicy::new(3, Duration::hours(1)).with_backoff(BackoffPolicy::from_secs(&[60]));
    let mut task = record(RecordFamily::Task, start, &policy);

    let mut now = start;
    for attempt in 1..=2 {
        assert!(task.begin_attempt(now, &policy.backoff).unwrap());
        assert_eq!(task.fail(format!("attempt {attempt} failed")), RecordState::Confirming);
        assert_eq!(task.lifecycle.tried_times, attempt);
        now = task.lifecycle.next_try_time;
    }

    assert!(task.begin_attempt(now, &policy.backoff).unwrap());
    assert!(task.complete(Some(Payload::unit())));
    assert_eq!(task.state(), RecordState::Delivered);
    assert_eq!(task.lifecycle.tried_times, 3);
}

#[test]
fn test_tried_times_never_exceeds_try_times() {
    let start = Utc::now();
    let policy = RetryPolicy::new(4, Duration::days(1)).with_backoff(BackoffPolicy::Immediate);
    let mut task = record(RecordFamily::Task, start, &policy);

    let mut exhausted = false;
    for _ in 0..10 {
        match task.begin_attempt(start, &policy.backoff) {
            Ok(true) => {
                task.fail("still broken");
            }
            Ok(false) => break,
            Err(RecordError::RetriesExhausted { tried, max }) => {
                assert_eq!(tried, max);
                exhausted = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert!(task.lifecycle.tried_times <= task.lifecycle.try_times);
    }

    // The fourth failure already used the whole budget.
    assert!(!exhausted);
    assert_eq!(task.state(), RecordState::Failed);
    assert_eq!(task.lifecycle.tried_times, 4);
}

#[test]
fn test_crashed_attempt_at_budget_fails_on_next_begin() {
    let start = Utc::now();
    let policy = RetryPolicy::new(2, Duration::days(1)).with_backoff(BackoffPolicy::Immediate);
    let mut task = record(RecordFamily::Task, start, &policy);

    task.begin_attempt(start, &policy.backoff).unwrap();
    task.fail("first");
    task.begin_attempt(start, &policy.backoff).unwrap();
    // Process dies here: the record is left CONFIRMING with tried == try.
    assert_eq!(task.state(), RecordState::Confirming);

    let err = task.begin_attempt(start, &policy.backoff).unwrap_err();
    assert!(err.is_terminal());
    assert_eq!(task.state(), RecordState::Failed);
}

// ============================================================================
// Event scenarios
// ============================================================================

#[test]
fn test_event_past_deadline_expires_without_attempt() {
    let start = Utc::now();
    let policy = RetryPolicy::event_default();
    let mut event = record(RecordFamily::Event, start, &policy);
    assert_eq!(event.lifecycle.try_times, 30);

    let sweep_time = start + Duration::days(1) + Duration::seconds(1);
    let err = event.begin_attempt(sweep_time, &policy.backoff).unwrap_err();

    assert!(matches!(err, RecordError::Expired { .. }));
    assert_eq!(event.state(), RecordState::Expired);
    assert_eq!(event.lifecycle.tried_times, 0);
}

#[test]
fn test_cancelled_event_is_never_attempted() {
    let start = Utc::now();
    let policy = RetryPolicy::event_default();
    let mut event = record(RecordFamily::Event, start, &policy);

    assert!(event.cancel());
    assert!(!event.begin_attempt(start, &policy.backoff).unwrap());
    assert_eq!(event.state(), RecordState::Cancel);
}
