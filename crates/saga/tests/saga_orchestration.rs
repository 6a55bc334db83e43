//! Forward execution, replay and compensation of persisted sagas.

mod support;

use std::future::{Ready, ready};
use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{Clock, HandlerError, ManualClock};
use record::{PayloadType, RecordState, RetryPolicy, SagaRecord};
use record_store::{InMemorySagaRepository, SagaRepository};
use saga::{
    Compensation, MISSING_ROLLBACK, Process, SagaDefinition, SagaError, SagaRunner,
    SagaStateMachine, SagaSubmission,
};
use serde::{Deserialize, Serialize};
use support::{
    Journal, OrderContext, OrderFulfillment, STEP_CHARGE, STEP_RESERVE, STEP_SHIP,
};

struct Fixture {
    machine: SagaStateMachine<OrderFulfillment>,
    services: OrderFulfillment,
    repo: InMemorySagaRepository,
    clock: ManualClock,
    journal: Journal,
}

fn setup(retry_times: u32) -> Fixture {
    let journal = Journal::default();
    let services = OrderFulfillment::new(&journal, retry_times);
    let repo = InMemorySagaRepository::new();
    let clock = ManualClock::new(Utc::now());
    let machine = SagaStateMachine::new(
        services.clone(),
        "shop",
        Arc::new(repo.clone()),
        Arc::new(clock.clone()),
    )
    .unwrap();

    Fixture {
        machine,
        services,
        repo,
        clock,
        journal,
    }
}

fn order() -> OrderContext {
    OrderContext::new("order-1", 4_999)
}

fn step_state(saga: &SagaRecord, code: i32) -> RecordState {
    saga.step(code).unwrap().state()
}

// ============================================================================
// Forward execution
// ============================================================================

#[tokio::test]
async fn test_run_completes_every_step() {
    let f = setup(3);

    let submission = f.machine.run(order(), true, Some("order-1")).await.unwrap();
    assert!(submission.is_accepted());
    let saga = submission.into_saga();

    assert_eq!(saga.state(), RecordState::Done);
    assert!(saga.all_steps_done());
    let context: OrderContext = saga.context().decode().unwrap();
    assert_eq!(context.reservation_id.as_deref(), Some("RES-0001"));
    assert_eq!(context.payment_id.as_deref(), Some("PAY-0001"));
    assert_eq!(context.tracking_number.as_deref(), Some("TRK-RES-0001"));
    assert_eq!(f.journal.entries(), vec!["reserve", "charge", "ship"]);

    let stored = f.repo.get(saga.id()).await.unwrap().unwrap();
    assert_eq!(stored, saga);
}

#[tokio::test]
async fn test_duplicate_uuid_returns_existing_saga() {
    let f = setup(3);
    let first = f.machine.run(order(), true, Some("order-1")).await.unwrap();

    let second = f.machine.run(order(), true, Some("order-1")).await.unwrap();

    assert!(!second.is_accepted());
    assert!(matches!(second, SagaSubmission::Duplicate(_)));
    assert_eq!(second.saga().id(), first.saga().id());
    assert_eq!(f.journal.count("reserve"), 1);
}

#[tokio::test]
async fn test_missing_uuid_is_generated() {
    let f = setup(3);
    let saga = f.machine.run(order(), true, Some("  ")).await.unwrap().into_saga();

    assert!(!saga.uuid().trim().is_empty());
    let found = f.machine.find_by_uuid(saga.uuid()).await.unwrap().unwrap();
    assert_eq!(found.id(), saga.id());
}

#[tokio::test]
async fn test_run_later_leaves_saga_for_the_sweep() {
    let f = setup(3);

    let saga = f.machine.run(order(), false, Some("order-1")).await.unwrap().into_saga();
    assert_eq!(saga.state(), RecordState::Init);
    assert_eq!(saga.steps.len(), 3);
    assert!(saga.steps.iter().all(|s| s.state() == RecordState::Init));
    assert!(f.journal.entries().is_empty());

    let mut saga = saga;
    assert!(f.machine.begin_resume(&mut saga, f.clock.now()).await.unwrap());
    let saga = f.machine.resume(saga).await.unwrap();
    assert_eq!(saga.state(), RecordState::Done);
}

#[tokio::test]
async fn test_local_retries_absorb_transient_handler_errors() {
    let f = setup(3);
    f.services.payment.fail_next_charges(2);

    let saga = f.machine.run(order(), true, None).await.unwrap().into_saga();

    assert_eq!(saga.state(), RecordState::Done);
    assert_eq!(f.journal.count("charge"), 3);
    // Local retries are not counted against the step's budget.
    assert_eq!(saga.step(STEP_CHARGE).unwrap().lifecycle.tried_times, 1);
}

// ============================================================================
// Resume
// ============================================================================

#[tokio::test]
async fn test_failed_pass_with_attempts_left_stays_running() {
    let f = setup(3);
    f.services.payment.fail_next_charges(3);

    let saga = f.machine.run(order(), true, Some("order-1")).await.unwrap().into_saga();

    assert_eq!(saga.state(), RecordState::Running);
    assert_eq!(step_state(&saga, STEP_RESERVE), RecordState::Done);
    assert_eq!(step_state(&saga, STEP_CHARGE), RecordState::Running);
    assert_eq!(step_state(&saga, STEP_SHIP), RecordState::Init);
    assert_eq!(
        saga.step(STEP_CHARGE).unwrap().lifecycle.last_error.as_deref(),
        Some("Payment declined")
    );
    assert_eq!(
        saga.record.lifecycle.next_try_time,
        f.clock.now() + Duration::minutes(10)
    );
}

#[tokio::test]
async fn test_resume_does_not_replay_done_steps() {
    let f = setup(3);
    f.services.payment.fail_next_charges(3);
    let mut saga = f.machine.run(order(), true, Some("order-1")).await.unwrap().into_saga();

    // Not due before the backoff elapses.
    assert!(!f.machine.begin_resume(&mut saga, f.clock.now()).await.unwrap());

    f.clock.advance(Duration::minutes(10));
    assert!(f.machine.begin_resume(&mut saga, f.clock.now()).await.unwrap());
    let saga = f.machine.resume(saga).await.unwrap();

    assert_eq!(saga.state(), RecordState::Done);
    assert_eq!(saga.record.lifecycle.tried_times, 2);
    assert_eq!(f.journal.count("reserve"), 1);
    assert_eq!(f.journal.count("charge"), 4);
    assert_eq!(f.services.inventory.reservation_count(), 1);

    // The reservation made in the first pass flows into the charge input.
    let input: OrderContext = saga
        .step(STEP_CHARGE)
        .unwrap()
        .input
        .as_ref()
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(input.reservation_id.as_deref(), Some("RES-0001"));
}

#[tokio::test]
async fn test_resume_after_deadline_expires_saga() {
    let f = setup(3);
    let mut saga = f.machine.run(order(), false, Some("order-1")).await.unwrap().into_saga();

    f.clock.advance(Duration::days(2));
    assert!(!f.machine.begin_resume(&mut saga, f.clock.now()).await.unwrap());

    let stored = f.machine.find_by_uuid("order-1").await.unwrap().unwrap();
    assert_eq!(stored.state(), RecordState::Expired);
    assert!(f.journal.entries().is_empty());
}

#[tokio::test]
async fn test_exhausted_budget_moves_to_rollback() {
    let f = setup(2);
    f.services.payment.fail_next_charges(u32::MAX);
    let mut saga = f.machine.run(order(), true, Some("order-1")).await.unwrap().into_saga();
    assert_eq!(saga.state(), RecordState::Running);

    f.clock.advance(Duration::minutes(10));
    assert!(f.machine.begin_resume(&mut saga, f.clock.now()).await.unwrap());
    let saga = f.machine.resume(saga).await.unwrap();

    assert_eq!(saga.state(), RecordState::Rollbacking);
    assert_eq!(step_state(&saga, STEP_CHARGE), RecordState::Failed);
    assert!(saga.record.lifecycle.tried_times <= saga.record.lifecycle.try_times);
}

#[tokio::test]
async fn test_saga_of_other_type_is_rejected() {
    let f = setup(3);
    let mut saga = f.machine.run(order(), false, None).await.unwrap().into_saga();
    saga.record.kind = "refund_order".to_string();

    let result = f.machine.resume(saga).await;

    assert!(matches!(result, Err(SagaError::TypeMismatch { .. })));
}

// ============================================================================
// Compensation
// ============================================================================

#[tokio::test]
async fn test_failed_charge_rolls_back_in_reverse_order() {
    let f = setup(1);
    f.services.payment.fail_next_charges(u32::MAX);

    let saga = f.machine.run(order(), true, Some("order-1")).await.unwrap().into_saga();
    assert_eq!(saga.state(), RecordState::Rollbacking);
    assert_eq!(step_state(&saga, STEP_CHARGE), RecordState::Failed);

    let saga = f.machine.rollback(saga).await.unwrap();

    assert_eq!(saga.state(), RecordState::Rollbacked);
    assert_eq!(step_state(&saga, STEP_RESERVE), RecordState::Rollbacked);
    assert_eq!(step_state(&saga, STEP_CHARGE), RecordState::Rollbacked);
    assert_eq!(step_state(&saga, STEP_SHIP), RecordState::Init);
    assert_eq!(
        f.journal.entries(),
        vec!["reserve", "charge", "charge", "charge", "refund", "release"]
    );
    assert_eq!(f.services.inventory.reservation_count(), 0);
    assert_eq!(f.services.shipping.shipment_count(), 0);
}

#[tokio::test]
async fn test_begin_rollback_reclaims_rolling_back_saga() {
    let f = setup(1);
    f.services.payment.fail_next_charges(u32::MAX);
    let mut saga = f.machine.run(order(), true, None).await.unwrap().into_saga();

    f.clock.advance(Duration::minutes(1));
    let now = f.clock.now();
    assert!(f.machine.begin_rollback(&mut saga, now).await.unwrap());
    assert_eq!(saga.record.lifecycle.next_try_time, now + Duration::minutes(10));

    let stored = f.repo.get(saga.id()).await.unwrap().unwrap();
    assert_eq!(stored.record.version, saga.record.version);
}

#[tokio::test]
async fn test_done_saga_has_nothing_to_roll_back() {
    let f = setup(1);
    let mut saga = f.machine.run(order(), true, None).await.unwrap().into_saga();

    assert!(!f.machine.begin_rollback(&mut saga, f.clock.now()).await.unwrap());
    let saga = f.machine.rollback(saga).await.unwrap();
    assert_eq!(saga.state(), RecordState::Done);
}

#[tokio::test]
async fn test_failing_compensation_abandons_rollback() {
    let f = setup(1);
    f.services.payment.fail_next_charges(u32::MAX);
    f.services.payment.set_fail_on_refund(true);
    let saga = f.machine.run(order(), true, None).await.unwrap().into_saga();

    let saga = f.machine.rollback(saga).await.unwrap();

    assert_eq!(saga.state(), RecordState::Failed);
    assert_eq!(step_state(&saga, STEP_CHARGE), RecordState::Rollbacking);
    assert_eq!(
        saga.step(STEP_CHARGE).unwrap().lifecycle.last_error.as_deref(),
        Some("Refund gateway unavailable")
    );
    // Reserve ran before charge, so it is not compensated yet.
    assert_eq!(step_state(&saga, STEP_RESERVE), RecordState::Done);
    assert_eq!(f.journal.count("refund"), 3);
    assert_eq!(f.journal.count("release"), 0);
}

// ============================================================================
// Nested graphs
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Trace {
    visited: Vec<String>,
}

impl PayloadType for Trace {
    const TYPE_TAG: &'static str = "trace";
}

fn forward(
    journal: &Journal,
    name: &'static str,
    fail: bool,
) -> impl Fn(Trace) -> Ready<Result<Trace, HandlerError>> + Send + Sync + 'static {
    let journal = journal.clone();
    move |mut trace: Trace| {
        journal.record(format!("run {name}"));
        if fail {
            return ready(Err(format!("{name} failed").into()));
        }
        trace.visited.push(name.to_string());
        ready(Ok(trace))
    }
}

fn undo(
    journal: &Journal,
    name: &'static str,
) -> impl Fn(Compensation<Trace>) -> Ready<Result<bool, HandlerError>> + Send + Sync + 'static {
    let journal = journal.clone();
    move |_| {
        journal.record(format!("undo {name}"));
        ready(Ok(true))
    }
}

/// A with sub-step B, then C, which always fails.
struct NestedSaga {
    journal: Journal,
    b_has_rollback: bool,
}

impl SagaDefinition for NestedSaga {
    type Context = Trace;
    const SAGA_TYPE: &'static str = "nested";

    fn process(&self) -> Process<Trace> {
        let mut b = Process::of(110, "b", forward(&self.journal, "b", false));
        if self.b_has_rollback {
            b = b.with_rollback(undo(&self.journal, "b"));
        }
        Process::of(100, "a", forward(&self.journal, "a", false))
            .with_rollback(undo(&self.journal, "a"))
            .add_sub(b)
            .then(
                Process::of(120, "c", forward(&self.journal, "c", true))
                    .with_rollback(undo(&self.journal, "c")),
            )
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(1, Duration::days(1))
    }
}

fn nested(b_has_rollback: bool) -> (SagaStateMachine<NestedSaga>, Journal) {
    let journal = Journal::default();
    let machine = SagaStateMachine::new(
        NestedSaga {
            journal: journal.clone(),
            b_has_rollback,
        },
        "shop",
        Arc::new(InMemorySagaRepository::new()),
        Arc::new(ManualClock::default()),
    )
    .unwrap();
    (machine, journal)
}

#[tokio::test]
async fn test_sub_step_is_compensated_before_its_parent() {
    let (machine, journal) = nested(true);

    let saga = machine.run(Trace::default(), true, None).await.unwrap().into_saga();
    assert_eq!(saga.state(), RecordState::Rollbacking);
    let saga = machine.rollback(saga).await.unwrap();

    assert_eq!(saga.state(), RecordState::Rollbacked);
    let entries = journal.entries();
    let position = |entry: &str| entries.iter().position(|e| e == entry).unwrap();
    assert!(position("undo c") < position("undo b"));
    assert!(position("undo b") < position("undo a"));
}

#[tokio::test]
async fn test_missing_rollback_handler_is_surfaced() {
    let (machine, journal) = nested(false);
    let saga = machine.run(Trace::default(), true, Some("t-1")).await.unwrap().into_saga();

    let result = machine.rollback(saga).await;

    assert!(matches!(
        result,
        Err(SagaError::MissingCompensation { code: 110, .. })
    ));
    let saga = machine.find_by_uuid("t-1").await.unwrap().unwrap();
    assert_eq!(saga.state(), RecordState::Failed);
    assert_eq!(step_state(&saga, 120), RecordState::Rollbacked);
    assert_eq!(step_state(&saga, 110), RecordState::Failed);
    assert_eq!(
        saga.step(110).unwrap().lifecycle.last_error.as_deref(),
        Some(MISSING_ROLLBACK)
    );
    assert_eq!(step_state(&saga, 100), RecordState::Done);
    assert_eq!(journal.count("undo a"), 0);
}
