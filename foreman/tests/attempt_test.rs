//! Attempt lifecycle tests: leasing, transitions, ownership guards,
//! retry policy, chaining, and continuous specs.

use std::sync::Arc;

use chrono::Duration;
use foreman::{
    Attempt, AttemptRequest, AttemptStatus, Clock, Coordinate, Error, MemoryCoordinate,
    Namespace, Value, WorkSpec, WorkUnit, WorkUnitMeta, WorkUnitStatus, Worker,
};
use foreman_testkit::{data, spec_data, MockClock};

async fn simple_setup() -> (MemoryCoordinate, Arc<dyn Namespace>) {
    let coordinate = MemoryCoordinate::new();
    let ns = coordinate.namespace("").await.expect("namespace");
    ns.set_work_spec(spec_data("s1", &[("priority", Value::Int(1))]))
        .await
        .expect("spec");
    (coordinate, ns)
}

async fn lease_one(ns: &Arc<dyn Namespace>, worker: &str) -> Arc<dyn Attempt> {
    let worker = ns.worker(worker).await.expect("worker");
    let mut attempts = worker
        .request_attempts(AttemptRequest::default())
        .await
        .expect("lease");
    assert_eq!(attempts.len(), 1);
    attempts.remove(0)
}

#[tokio::test]
async fn leasing_takes_units_in_name_order() {
    let (_coordinate, ns) = simple_setup().await;
    let spec = ns.work_spec("s1").await.expect("spec");
    spec.add_work_units(vec![
        ("u2".to_string(), data(&[]), WorkUnitMeta::default()),
        ("u1".to_string(), data(&[]), WorkUnitMeta::default()),
    ])
    .await
    .expect("units");

    let attempt = lease_one(&ns, "w").await;
    assert_eq!(attempt.work_unit_name(), "u1");
    assert_eq!(attempt.worker_name(), "w");
    assert_eq!(attempt.status().await.expect("status"), AttemptStatus::Pending);

    let u1 = spec.work_unit("u1").await.expect("u1");
    let u2 = spec.work_unit("u2").await.expect("u2");
    assert_eq!(u1.status().await.expect("status"), WorkUnitStatus::Pending);
    assert_eq!(u2.status().await.expect("status"), WorkUnitStatus::Available);
}

#[tokio::test]
async fn unit_priority_overrides_name_order() {
    let (_coordinate, ns) = simple_setup().await;
    let spec = ns.work_spec("s1").await.expect("spec");
    spec.add_work_unit("aaa", data(&[]), WorkUnitMeta::default())
        .await
        .expect("add");
    spec.add_work_unit(
        "zzz",
        data(&[]),
        WorkUnitMeta {
            priority: 5.0,
            not_before: None,
        },
    )
    .await
    .expect("add");

    let attempt = lease_one(&ns, "w").await;
    assert_eq!(attempt.work_unit_name(), "zzz");
}

#[tokio::test]
async fn finish_completes_the_unit_and_frees_the_worker() {
    let (_coordinate, ns) = simple_setup().await;
    let spec = ns.work_spec("s1").await.expect("spec");
    spec.add_work_units(vec![
        ("u1".to_string(), data(&[]), WorkUnitMeta::default()),
        ("u2".to_string(), data(&[]), WorkUnitMeta::default()),
    ])
    .await
    .expect("units");

    let attempt = lease_one(&ns, "w").await;
    attempt.finish(None).await.expect("finish");
    assert_eq!(
        attempt.status().await.expect("status"),
        AttemptStatus::Finished
    );
    assert!(attempt.end_time().await.expect("end").is_some());

    let u1 = spec.work_unit("u1").await.expect("u1");
    assert_eq!(u1.status().await.expect("status"), WorkUnitStatus::Finished);

    let worker = ns.worker("w").await.expect("worker");
    assert!(worker.active_attempts().await.expect("active").is_empty());
    assert_eq!(worker.all_attempts().await.expect("all").len(), 1);

    // The next lease picks up the remaining unit.
    let next = lease_one(&ns, "w").await;
    assert_eq!(next.work_unit_name(), "u2");
}

#[tokio::test]
async fn finish_records_output_data() {
    let (_coordinate, ns) = simple_setup().await;
    let spec = ns.work_spec("s1").await.expect("spec");
    let unit_data = data(&[("input", Value::Int(1))]);
    spec.add_work_unit("u1", unit_data.clone(), WorkUnitMeta::default())
        .await
        .expect("add");

    let attempt = lease_one(&ns, "w").await;
    // Until the attempt records data of its own, it reads the unit's.
    assert_eq!(attempt.data().await.expect("data"), unit_data);

    let result = data(&[("outcome", Value::from("ok"))]);
    attempt.finish(Some(result.clone())).await.expect("finish");
    assert_eq!(attempt.data().await.expect("data"), result);
}

#[tokio::test]
async fn transitions_on_terminal_attempts_fail() {
    let (_coordinate, ns) = simple_setup().await;
    let spec = ns.work_spec("s1").await.expect("spec");
    spec.add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("add");

    let attempt = lease_one(&ns, "w").await;
    attempt.finish(None).await.expect("finish");

    assert!(matches!(
        attempt.finish(None).await,
        Err(Error::AttemptTerminated)
    ));
    assert!(matches!(
        attempt.fail(None).await,
        Err(Error::AttemptTerminated)
    ));
    assert!(matches!(
        attempt.retry(Duration::zero()).await,
        Err(Error::AttemptTerminated)
    ));
    assert!(matches!(
        attempt.renew(Duration::seconds(30), None).await,
        Err(Error::AttemptTerminated)
    ));
}

#[tokio::test]
async fn displaced_attempt_reports_wrong_worker() {
    let (_coordinate, ns) = simple_setup().await;
    let spec = ns.work_spec("s1").await.expect("spec");
    spec.add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("add");

    let original = lease_one(&ns, "w1").await;
    let thief = ns.worker("w2").await.expect("w2");
    let replacement = thief
        .make_attempt("s1", "u1", Duration::minutes(5))
        .await
        .expect("make attempt");

    assert!(matches!(original.finish(None).await, Err(Error::WrongWorker)));
    assert!(matches!(
        original.retry(Duration::zero()).await,
        Err(Error::WrongWorker)
    ));
    // The replacement is the unit's active attempt and transitions fine.
    replacement.finish(None).await.expect("finish");

    let unit = spec.work_unit("u1").await.expect("unit");
    assert_eq!(
        unit.status().await.expect("status"),
        WorkUnitStatus::Finished
    );
    assert_eq!(unit.attempts().await.expect("attempts").len(), 2);
}

#[tokio::test]
async fn renew_extends_the_deadline() {
    let clock = Arc::new(MockClock::fixed());
    let coordinate = MemoryCoordinate::with_clock(clock.clone());
    let ns = coordinate.namespace("").await.expect("namespace");
    let spec = ns.set_work_spec(spec_data("s1", &[])).await.expect("spec");
    spec.add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("add");

    let worker = ns.worker("w").await.expect("worker");
    let attempts = worker
        .request_attempts(AttemptRequest {
            lifetime: Some(Duration::minutes(1)),
            ..Default::default()
        })
        .await
        .expect("lease");
    let attempt = &attempts[0];
    let first_deadline = attempt.expiration_time().await.expect("deadline");
    assert_eq!(first_deadline, clock.now() + Duration::minutes(1));

    clock.advance(Duration::seconds(30));
    attempt
        .renew(Duration::minutes(10), Some(data(&[("pct", Value::Int(50))])))
        .await
        .expect("renew");
    assert_eq!(
        attempt.expiration_time().await.expect("deadline"),
        clock.now() + Duration::minutes(10)
    );
    assert_eq!(
        attempt.data().await.expect("data").get("pct"),
        Some(&Value::Int(50))
    );
}

#[tokio::test]
async fn retry_returns_the_unit_after_the_delay() {
    let clock = Arc::new(MockClock::fixed());
    let coordinate = MemoryCoordinate::with_clock(clock.clone());
    let ns = coordinate.namespace("").await.expect("namespace");
    let spec = ns.set_work_spec(spec_data("s1", &[])).await.expect("spec");
    spec.add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("add");

    let worker = ns.worker("w").await.expect("worker");
    let attempts = worker
        .request_attempts(AttemptRequest::default())
        .await
        .expect("lease");
    attempts[0]
        .retry(Duration::seconds(30))
        .await
        .expect("retry");
    assert_eq!(
        attempts[0].status().await.expect("status"),
        AttemptStatus::Retryable
    );

    let unit = spec.work_unit("u1").await.expect("unit");
    assert_eq!(unit.status().await.expect("status"), WorkUnitStatus::Delayed);
    // Not schedulable while delayed.
    assert!(worker
        .request_attempts(AttemptRequest::default())
        .await
        .expect("lease")
        .is_empty());

    clock.advance(Duration::seconds(31));
    assert_eq!(
        unit.status().await.expect("status"),
        WorkUnitStatus::Available
    );
    let again = worker
        .request_attempts(AttemptRequest::default())
        .await
        .expect("lease");
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].work_unit_name(), "u1");
}

#[tokio::test]
async fn fail_without_retry_budget_sticks() {
    let (_coordinate, ns) = simple_setup().await;
    let spec = ns.work_spec("s1").await.expect("spec");
    spec.add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("add");

    let attempt = lease_one(&ns, "w").await;
    attempt
        .fail(Some(data(&[("error", Value::from("boom"))])))
        .await
        .expect("fail");
    assert_eq!(attempt.status().await.expect("status"), AttemptStatus::Failed);

    let unit = spec.work_unit("u1").await.expect("unit");
    assert_eq!(unit.status().await.expect("status"), WorkUnitStatus::Failed);
}

#[tokio::test]
async fn fail_with_retries_remaining_behaves_as_retry() {
    let coordinate = MemoryCoordinate::new();
    let ns = coordinate.namespace("").await.expect("namespace");
    let spec = ns
        .set_work_spec(spec_data("s1", &[("max_retries", Value::Int(1))]))
        .await
        .expect("spec");
    spec.add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("add");

    let first = lease_one(&ns, "w").await;
    first.fail(None).await.expect("fail");
    assert_eq!(
        first.status().await.expect("status"),
        AttemptStatus::Retryable
    );
    let unit = spec.work_unit("u1").await.expect("unit");
    assert_eq!(
        unit.status().await.expect("status"),
        WorkUnitStatus::Available
    );

    // Retry budget exhausted; the second failure sticks.
    let second = lease_one(&ns, "w").await;
    second.fail(None).await.expect("fail");
    assert_eq!(second.status().await.expect("status"), AttemptStatus::Failed);
    assert_eq!(unit.status().await.expect("status"), WorkUnitStatus::Failed);
}

#[tokio::test]
async fn finish_chains_output_onto_the_successor_spec() {
    let (_coordinate, ns) = simple_setup().await;
    ns.set_work_spec(spec_data("s1", &[("then", Value::from("s2"))]))
        .await
        .expect("replace s1");
    ns.set_work_spec(spec_data("s2", &[])).await.expect("s2");
    let s1 = ns.work_spec("s1").await.expect("s1");
    s1.add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("add");

    let attempt = lease_one(&ns, "w").await;
    let output = data(&[(
        "output",
        Value::List(vec![
            Value::from("v1"),
            Value::List(vec![
                Value::from("v2"),
                Value::Map(data(&[("k", Value::Int(1))])),
            ]),
        ]),
    )]);
    attempt.finish(Some(output)).await.expect("finish");

    let s2 = ns.work_spec("s2").await.expect("s2");
    let v1 = s2.work_unit("v1").await.expect("v1");
    assert!(v1.data().await.expect("data").is_empty());
    let v2 = s2.work_unit("v2").await.expect("v2");
    assert_eq!(v2.data().await.expect("data"), data(&[("k", Value::Int(1))]));
    assert_eq!(
        v1.status().await.expect("status"),
        WorkUnitStatus::Available
    );
}

#[tokio::test]
async fn chaining_to_a_missing_spec_is_not_an_error() {
    let (_coordinate, ns) = simple_setup().await;
    ns.set_work_spec(spec_data("s1", &[("then", Value::from("vanished"))]))
        .await
        .expect("replace s1");
    let s1 = ns.work_spec("s1").await.expect("s1");
    s1.add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("add");

    let attempt = lease_one(&ns, "w").await;
    let output = data(&[("output", Value::List(vec![Value::from("v1")]))]);
    attempt.finish(Some(output)).await.expect("finish");
    assert_eq!(
        attempt.status().await.expect("status"),
        AttemptStatus::Finished
    );
}

#[tokio::test]
async fn finish_without_output_does_not_chain() {
    let (_coordinate, ns) = simple_setup().await;
    ns.set_work_spec(spec_data("s1", &[("then", Value::from("s2"))]))
        .await
        .expect("replace s1");
    ns.set_work_spec(spec_data("s2", &[])).await.expect("s2");
    let s1 = ns.work_spec("s1").await.expect("s1");
    s1.add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("add");

    lease_one(&ns, "w").await.finish(None).await.expect("finish");
    let s2 = ns.work_spec("s2").await.expect("s2");
    assert!(s2
        .work_units(foreman::WorkUnitQuery::default())
        .await
        .expect("units")
        .is_empty());
}

#[tokio::test]
async fn continuous_spec_synthesizes_units_at_interval() {
    let clock = Arc::new(MockClock::fixed());
    let coordinate = MemoryCoordinate::with_clock(clock.clone());
    let ns = coordinate.namespace("").await.expect("namespace");
    ns.set_work_spec(spec_data(
        "ticker",
        &[
            ("continuous", Value::Bool(true)),
            ("interval", Value::Int(60)),
        ],
    ))
    .await
    .expect("spec");

    let worker = ns.worker("w").await.expect("worker");
    let first = worker
        .request_attempts(AttemptRequest::default())
        .await
        .expect("lease");
    assert_eq!(first.len(), 1);
    first[0].finish(None).await.expect("finish");

    // Inside the interval: nothing to synthesize, nothing to lease.
    clock.advance(Duration::seconds(30));
    assert!(worker
        .request_attempts(AttemptRequest::default())
        .await
        .expect("lease")
        .is_empty());

    clock.advance(Duration::seconds(31));
    let second = worker
        .request_attempts(AttemptRequest::default())
        .await
        .expect("lease");
    assert_eq!(second.len(), 1);
    assert_ne!(second[0].work_unit_name(), first[0].work_unit_name());
}

#[tokio::test]
async fn paused_continuous_spec_never_synthesizes() {
    let coordinate = MemoryCoordinate::new();
    let ns = coordinate.namespace("").await.expect("namespace");
    ns.set_work_spec(spec_data(
        "ticker",
        &[
            ("continuous", Value::Bool(true)),
            ("disabled", Value::Bool(true)),
        ],
    ))
    .await
    .expect("spec");

    let worker = ns.worker("w").await.expect("worker");
    assert!(worker
        .request_attempts(AttemptRequest::default())
        .await
        .expect("lease")
        .is_empty());
}
