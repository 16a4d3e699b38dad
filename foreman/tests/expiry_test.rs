//! Deadline-driven expiration: attempt lifetimes, worker heartbeats, and
//! the background sweeper, all driven through the mock clock.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use foreman::{
    Attempt, AttemptRequest, AttemptStatus, Clock, Coordinate, Error, ExpirySweeper,
    MemoryCoordinate, Namespace, Value, WorkSpec, WorkUnit, WorkUnitMeta, WorkUnitStatus, Worker,
};
use foreman_testkit::{data, spec_data, MockClock};

async fn setup() -> (Arc<MockClock>, MemoryCoordinate, Arc<dyn Namespace>) {
    let clock = Arc::new(MockClock::fixed());
    let coordinate = MemoryCoordinate::with_clock(clock.clone());
    let ns = coordinate.namespace("").await.expect("namespace");
    ns.set_work_spec(spec_data("s1", &[])).await.expect("spec");
    let spec = ns.work_spec("s1").await.expect("spec");
    spec.add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("unit");
    (clock, coordinate, ns)
}

#[tokio::test]
async fn expired_attempt_returns_unit_to_another_worker() {
    let (clock, coordinate, ns) = setup().await;
    let w1 = ns.worker("w1").await.expect("w1");
    let attempts = w1
        .request_attempts(AttemptRequest {
            lifetime: Some(Duration::seconds(1)),
            ..Default::default()
        })
        .await
        .expect("lease");
    assert_eq!(attempts.len(), 1);

    clock.advance(Duration::seconds(2));
    let expired = coordinate.expire_attempts().await.expect("sweep");
    assert_eq!(expired, 1);
    assert_eq!(
        attempts[0].status().await.expect("status"),
        AttemptStatus::Expired
    );

    let unit = ns
        .work_spec("s1")
        .await
        .expect("spec")
        .work_unit("u1")
        .await
        .expect("unit");
    assert_eq!(
        unit.status().await.expect("status"),
        WorkUnitStatus::Available
    );

    // A different worker picks it up; the dead attempt stays terminal.
    let w2 = ns.worker("w2").await.expect("w2");
    let again = w2
        .request_attempts(AttemptRequest::default())
        .await
        .expect("lease");
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].worker_name(), "w2");
    assert!(matches!(
        attempts[0].finish(None).await,
        Err(Error::AttemptTerminated)
    ));
}

#[tokio::test]
async fn sweep_is_idempotent() {
    let (clock, coordinate, ns) = setup().await;
    let worker = ns.worker("w").await.expect("worker");
    worker
        .request_attempts(AttemptRequest {
            lifetime: Some(Duration::seconds(1)),
            ..Default::default()
        })
        .await
        .expect("lease");

    clock.advance(Duration::seconds(5));
    assert_eq!(coordinate.expire_attempts().await.expect("sweep"), 1);
    assert_eq!(coordinate.expire_attempts().await.expect("sweep"), 0);
}

#[tokio::test]
async fn attempt_expiry_with_exhausted_retries_fails_the_unit() {
    let clock = Arc::new(MockClock::fixed());
    let coordinate = MemoryCoordinate::with_clock(clock.clone());
    let ns = coordinate.namespace("").await.expect("namespace");
    let spec = ns
        .set_work_spec(spec_data("s1", &[("max_retries", Value::Int(1))]))
        .await
        .expect("spec");
    spec.add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("unit");
    let worker = ns.worker("w").await.expect("worker");

    // Consume the single retry with a failure, then let the second
    // attempt's deadline lapse.
    let first = worker
        .request_attempts(AttemptRequest::default())
        .await
        .expect("lease");
    first[0].fail(None).await.expect("fail");

    let second = worker
        .request_attempts(AttemptRequest {
            lifetime: Some(Duration::seconds(1)),
            ..Default::default()
        })
        .await
        .expect("lease");
    clock.advance(Duration::seconds(2));
    coordinate.expire_attempts().await.expect("sweep");

    assert_eq!(
        second[0].status().await.expect("status"),
        AttemptStatus::Expired
    );
    let unit = spec.work_unit("u1").await.expect("unit");
    assert_eq!(unit.status().await.expect("status"), WorkUnitStatus::Failed);
}

#[tokio::test]
async fn worker_past_heartbeat_deadline_is_released() {
    let (clock, coordinate, ns) = setup().await;
    let worker = ns.worker("w").await.expect("worker");
    worker
        .update(data(&[]), clock.now() + Duration::seconds(10), String::new())
        .await
        .expect("heartbeat");
    let attempts = worker
        .request_attempts(AttemptRequest {
            lifetime: Some(Duration::hours(1)),
            ..Default::default()
        })
        .await
        .expect("lease");
    assert_eq!(attempts.len(), 1);

    clock.advance(Duration::seconds(11));
    let expired = coordinate.expire_attempts().await.expect("sweep");
    assert_eq!(expired, 1);
    assert!(!worker.is_active().await.expect("active"));
    assert_eq!(
        attempts[0].status().await.expect("status"),
        AttemptStatus::Expired
    );
    let unit = ns
        .work_spec("s1")
        .await
        .expect("spec")
        .work_unit("u1")
        .await
        .expect("unit");
    assert_eq!(
        unit.status().await.expect("status"),
        WorkUnitStatus::Available
    );
}

#[tokio::test]
async fn forced_worker_expiry_releases_its_attempts() {
    let (_clock, _coordinate, ns) = setup().await;
    let worker = ns.worker("w").await.expect("worker");
    let attempts = worker
        .request_attempts(AttemptRequest::default())
        .await
        .expect("lease");
    assert_eq!(attempts.len(), 1);

    worker.expire().await.expect("expire worker");
    assert!(!worker.is_active().await.expect("active"));
    assert!(worker.active_attempts().await.expect("active").is_empty());
    assert_eq!(
        attempts[0].status().await.expect("status"),
        AttemptStatus::Expired
    );
}

#[tokio::test]
async fn heartbeat_reactivates_an_expired_worker() {
    let (clock, coordinate, ns) = setup().await;
    let worker = ns.worker("w").await.expect("worker");
    worker
        .update(data(&[]), clock.now() + Duration::seconds(1), String::new())
        .await
        .expect("heartbeat");
    clock.advance(Duration::seconds(2));
    coordinate.expire_attempts().await.expect("sweep");
    assert!(!worker.is_active().await.expect("active"));

    worker
        .update(data(&[]), clock.now() + Duration::hours(1), String::new())
        .await
        .expect("heartbeat");
    assert!(worker.is_active().await.expect("active"));
}

#[tokio::test]
async fn sweeper_task_expires_on_clock_advance() {
    let (clock, coordinate, ns) = setup().await;
    let worker = ns.worker("w").await.expect("worker");
    worker
        .request_attempts(AttemptRequest {
            lifetime: Some(Duration::seconds(1)),
            ..Default::default()
        })
        .await
        .expect("lease");

    let sweeper = ExpirySweeper::new(
        Arc::new(coordinate.clone()),
        clock.clone(),
        StdDuration::from_secs(5),
    );
    let shutdown = sweeper.shutdown_token();
    let handle = sweeper.spawn();
    // Let the sweeper park on its first sleep before moving time.
    tokio::task::yield_now().await;

    clock.advance(Duration::seconds(6));
    let unit = ns
        .work_spec("s1")
        .await
        .expect("spec")
        .work_unit("u1")
        .await
        .expect("unit");
    let mut released = false;
    for _ in 0..50 {
        tokio::task::yield_now().await;
        if unit.status().await.expect("status") == WorkUnitStatus::Available {
            released = true;
            break;
        }
    }
    assert!(released, "sweeper never released the expired unit");

    shutdown.cancel();
    handle.await.expect("sweeper stops");
}
