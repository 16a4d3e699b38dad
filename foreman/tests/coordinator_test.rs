//! Data-model tests against the in-memory backend: namespaces, work specs,
//! work units, workers, and their CRUD/query semantics.

use std::sync::Arc;

use foreman::{
    Coordinate, Error, MemoryCoordinate, Namespace, Value, WorkSpec, WorkUnit, WorkUnitMeta,
    WorkUnitQuery, WorkUnitStatus, Worker,
};
use foreman_testkit::{data, spec_data};

async fn default_namespace() -> (MemoryCoordinate, Arc<dyn Namespace>) {
    let coordinate = MemoryCoordinate::new();
    let ns = coordinate.namespace("").await.expect("default namespace");
    (coordinate, ns)
}

#[tokio::test]
async fn namespaces_are_created_on_reference_and_listed() {
    let coordinate = MemoryCoordinate::new();
    coordinate.namespace("").await.expect("default");
    coordinate.namespace("beta").await.expect("beta");
    coordinate.namespace("alpha").await.expect("alpha");

    let names: Vec<String> = coordinate
        .namespaces()
        .await
        .expect("namespaces")
        .iter()
        .map(|ns| ns.name().to_string())
        .collect();
    assert_eq!(names, vec!["", "alpha", "beta"]);
}

#[tokio::test]
async fn destroyed_namespace_reports_gone() {
    let (coordinate, ns) = default_namespace().await;
    ns.destroy().await.expect("destroy");

    assert!(matches!(
        ns.set_work_spec(spec_data("s1", &[])).await,
        Err(Error::Gone)
    ));
    assert!(matches!(ns.work_spec_names().await, Err(Error::Gone)));

    // Re-referencing the name creates a fresh namespace.
    let fresh = coordinate.namespace("").await.expect("recreate");
    assert_eq!(fresh.work_spec_names().await.expect("names").len(), 0);
}

#[tokio::test]
async fn set_work_spec_validates_name() {
    let (_coordinate, ns) = default_namespace().await;

    assert!(matches!(
        ns.set_work_spec(data(&[])).await,
        Err(Error::NoWorkSpecName)
    ));
    assert!(matches!(
        ns.set_work_spec(data(&[("name", Value::Int(5))])).await,
        Err(Error::BadWorkSpecName)
    ));
    assert!(matches!(
        ns.set_work_spec(data(&[("name", Value::from(""))])).await,
        Err(Error::BadWorkSpecName)
    ));
}

#[tokio::test]
async fn work_spec_data_round_trips() {
    let (_coordinate, ns) = default_namespace().await;
    let payload = spec_data(
        "s1",
        &[
            ("priority", Value::Int(3)),
            ("config", Value::Map(data(&[("depth", Value::Int(2))]))),
            ("tags", Value::Tuple(vec![Value::from("a"), Value::from("b")])),
        ],
    );
    let spec = ns.set_work_spec(payload.clone()).await.expect("set");
    assert_eq!(spec.data().await.expect("data"), payload);

    let fetched = ns.work_spec("s1").await.expect("lookup");
    assert_eq!(fetched.data().await.expect("data"), payload);
}

#[tokio::test]
async fn replacing_a_spec_preserves_units() {
    let (_coordinate, ns) = default_namespace().await;
    let spec = ns
        .set_work_spec(spec_data("s1", &[("priority", Value::Int(1))]))
        .await
        .expect("set");
    spec.add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("add");

    ns.set_work_spec(spec_data("s1", &[("priority", Value::Int(9))]))
        .await
        .expect("replace");
    let spec = ns.work_spec("s1").await.expect("lookup");
    assert_eq!(spec.meta(false).await.expect("meta").priority, 9);
    assert!(spec.work_unit("u1").await.is_ok());
}

#[tokio::test]
async fn unknown_lookups_report_typed_errors() {
    let (_coordinate, ns) = default_namespace().await;
    let spec = ns.set_work_spec(spec_data("s1", &[])).await.expect("set");

    assert!(matches!(
        ns.work_spec("nope").await,
        Err(Error::NoSuchWorkSpec { name }) if name == "nope"
    ));
    assert!(matches!(
        ns.destroy_work_spec("nope").await,
        Err(Error::NoSuchWorkSpec { .. })
    ));
    assert!(matches!(
        spec.work_unit("nope").await,
        Err(Error::NoSuchWorkUnit { name }) if name == "nope"
    ));
}

#[tokio::test]
async fn destroying_a_spec_cascades_and_leaves_handles_gone() {
    let (_coordinate, ns) = default_namespace().await;
    let spec = ns.set_work_spec(spec_data("s1", &[])).await.expect("set");
    let unit = spec
        .add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("add");

    ns.destroy_work_spec("s1").await.expect("destroy");
    assert!(matches!(spec.data().await, Err(Error::Gone)));
    assert!(matches!(unit.data().await, Err(Error::Gone)));
    assert_eq!(ns.work_spec_names().await.expect("names").len(), 0);
}

#[tokio::test]
async fn work_unit_data_round_trips_and_replaces() {
    let (_coordinate, ns) = default_namespace().await;
    let spec = ns.set_work_spec(spec_data("s1", &[])).await.expect("set");

    let payload = data(&[
        ("bytes", Value::Bytes(vec![1, 2, 3])),
        ("nested", Value::List(vec![Value::Null, Value::Float(0.5)])),
    ]);
    let unit = spec
        .add_work_unit("u1", payload.clone(), WorkUnitMeta::default())
        .await
        .expect("add");
    assert_eq!(unit.data().await.expect("data"), payload);

    let replacement = data(&[("v", Value::Int(2))]);
    spec.add_work_unit("u1", replacement.clone(), WorkUnitMeta::default())
        .await
        .expect("replace");
    assert_eq!(unit.data().await.expect("data"), replacement);
    // still one unit
    assert_eq!(
        spec.work_units(WorkUnitQuery::default())
            .await
            .expect("units")
            .len(),
        1
    );
}

#[tokio::test]
async fn work_unit_queries_filter_sort_and_paginate() {
    let (_coordinate, ns) = default_namespace().await;
    let spec = ns.set_work_spec(spec_data("s1", &[])).await.expect("set");
    spec.add_work_units(vec![
        ("low-b".to_string(), data(&[]), WorkUnitMeta::default()),
        ("low-a".to_string(), data(&[]), WorkUnitMeta::default()),
        (
            "high".to_string(),
            data(&[]),
            WorkUnitMeta {
                priority: 10.0,
                not_before: None,
            },
        ),
    ])
    .await
    .expect("add units");

    let names: Vec<String> = spec
        .work_units(WorkUnitQuery::default())
        .await
        .expect("all")
        .iter()
        .map(|u| u.name().to_string())
        .collect();
    assert_eq!(names, vec!["high", "low-a", "low-b"]);

    let page = spec
        .work_units(WorkUnitQuery {
            limit: Some(2),
            ..Default::default()
        })
        .await
        .expect("page one");
    assert_eq!(page.len(), 2);
    let rest = spec
        .work_units(WorkUnitQuery {
            previous_name: Some(page[1].name().to_string()),
            ..Default::default()
        })
        .await
        .expect("page two");
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].name(), "low-b");

    let by_name = spec
        .work_units(WorkUnitQuery {
            names: vec!["low-a".to_string()],
            ..Default::default()
        })
        .await
        .expect("by name");
    assert_eq!(by_name.len(), 1);
    assert_eq!(by_name[0].name(), "low-a");
}

#[tokio::test]
async fn status_counts_partition_the_units() {
    let (_coordinate, ns) = default_namespace().await;
    let spec = ns.set_work_spec(spec_data("s1", &[])).await.expect("set");
    for name in ["u1", "u2", "u3"] {
        spec.add_work_unit(name, data(&[]), WorkUnitMeta::default())
            .await
            .expect("add");
    }
    let worker = ns.worker("w").await.expect("worker");
    let attempts = worker
        .request_attempts(foreman::AttemptRequest::default())
        .await
        .expect("lease");
    assert_eq!(attempts.len(), 1);

    let counts = spec.count_work_unit_status().await.expect("counts");
    assert_eq!(counts.get(&WorkUnitStatus::Available), Some(&2));
    assert_eq!(counts.get(&WorkUnitStatus::Pending), Some(&1));
    assert_eq!(counts.values().sum::<usize>(), 3);
}

#[tokio::test]
async fn delete_work_units_honors_the_query() {
    let (_coordinate, ns) = default_namespace().await;
    let spec = ns.set_work_spec(spec_data("s1", &[])).await.expect("set");
    for name in ["u1", "u2", "u3"] {
        spec.add_work_unit(name, data(&[]), WorkUnitMeta::default())
            .await
            .expect("add");
    }

    let deleted = spec
        .delete_work_units(WorkUnitQuery {
            names: vec!["u2".to_string()],
            ..Default::default()
        })
        .await
        .expect("delete one");
    assert_eq!(deleted, 1);

    let deleted = spec
        .delete_work_units(WorkUnitQuery::default())
        .await
        .expect("delete rest");
    assert_eq!(deleted, 2);
    assert!(spec
        .work_units(WorkUnitQuery::default())
        .await
        .expect("units")
        .is_empty());
}

#[tokio::test]
async fn unit_priority_can_be_adjusted() {
    let (_coordinate, ns) = default_namespace().await;
    let spec = ns.set_work_spec(spec_data("s1", &[])).await.expect("set");
    let unit = spec
        .add_work_unit("u1", data(&[]), WorkUnitMeta::default())
        .await
        .expect("add");
    assert_eq!(unit.priority().await.expect("priority"), 0.0);
    unit.set_priority(4.5).await.expect("set priority");
    assert_eq!(unit.priority().await.expect("priority"), 4.5);
}

#[tokio::test]
async fn set_meta_adjusts_knobs_but_not_data_derived_fields() {
    let (_coordinate, ns) = default_namespace().await;
    let spec = ns
        .set_work_spec(spec_data("s1", &[("then", Value::from("s2"))]))
        .await
        .expect("set");

    let mut update = spec.meta(false).await.expect("meta");
    update.priority = 7;
    update.paused = true;
    update.next_work_spec_name = Some("hijacked".to_string());
    spec.set_meta(update).await.expect("set meta");

    let meta = spec.meta(false).await.expect("meta");
    assert_eq!(meta.priority, 7);
    assert!(meta.paused);
    assert_eq!(meta.next_work_spec_name.as_deref(), Some("s2"));
}

#[tokio::test]
async fn workers_are_lazy_and_heartbeat() {
    let (coordinate, ns) = default_namespace().await;
    let worker = ns.worker("w1").await.expect("worker");
    assert!(worker.is_active().await.expect("active"));

    let expiration = chrono::Utc::now() + chrono::Duration::hours(1);
    worker
        .update(
            data(&[("host", Value::from("node-7"))]),
            expiration,
            "RUN".to_string(),
        )
        .await
        .expect("update");
    assert_eq!(worker.mode().await.expect("mode"), "RUN");
    assert_eq!(
        worker.data().await.expect("data").get("host"),
        Some(&Value::from("node-7"))
    );
    foreman_testkit::assert_same_time(worker.expiration().await.expect("expiration"), expiration);

    let listed = ns.workers().await.expect("workers");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name(), "w1");
    drop(coordinate);
}

#[tokio::test]
async fn worker_parent_child_tree() {
    let (_coordinate, ns) = default_namespace().await;
    let child = ns.worker("child").await.expect("child");
    assert!(child.parent().await.expect("parent").is_none());

    child
        .set_parent(Some("boss".to_string()))
        .await
        .expect("set parent");
    let parent = child.parent().await.expect("parent").expect("some parent");
    assert_eq!(parent.name(), "boss");
    let children = parent.children().await.expect("children");
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].name(), "child");

    child.set_parent(None).await.expect("detach");
    assert!(child.parent().await.expect("parent").is_none());
    assert!(parent.children().await.expect("children").is_empty());
}
