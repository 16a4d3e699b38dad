//! Two-stage pipeline on the in-memory coordinator.
//!
//! A producer declares two chained work specs, enqueues units on the first,
//! and a worker drains them; finishing each first-stage unit chains a
//! second-stage unit via the `output` key.

use std::sync::Arc;

use foreman::{
    Attempt, AttemptRequest, Coordinate, MemoryCoordinate, Namespace, Value, WorkSpec,
    WorkUnitMeta, WorkUnitQuery, Worker,
};

fn stage_one_output(name: &str) -> foreman::DataMap {
    let mut payload = foreman::DataMap::new();
    payload.insert(
        "output".to_string(),
        Value::List(vec![Value::from(format!("{name}-derived"))]),
    );
    payload
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    println!("=== Foreman Memory Pipeline Example ===\n");

    let coordinate = Arc::new(MemoryCoordinate::new());
    let ns = coordinate.namespace("").await?;

    println!("1. Declaring work specs (extract -> transform)...");
    let mut extract = foreman::DataMap::new();
    extract.insert("name".to_string(), Value::from("extract"));
    extract.insert("priority".to_string(), Value::Int(10));
    extract.insert("then".to_string(), Value::from("transform"));
    ns.set_work_spec(extract).await?;

    let mut transform = foreman::DataMap::new();
    transform.insert("name".to_string(), Value::from("transform"));
    ns.set_work_spec(transform).await?;

    println!("2. Enqueueing work units on extract...");
    let spec = ns.work_spec("extract").await?;
    for i in 0..3 {
        spec.add_work_unit(
            &format!("doc-{i}"),
            foreman::DataMap::new(),
            WorkUnitMeta::default(),
        )
        .await?;
    }

    println!("3. Draining work as worker \"w1\"...\n");
    let worker = ns.worker("w1").await?;
    loop {
        let attempts = worker.request_attempts(AttemptRequest::default()).await?;
        let Some(attempt) = attempts.into_iter().next() else {
            break;
        };
        println!(
            "   [w1] leased {}/{}",
            attempt.work_spec_name(),
            attempt.work_unit_name()
        );
        let data = if attempt.work_spec_name() == "extract" {
            Some(stage_one_output(attempt.work_unit_name()))
        } else {
            None
        };
        attempt.finish(data).await?;
        println!(
            "   [w1] finished {}/{}",
            attempt.work_spec_name(),
            attempt.work_unit_name()
        );
    }

    println!("\n4. Final status:");
    for name in ["extract", "transform"] {
        let spec = ns.work_spec(name).await?;
        let counts = spec.count_work_unit_status().await?;
        let total = spec.work_units(WorkUnitQuery::default()).await?.len();
        println!("   {name}: {total} units, statuses {counts:?}");
    }

    println!("\n=== Example Complete ===");
    Ok(())
}
