use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::meta::WorkUnitMeta;
use crate::value::{DataMap, Value};

/// Derive follow-on work units from a finishing attempt's data.
///
/// When a work spec chains to a successor, the finishing attempt's data is
/// inspected for a sequence (or map) under the key `output`. Recognized
/// element shapes:
///
/// - a string (or UTF-8 byte string): a unit with that name and empty data
/// - a `[name]` / `[name, data]` / `[name, data, meta]` sequence, where
///   `meta` may carry `priority` and `delay` (seconds from now)
/// - a map entry `name -> data`
///
/// Unrecognized elements are skipped; chaining is best-effort and never
/// fails the finish.
pub fn output_work_units(
    data: &DataMap,
    now: DateTime<Utc>,
) -> Vec<(String, DataMap, WorkUnitMeta)> {
    let Some(output) = data.get("output") else {
        return Vec::new();
    };

    let mut units = Vec::new();
    match output {
        Value::List(items) | Value::Tuple(items) => {
            for item in items {
                if let Some(unit) = one_unit(item, now) {
                    units.push(unit);
                } else {
                    debug!("skipping unrecognized chained output element");
                }
            }
        }
        Value::Map(entries) => {
            for (name, value) in entries {
                let data = value.as_map().cloned().unwrap_or_default();
                units.push((name.clone(), data, WorkUnitMeta::default()));
            }
        }
        _ => debug!("chained output is neither a sequence nor a map"),
    }
    units
}

fn one_unit(item: &Value, now: DateTime<Utc>) -> Option<(String, DataMap, WorkUnitMeta)> {
    if let Some(name) = item.as_text() {
        return Some((name, DataMap::new(), WorkUnitMeta::default()));
    }
    let parts = item.as_sequence()?;
    let name = parts.first()?.as_text()?;
    let data = match parts.get(1) {
        Some(value) => value.as_map()?.clone(),
        None => DataMap::new(),
    };
    let mut meta = WorkUnitMeta::default();
    if let Some(meta_map) = parts.get(2).and_then(Value::as_map) {
        if let Some(priority) = meta_map.get("priority").and_then(Value::as_f64) {
            meta.priority = priority;
        }
        if let Some(delay) = meta_map.get("delay").and_then(Value::as_f64) {
            if delay > 0.0 {
                meta.not_before = Some(now + Duration::milliseconds((delay * 1000.0) as i64));
            }
        }
    }
    Some((name, data, meta))
}
