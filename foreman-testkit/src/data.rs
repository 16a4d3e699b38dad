use chrono::{DateTime, Utc};
use foreman::{DataMap, Value};

/// Build a data map from literal pairs.
pub fn data(pairs: &[(&str, Value)]) -> DataMap {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

/// Build a work-spec data map: `name` plus any extra knobs.
pub fn spec_data(name: &str, pairs: &[(&str, Value)]) -> DataMap {
    let mut map = data(pairs);
    map.insert("name".to_string(), Value::from(name));
    map
}

/// Assert two instants are equal within a microsecond.
///
/// The SQL backend stores timestamps at microsecond resolution, so
/// round-tripped times can differ from their in-process originals by up to
/// 1µs.
pub fn assert_same_time(obtained: DateTime<Utc>, expected: DateTime<Utc>) {
    let delta = (obtained - expected)
        .num_microseconds()
        .unwrap_or(i64::MAX)
        .abs();
    assert!(
        delta <= 1,
        "times differ by {delta}us: obtained {obtained}, expected {expected}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn spec_data_carries_name() {
        let map = spec_data("s1", &[("priority", Value::Int(3))]);
        assert_eq!(map.get("name"), Some(&Value::from("s1")));
        assert_eq!(map.get("priority"), Some(&Value::Int(3)));
    }

    #[test]
    fn same_time_tolerates_sub_microsecond_skew() {
        let t = Utc::now();
        assert_same_time(t, t + Duration::nanoseconds(500));
    }

    #[test]
    #[should_panic(expected = "times differ")]
    fn same_time_rejects_larger_skew() {
        let t = Utc::now();
        assert_same_time(t, t + Duration::milliseconds(2));
    }
}
