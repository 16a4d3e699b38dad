//! Work-spec selection and lease arithmetic.
//!
//! Both backends gather [`WorkSpecMeta`] snapshots (with counts) for every
//! spec in a namespace and delegate the actual choice to this module, so
//! the scheduling policy cannot diverge between them. Selection is: highest
//! priority wins outright; ties are broken weighted-random by weight; the
//! candidate walk is in name order, so a fixed RNG seed reproduces the same
//! sequence of choices.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::api::AttemptRequest;
use crate::meta::WorkSpecMeta;

/// Whether one spec can serve the given request right now.
fn is_candidate(meta: &WorkSpecMeta, request: &AttemptRequest, now: DateTime<Utc>) -> bool {
    if meta.paused || meta.weight <= 0 {
        return false;
    }
    if let Some(available_gb) = request.available_gb {
        if meta.min_memory_gb > available_gb {
            return false;
        }
    }
    if !request.runtimes.is_empty()
        && !meta.runtime.is_empty()
        && !request.runtimes.iter().any(|r| *r == meta.runtime)
    {
        return false;
    }
    if meta.max_running > 0 && meta.pending_count >= meta.max_running {
        return false;
    }
    meta.available_count > 0 || continuous_due(meta, now)
}

/// A continuous spec may synthesize a unit once its interval has elapsed.
pub fn continuous_due(meta: &WorkSpecMeta, now: DateTime<Utc>) -> bool {
    meta.continuous && meta.next_continuous.map_or(true, |next| next <= now)
}

/// Choose the work spec to lease from, or `None` when no spec can serve the
/// request. `metas` must carry counts.
pub fn choose_work_spec<'a, R: Rng>(
    metas: &'a BTreeMap<String, WorkSpecMeta>,
    request: &AttemptRequest,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Option<&'a str> {
    let candidates: Vec<(&str, &WorkSpecMeta)> = metas
        .iter()
        .filter(|(_, meta)| is_candidate(meta, request, now))
        .map(|(name, meta)| (name.as_str(), meta))
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let best = candidates.iter().map(|(_, m)| m.priority).max()?;
    let tied: Vec<(&str, &WorkSpecMeta)> = candidates
        .into_iter()
        .filter(|(_, m)| m.priority == best)
        .collect();

    // BTreeMap iteration already sorted the tie group by name, so the
    // cumulative-weight walk is deterministic for a fixed draw.
    let total: u64 = tied.iter().map(|(_, m)| m.weight as u64).sum();
    let mut draw = rng.gen_range(0..total);
    for (name, meta) in &tied {
        let weight = meta.weight as u64;
        if draw < weight {
            return Some(name);
        }
        draw -= weight;
    }
    tied.last().map(|(name, _)| *name)
}

/// How many attempts one lease request may create on the chosen spec,
/// before capping by the units actually available.
pub fn lease_budget(meta: &WorkSpecMeta, requested: usize) -> usize {
    let mut budget = requested;
    if meta.max_attempts_returned > 0 {
        budget = budget.min(meta.max_attempts_returned);
    }
    if meta.max_running > 0 {
        budget = budget.min(meta.max_running.saturating_sub(meta.pending_count));
    }
    budget
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn meta(priority: i32, weight: i32, available: usize) -> WorkSpecMeta {
        WorkSpecMeta {
            priority,
            weight,
            available_count: available,
            ..Default::default()
        }
    }

    fn metas(entries: Vec<(&str, WorkSpecMeta)>) -> BTreeMap<String, WorkSpecMeta> {
        entries
            .into_iter()
            .map(|(name, m)| (name.to_string(), m))
            .collect()
    }

    #[test]
    fn highest_priority_wins_outright() {
        let metas = metas(vec![
            ("s1", meta(1, 20, 5)),
            ("s2", meta(2, 1, 5)),
            ("s3", meta(0, 1000, 5)),
        ]);
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..20 {
            let request = AttemptRequest::default();
            assert_eq!(
                choose_work_spec(&metas, &request, Utc::now(), &mut rng),
                Some("s2")
            );
        }
    }

    #[test]
    fn paused_zero_weight_and_drained_specs_are_excluded() {
        let mut paused = meta(5, 20, 5);
        paused.paused = true;
        let metas = metas(vec![
            ("drained", meta(3, 20, 0)),
            ("paused", paused),
            ("weightless", meta(3, 0, 5)),
            ("negative", meta(3, -2, 5)),
            ("ok", meta(1, 20, 5)),
        ]);
        let mut rng = StdRng::seed_from_u64(1);
        let request = AttemptRequest::default();
        assert_eq!(
            choose_work_spec(&metas, &request, Utc::now(), &mut rng),
            Some("ok")
        );
    }

    #[test]
    fn max_running_cap_excludes_saturated_specs() {
        let mut saturated = meta(9, 20, 50);
        saturated.max_running = 3;
        saturated.pending_count = 3;
        let metas = metas(vec![("hot", saturated), ("cold", meta(0, 20, 1))]);
        let mut rng = StdRng::seed_from_u64(2);
        let request = AttemptRequest::default();
        assert_eq!(
            choose_work_spec(&metas, &request, Utc::now(), &mut rng),
            Some("cold")
        );
    }

    #[test]
    fn memory_and_runtime_filters() {
        let mut heavy = meta(9, 20, 5);
        heavy.min_memory_gb = 8.0;
        let mut tagged = meta(9, 20, 5);
        tagged.runtime = "python_gil".to_string();
        let metas = metas(vec![
            ("heavy", heavy),
            ("tagged", tagged),
            ("plain", meta(1, 20, 5)),
        ]);
        let mut rng = StdRng::seed_from_u64(3);

        let request = AttemptRequest {
            available_gb: Some(4.0),
            runtimes: vec!["go".to_string()],
            ..Default::default()
        };
        // heavy needs more memory, tagged needs a runtime the worker lacks
        assert_eq!(
            choose_work_spec(&metas, &request, Utc::now(), &mut rng),
            Some("plain")
        );

        let request = AttemptRequest {
            runtimes: vec!["python_gil".to_string()],
            ..Default::default()
        };
        assert_eq!(
            choose_work_spec(&metas, &request, Utc::now(), &mut rng),
            Some("tagged")
        );
    }

    #[test]
    fn continuous_spec_is_a_candidate_only_when_due() {
        let now = Utc::now();
        let mut due = meta(0, 20, 0);
        due.continuous = true;
        due.next_continuous = Some(now - chrono::Duration::seconds(1));
        let mut not_due = meta(0, 20, 0);
        not_due.continuous = true;
        not_due.next_continuous = Some(now + chrono::Duration::seconds(60));

        let request = AttemptRequest::default();
        let mut rng = StdRng::seed_from_u64(4);
        let only_due = metas(vec![("due", due)]);
        assert_eq!(
            choose_work_spec(&only_due, &request, now, &mut rng),
            Some("due")
        );
        let only_not_due = metas(vec![("later", not_due)]);
        assert_eq!(
            choose_work_spec(&only_not_due, &request, now, &mut rng),
            None
        );
    }

    #[test]
    fn weighted_draw_is_seed_deterministic_and_roughly_fair() {
        let metas = metas(vec![("a", meta(0, 30, 5)), ("b", meta(0, 10, 5))]);
        let request = AttemptRequest::default();

        let draws = |seed: u64| -> Vec<String> {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..400)
                .map(|_| {
                    choose_work_spec(&metas, &request, Utc::now(), &mut rng)
                        .unwrap()
                        .to_string()
                })
                .collect()
        };

        assert_eq!(draws(42), draws(42));

        let picks = draws(42);
        let a = picks.iter().filter(|p| *p == "a").count();
        // expectation 300 of 400; allow generous slack
        assert!((250..=350).contains(&a), "a chosen {a} times");
    }

    #[test]
    fn lease_budget_caps() {
        let mut m = meta(0, 20, 100);
        assert_eq!(lease_budget(&m, 10), 10);
        m.max_attempts_returned = 4;
        assert_eq!(lease_budget(&m, 10), 4);
        m.max_running = 5;
        m.pending_count = 3;
        assert_eq!(lease_budget(&m, 10), 2);
        m.pending_count = 5;
        assert_eq!(lease_budget(&m, 10), 0);
    }
}
