//! The graded outcome of applying a pattern or a composite matcher.

use crate::common::data::SubEvent;
use serde::{Deserialize, Serialize};

/// Outcome of a single match operation: an exactness verdict plus a
/// normalized distance in `[0.0, 1.0]` (`0.0` = exact) and any diagnostic
/// sub-events collected along the way.
///
/// Exactness is carried as an explicit flag rather than derived from the
/// distance: rounding can collapse a small non-zero distance to `0.0`, and
/// aggregation must stay able to tell "all constituents matched" apart from
/// "the misses were individually negligible".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    exact: bool,
    distance: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    sub_events: Vec<SubEvent>,
}

impl MatchResult {
    pub fn exact_match() -> Self {
        Self {
            exact: true,
            distance: 0.0,
            sub_events: Vec::new(),
        }
    }

    pub fn no_match() -> Self {
        Self::partial_match(1.0)
    }

    /// A miss with a graded distance. The distance is clamped to `[0, 1]`.
    pub fn partial_match(distance: f64) -> Self {
        Self {
            exact: false,
            distance: distance.clamp(0.0, 1.0),
            sub_events: Vec::new(),
        }
    }

    pub fn with_sub_event(mut self, event: SubEvent) -> Self {
        self.sub_events.push(event);
        self
    }

    pub fn is_exact_match(&self) -> bool {
        self.exact
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn sub_events(&self) -> &[SubEvent] {
        &self.sub_events
    }

    pub fn take_sub_events(self) -> Vec<SubEvent> {
        self.sub_events
    }

    /// Combines results with uniform weights.
    pub fn aggregate(results: Vec<MatchResult>) -> MatchResult {
        Self::aggregate_weighted(results.into_iter().map(|r| Weighted::new(r, 1.0)).collect())
    }

    /// Weighted aggregation: the result is exact iff every constituent is
    /// exact, and the distance is the weight-normalized sum of the
    /// constituent distances. Monotonic in every constituent distance.
    pub fn aggregate_weighted(results: Vec<Weighted>) -> MatchResult {
        if results.is_empty() {
            return MatchResult::exact_match();
        }

        let exact = results.iter().all(|w| w.result.exact);
        let total_weight: f64 = results.iter().map(|w| w.weight).sum();

        let distance = if total_weight <= 0.0 {
            0.0
        } else {
            results
                .iter()
                .map(|w| w.weight * w.result.distance)
                .sum::<f64>()
                / total_weight
        };

        let sub_events = results
            .into_iter()
            .flat_map(|w| w.result.sub_events)
            .collect();

        MatchResult {
            exact,
            distance: distance.clamp(0.0, 1.0),
            sub_events,
        }
    }
}

/// A match result paired with the weight it contributes to an aggregate.
#[derive(Debug, Clone)]
pub struct Weighted {
    pub result: MatchResult,
    pub weight: f64,
}

impl Weighted {
    pub fn new(result: MatchResult, weight: f64) -> Self {
        Self { result, weight }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aggregate_is_exact_iff_all_constituents_are() {
        let all_exact = MatchResult::aggregate(vec![
            MatchResult::exact_match(),
            MatchResult::exact_match(),
        ]);
        assert!(all_exact.is_exact_match());
        assert_eq!(all_exact.distance(), 0.0);

        let one_miss = MatchResult::aggregate(vec![
            MatchResult::exact_match(),
            MatchResult::partial_match(0.5),
        ]);
        assert!(!one_miss.is_exact_match());
        assert!(one_miss.distance() > 0.0);
    }

    #[test]
    fn weights_shift_the_aggregate() {
        let heavy_miss = MatchResult::aggregate_weighted(vec![
            Weighted::new(MatchResult::partial_match(1.0), 10.0),
            Weighted::new(MatchResult::exact_match(), 1.0),
        ]);
        let light_miss = MatchResult::aggregate_weighted(vec![
            Weighted::new(MatchResult::partial_match(1.0), 1.0),
            Weighted::new(MatchResult::exact_match(), 10.0),
        ]);
        assert!(heavy_miss.distance() > light_miss.distance());
    }

    #[test]
    fn aggregate_is_monotonic_in_constituent_distance() {
        let distances = [0.0, 0.1, 0.25, 0.5, 0.75, 1.0];
        let weights = [1.0, 3.0, 10.0];

        for &w in &weights {
            let mut previous = -1.0;
            for &d in &distances {
                let aggregate = MatchResult::aggregate_weighted(vec![
                    Weighted::new(MatchResult::partial_match(d), w),
                    Weighted::new(MatchResult::partial_match(0.3), 2.0),
                ]);
                assert!(
                    aggregate.distance() >= previous,
                    "aggregate decreased when constituent grew (w={}, d={})",
                    w,
                    d
                );
                previous = aggregate.distance();
            }
        }
    }

    #[test]
    fn sub_events_survive_aggregation() {
        let with_event = MatchResult::no_match()
            .with_sub_event(crate::common::data::SubEvent::warning("missed"));
        let aggregate = MatchResult::aggregate(vec![MatchResult::exact_match(), with_event]);
        assert_eq!(aggregate.sub_events().len(), 1);
    }

    #[test]
    fn empty_aggregate_is_exact() {
        assert!(MatchResult::aggregate(Vec::new()).is_exact_match());
    }
}
