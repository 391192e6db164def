//! Trend computation for propagated events (spec.md §4.10).
//!
//! A real deployment would read recent history from a time-series buffer
//! per metric; without one, direction is stubbed to `stable` against the
//! current value, which this crate always has from `matched_values`.

use crate::types::{MatchedValue, PrecursorSignal, TrendDirection, TrendSpec};
use std::collections::BTreeMap;

pub fn compute_trends(specs: &[TrendSpec], matched_values: &BTreeMap<String, MatchedValue>) -> Vec<PrecursorSignal> {
    specs
        .iter()
        .filter_map(|spec| {
            matched_values.get(&spec.metric_name).map(|matched| PrecursorSignal {
                metric_name: spec.metric_name.clone(),
                value: matched.value.clone(),
                unit: spec.unit.clone().or_else(|| matched.unit.clone()),
                direction: TrendDirection::Stable,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn computes_trend_for_present_metric() {
        let mut matched = BTreeMap::new();
        matched.insert(
            "temp".to_string(),
            MatchedValue { value: serde_json::json!(85), unit: Some("C".to_string()), timestamp: Utc::now() },
        );
        let specs = vec![TrendSpec { metric_name: "temp".to_string(), unit: None }];
        let trends = compute_trends(&specs, &matched);
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].value, serde_json::json!(85));
        assert_eq!(trends[0].unit.as_deref(), Some("C"));
        assert!(matches!(trends[0].direction, TrendDirection::Stable));
    }

    #[test]
    fn skips_metrics_without_a_matched_value() {
        let matched = BTreeMap::new();
        let specs = vec![TrendSpec { metric_name: "vib".to_string(), unit: None }];
        assert!(compute_trends(&specs, &matched).is_empty());
    }
}
