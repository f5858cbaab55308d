use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::observation::Observation;

/// Observed span of one feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureRange {
    pub min: f64,
    pub max: f64,
}

impl FeatureRange {
    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

/// Running min/max statistics that rescale each feature into `[0, 1]`.
///
/// Ranges only ever widen. `transform` reads the ranges as they stand and
/// `update` widens them, so a point is always scaled by statistics that
/// predate it as long as the two are called in that order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    ranges: BTreeMap<String, FeatureRange>,
    num_items: u64,
}

impl MinMaxScaler {
    pub fn new() -> Self {
        MinMaxScaler::default()
    }

    /// Scale `x` with the current ranges.
    ///
    /// A feature with zero spread maps to `0`. A feature never seen before has
    /// no range yet and passes through unchanged.
    pub fn transform(&self, x: &Observation) -> Observation {
        x.iter()
            .map(|(name, &value)| {
                let scaled = match self.ranges.get(name) {
                    Some(range) if range.width() > 0.0 => (value - range.min) / range.width(),
                    Some(_) => 0.0,
                    None => value,
                };
                (name.clone(), scaled)
            })
            .collect()
    }

    /// Widen the ranges to cover every finite value in `x`.
    pub fn update(&mut self, x: &Observation) {
        self.num_items += 1;
        for (name, &value) in x {
            if !value.is_finite() {
                continue;
            }
            let entry = self.ranges.entry(name.clone()).or_insert(FeatureRange {
                min: value,
                max: value,
            });
            if value < entry.min {
                entry.min = value;
            }
            if value > entry.max {
                entry.max = value;
            }
        }
    }

    pub fn range(&self, feature: &str) -> Option<FeatureRange> {
        self.ranges.get(feature).copied()
    }

    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.ranges.keys().map(String::as_str)
    }

    /// Number of observations folded into the ranges.
    pub fn count(&self) -> u64 {
        self.num_items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn obs(pairs: &[(&str, f64)]) -> Observation {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_unseen_feature_passes_through() {
        let scaler = MinMaxScaler::new();
        let x = scaler.transform(&obs(&[("fuel", 42.0)]));
        assert_eq!(x["fuel"], 42.0);
    }

    #[test]
    fn test_zero_spread_maps_to_zero() {
        let mut scaler = MinMaxScaler::new();
        scaler.update(&obs(&[("fuel", 5.0)]));
        let x = scaler.transform(&obs(&[("fuel", 100.0)]));
        assert_eq!(x["fuel"], 0.0);
    }

    #[test]
    fn test_transform_uses_current_range() {
        let mut scaler = MinMaxScaler::new();
        scaler.update(&obs(&[("fuel", 0.0)]));
        scaler.update(&obs(&[("fuel", 10.0)]));
        let x = scaler.transform(&obs(&[("fuel", 2.5)]));
        assert_eq!(x["fuel"], 0.25);
        // Outside the range is not clipped.
        let x = scaler.transform(&obs(&[("fuel", 20.0)]));
        assert_eq!(x["fuel"], 2.0);
    }

    #[test]
    fn test_transform_before_update_differs() {
        let mut scaler = MinMaxScaler::new();
        scaler.update(&obs(&[("fuel", 0.0)]));
        scaler.update(&obs(&[("fuel", 10.0)]));
        let point = obs(&[("fuel", 20.0)]);
        let before = scaler.transform(&point)["fuel"];
        scaler.update(&point);
        let after = scaler.transform(&point)["fuel"];
        assert_eq!(before, 2.0);
        assert_eq!(after, 1.0);
    }

    #[test]
    fn test_update_ignores_non_finite() {
        let mut scaler = MinMaxScaler::new();
        scaler.update(&obs(&[("fuel", 1.0), ("rpm", f64::NAN)]));
        assert!(scaler.range("rpm").is_none());
        assert_eq!(scaler.count(), 1);
    }

    proptest! {
        #[test]
        fn range_width_never_shrinks(values in prop::collection::vec(-1e6f64..1e6, 1..200)) {
            let mut scaler = MinMaxScaler::new();
            let mut last_width = 0.0;
            for v in values {
                scaler.update(&obs(&[("fuel", v)]));
                let width = scaler.range("fuel").unwrap().width();
                prop_assert!(width >= last_width);
                last_width = width;
            }
        }
    }
}
