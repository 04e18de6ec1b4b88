//! Running per-user metric totals.
//!
//! Keys are `group.name` (`creator.originality_score`). The store adds
//! engine deltas in place; this is the read side handed to engines and
//! reporting.

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetricTotals {
    totals: BTreeMap<String, f64>,
}

impl MetricTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> f64 {
        self.totals.get(key).copied().unwrap_or(0.0)
    }

    /// Totals nested by group: `{"creator": {"originality_score": 2.0}}`.
    /// Keys without a dot land in the `other` group.
    pub fn by_group(&self) -> BTreeMap<String, BTreeMap<String, f64>> {
        let mut groups: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for (key, value) in &self.totals {
            let (group, name) = key.split_once('.').unwrap_or(("other", key.as_str()));
            groups
                .entry(group.to_string())
                .or_default()
                .insert(name.to_string(), *value);
        }
        groups
    }

    pub fn into_map(self) -> BTreeMap<String, f64> {
        self.totals
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

impl FromIterator<(String, f64)> for MetricTotals {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self {
            totals: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_reads_zero() {
        let totals: MetricTotals = [("creator.originality_score".to_string(), 3.0)]
            .into_iter()
            .collect();
        assert_eq!(totals.get("creator.originality_score"), 3.0);
        assert_eq!(totals.get("missing.key"), 0.0);
        assert_eq!(totals.len(), 1);
        assert!(MetricTotals::new().is_empty());
    }

    #[test]
    fn test_by_group() {
        let totals: MetricTotals = [
            ("creator.originality_score".to_string(), 2.0),
            ("creator.weekly_artwork_uploads".to_string(), 1.5),
            ("karma".to_string(), 4.0),
        ]
        .into_iter()
        .collect();
        let groups = totals.by_group();
        assert_eq!(groups["creator"].len(), 2);
        assert_eq!(groups["other"]["karma"], 4.0);
    }
}
