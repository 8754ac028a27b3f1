//! Data quality gate run on the pre-merge batch and on committed snapshots.

use std::collections::HashSet;
use std::fmt;

use estate_core::{GeoBounds, Record};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub completeness: f64,
    pub duplicate: f64,
    pub price_validity: f64,
    pub coordinate_validity: f64,
    /// Largest shortfall on any metric that still yields WARN instead of FAIL.
    pub warn_margin: f64,
    /// Plausible price range, billions of VND.
    pub price_min: f64,
    pub price_max: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            completeness: 0.90,
            duplicate: 0.05,
            price_validity: 0.80,
            coordinate_validity: 0.80,
            warn_margin: 0.05,
            price_min: 0.05,
            price_max: 500.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricMiss {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub shortfall: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub records: usize,
    pub completeness: f64,
    pub duplicate_ratio: f64,
    pub price_validity: f64,
    pub coordinate_validity: f64,
    pub verdict: Verdict,
    pub misses: Vec<MetricMiss>,
}

impl QualityReport {
    pub fn describe_misses(&self) -> String {
        if self.misses.is_empty() {
            return "all metrics within thresholds".to_string();
        }
        self.misses
            .iter()
            .map(|m| format!("{} {:.4} vs {:.4}", m.metric, m.value, m.threshold))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Fraction of `matching` among `considered`; an empty denominator counts as fully valid.
fn ratio(matching: usize, considered: usize) -> f64 {
    if considered == 0 {
        1.0
    } else {
        matching as f64 / considered as f64
    }
}

#[derive(Debug, Clone)]
pub struct QualityGate {
    thresholds: QualityThresholds,
    bounds: GeoBounds,
}

impl QualityGate {
    pub fn new(thresholds: QualityThresholds, bounds: GeoBounds) -> Self {
        Self { thresholds, bounds }
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// Score a batch before deduplication so the duplicate ratio reflects what was fetched.
    pub fn evaluate(&self, records: &[Record]) -> QualityReport {
        self.evaluate_fetched(records, 0)
    }

    /// Like [`QualityGate::evaluate`], for a batch whose repeated listing links were
    /// already skipped before detail fetching. Each skipped link counts as one more
    /// duplicate row; the other metrics only see `records`.
    pub fn evaluate_fetched(&self, records: &[Record], skipped_repeats: usize) -> QualityReport {
        let present: usize = records.iter().map(Record::non_null_required_fields).sum();
        let completeness = ratio(present, Record::REQUIRED_FIELDS.len() * records.len());

        let unique = records
            .iter()
            .map(|r| r.identifier.as_str())
            .collect::<HashSet<_>>()
            .len();
        let total = records.len() + skipped_repeats;
        let duplicate_ratio = if total == 0 {
            0.0
        } else {
            (total - unique) as f64 / total as f64
        };

        let prices: Vec<f64> = records
            .iter()
            .filter_map(|r| r.price.as_ref().map(|p| p.amount))
            .collect();
        let valid_prices = prices
            .iter()
            .filter(|p| {
                p.is_finite() && **p >= self.thresholds.price_min && **p <= self.thresholds.price_max
            })
            .count();
        let price_validity = ratio(valid_prices, prices.len());

        let pairs: Vec<(f64, f64)> = records.iter().filter_map(Record::coordinates).collect();
        let valid_pairs = pairs
            .iter()
            .filter(|(lat, lon)| self.bounds.contains(*lat, *lon))
            .count();
        let coordinate_validity = ratio(valid_pairs, pairs.len());

        let t = &self.thresholds;
        let mut misses = Vec::new();
        let mut check = |metric: &str, value: f64, threshold: f64, at_least: bool| {
            let shortfall = if at_least {
                threshold - value
            } else {
                value - threshold
            };
            if shortfall > 0.0 {
                misses.push(MetricMiss {
                    metric: metric.to_string(),
                    value,
                    threshold,
                    shortfall,
                });
            }
        };
        check("completeness", completeness, t.completeness, true);
        check("duplicate_ratio", duplicate_ratio, t.duplicate, false);
        check("price_validity", price_validity, t.price_validity, true);
        check("coordinate_validity", coordinate_validity, t.coordinate_validity, true);

        let verdict = if misses.is_empty() {
            Verdict::Pass
        } else if misses.iter().all(|m| m.shortfall <= t.warn_margin) {
            Verdict::Warn
        } else {
            Verdict::Fail
        };

        QualityReport {
            records: records.len(),
            completeness,
            duplicate_ratio,
            price_validity,
            coordinate_validity,
            verdict,
            misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use estate_core::Price;

    fn full(id: usize) -> Record {
        let mut r = Record::new(
            format!("{id:016x}"),
            format!("https://nhadat247.com.vn/x-pid{id}.html"),
            Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
        );
        r.title = Some("Nhà".into());
        r.address = Some("Hà Nội".into());
        r.price = Some(Price::billions_vnd(3.2));
        r.area_sqm = Some(60.0);
        r.latitude = Some(21.0);
        r.longitude = Some(105.8);
        r
    }

    /// `n` complete records with `missing` required fields blanked (titles, then addresses).
    fn batch_missing(n: usize, missing: usize) -> Vec<Record> {
        let mut records: Vec<Record> = (0..n).map(full).collect();
        for i in 0..missing {
            let r = &mut records[i % n];
            if r.title.is_some() {
                r.title = None;
            } else {
                r.address = None;
            }
        }
        records
    }

    fn gate(warn_margin: f64) -> QualityGate {
        QualityGate::new(
            QualityThresholds {
                warn_margin,
                ..QualityThresholds::default()
            },
            GeoBounds::default(),
        )
    }

    #[test]
    fn completeness_exactly_at_threshold_passes() {
        // 10 records × 6 fields, 6 blanks → 54/60 = 0.90.
        let report = gate(0.05).evaluate(&batch_missing(10, 6));
        assert_eq!(report.completeness, 0.90);
        assert_eq!(report.verdict, Verdict::Pass);
    }

    #[test]
    fn completeness_just_below_threshold_warns_or_fails_by_margin() {
        // 1000 records × 6 fields, 606 blanks → 5394/6000 = 0.899.
        let batch = batch_missing(1000, 606);
        let warned = gate(0.05).evaluate(&batch);
        assert!((warned.completeness - 0.899).abs() < 1e-12);
        assert_eq!(warned.verdict, Verdict::Warn);
        assert_eq!(warned.misses.len(), 1);
        assert_eq!(warned.misses[0].metric, "completeness");

        assert_eq!(gate(0.0).evaluate(&batch).verdict, Verdict::Fail);
    }

    #[test]
    fn large_miss_fails() {
        let report = gate(0.05).evaluate(&batch_missing(10, 20));
        assert_eq!(report.verdict, Verdict::Fail);
    }

    #[test]
    fn duplicate_ratio_is_measured_on_the_raw_batch() {
        let mut batch: Vec<Record> = (0..20).map(full).collect();
        batch.push(full(0));
        let report = gate(0.05).evaluate(&batch);
        assert!((report.duplicate_ratio - (1.0 - 20.0 / 21.0)).abs() < 1e-12);
        assert_eq!(report.verdict, Verdict::Pass);

        // 2 of 22 repeated: ratio ≈ 0.091, within the warn margin of 0.05.
        batch.push(full(1));
        let report = gate(0.05).evaluate(&batch);
        assert!(report.duplicate_ratio > 0.05);
        assert_eq!(report.verdict, Verdict::Warn);
    }

    /// `total` records of which `repeats` reuse an identifier already in the batch.
    fn batch_with_repeats(total: usize, repeats: usize) -> Vec<Record> {
        let mut batch: Vec<Record> = (0..total - repeats).map(full).collect();
        batch.extend((0..repeats).map(full));
        batch
    }

    #[test]
    fn duplicate_ratio_exactly_at_threshold_passes() {
        // 1 of 20 repeated → 0.05.
        let report = gate(0.05).evaluate(&batch_with_repeats(20, 1));
        assert_eq!(report.duplicate_ratio, 0.05);
        assert!(report.misses.is_empty());
        assert_eq!(report.verdict, Verdict::Pass);
    }

    #[test]
    fn duplicate_ratio_just_above_threshold_warns_or_fails_by_margin() {
        // 51 of 1000 repeated → 0.051.
        let batch = batch_with_repeats(1000, 51);
        let warned = gate(0.05).evaluate(&batch);
        assert!((warned.duplicate_ratio - 0.051).abs() < 1e-12);
        assert_eq!(warned.verdict, Verdict::Warn);
        assert_eq!(warned.misses[0].metric, "duplicate_ratio");

        assert_eq!(gate(0.0).evaluate(&batch).verdict, Verdict::Fail);
    }

    #[test]
    fn price_validity_at_and_just_below_threshold() {
        let mut at = batch_missing(10, 0);
        for r in at.iter_mut().take(2) {
            r.price = Some(Price::billions_vnd(9_000.0));
        }
        let report = gate(0.05).evaluate(&at);
        assert_eq!(report.price_validity, 0.80);
        assert_eq!(report.verdict, Verdict::Pass);

        let mut below = batch_missing(1000, 0);
        for r in below.iter_mut().take(201) {
            r.price = Some(Price::billions_vnd(0.001));
        }
        let warned = gate(0.05).evaluate(&below);
        assert!((warned.price_validity - 0.799).abs() < 1e-12);
        assert_eq!(warned.verdict, Verdict::Warn);
        assert_eq!(warned.misses[0].metric, "price_validity");
        assert_eq!(gate(0.0).evaluate(&below).verdict, Verdict::Fail);
    }

    #[test]
    fn coordinate_validity_at_and_just_below_threshold() {
        let mut at = batch_missing(10, 0);
        for r in at.iter_mut().take(2) {
            r.latitude = Some(48.85);
            r.longitude = Some(2.35);
        }
        let report = gate(0.05).evaluate(&at);
        assert_eq!(report.coordinate_validity, 0.80);
        assert_eq!(report.verdict, Verdict::Pass);

        let mut below = batch_missing(1000, 0);
        for r in below.iter_mut().take(201) {
            r.latitude = Some(48.85);
            r.longitude = Some(2.35);
        }
        let warned = gate(0.05).evaluate(&below);
        assert!((warned.coordinate_validity - 0.799).abs() < 1e-12);
        assert_eq!(warned.verdict, Verdict::Warn);
        assert_eq!(warned.misses[0].metric, "coordinate_validity");
        assert_eq!(gate(0.0).evaluate(&below).verdict, Verdict::Fail);
    }

    #[test]
    fn skipped_repeat_links_count_as_duplicates() {
        let batch: Vec<Record> = (0..19).map(full).collect();
        let report = gate(0.05).evaluate_fetched(&batch, 1);
        assert_eq!(report.records, 19);
        assert_eq!(report.duplicate_ratio, 0.05);
        assert_eq!(report.verdict, Verdict::Pass);

        let report = gate(0.05).evaluate_fetched(&batch, 19);
        assert_eq!(report.duplicate_ratio, 0.5);
        assert_eq!(report.verdict, Verdict::Fail);
    }

    #[test]
    fn price_and_coordinate_validity_ignore_nulls() {
        let mut batch: Vec<Record> = (0..10).map(full).collect();
        batch[0].price = Some(Price::billions_vnd(9_000.0));
        batch[1].price = None;
        batch[2].latitude = Some(48.85);
        batch[2].longitude = Some(2.35);
        batch[3].longitude = None;

        let report = gate(0.05).evaluate(&batch);
        assert!((report.price_validity - 8.0 / 9.0).abs() < 1e-12);
        assert!((report.coordinate_validity - 8.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn absent_values_do_not_penalize() {
        let mut batch: Vec<Record> = (0..10).map(full).collect();
        for r in &mut batch {
            r.price = None;
        }
        let report = gate(0.05).evaluate(&batch);
        assert_eq!(report.price_validity, 1.0);

        let empty = gate(0.05).evaluate(&[]);
        assert_eq!(empty.verdict, Verdict::Pass);
        assert_eq!(empty.duplicate_ratio, 0.0);
    }
}
