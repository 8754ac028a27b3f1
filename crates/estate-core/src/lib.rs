//! Core domain model for listing ingestion: search targets, records and geo bounds.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "estate-core";

/// Canonical currency every normalized price is expressed in.
pub const CANONICAL_CURRENCY: &str = "VND";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RentOrBuy {
    Rent,
    #[default]
    Buy,
}

impl RentOrBuy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rent => "rent",
            Self::Buy => "buy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rent" => Some(Self::Rent),
            "buy" => Some(Self::Buy),
            _ => None,
        }
    }
}

impl fmt::Display for RentOrBuy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One search criterion. Immutable once expanded into listing URLs for a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub city: String,
    #[serde(rename = "propertyType")]
    pub property_type: String,
    #[serde(rename = "rentOrBuy", default)]
    pub rent_or_buy: RentOrBuy,
    #[serde(default)]
    pub radius: u32,
}

impl Target {
    /// Stable key used to label per-target work in logs and reports.
    pub fn mapping_key(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.city, self.rent_or_buy, self.property_type, self.radius
        )
        .replace(['-', ' '], "_")
        .to_lowercase()
    }
}

/// Normalized price. `amount` is expressed in billions of [`Price::currency`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: f64,
    pub currency: String,
}

impl Price {
    pub fn billions_vnd(amount: f64) -> Self {
        Self {
            amount,
            currency: CANONICAL_CURRENCY.to_string(),
        }
    }
}

/// Geographic bounding box outside of which coordinates are treated as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Default for GeoBounds {
    fn default() -> Self {
        Self {
            min_lat: 8.0,
            max_lat: 24.0,
            min_lon: 102.0,
            max_lon: 110.0,
        }
    }
}

impl GeoBounds {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat.is_finite()
            && lon.is_finite()
            && (self.min_lat..=self.max_lat).contains(&lat)
            && (self.min_lon..=self.max_lon).contains(&lon)
    }
}

/// Canonical unit of data. Two records with equal `identifier` describe the same listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub identifier: String,
    pub title: Option<String>,
    pub address: Option<String>,
    pub price: Option<Price>,
    pub area_sqm: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub source_url: String,
    pub collected_at: DateTime<Utc>,
    #[serde(default)]
    pub search: Option<Target>,
}

/// An ordered run-local collection of records; may contain repeated identifiers.
pub type Batch = Vec<Record>;

impl Record {
    /// Fields counted by completeness and by the deduplicator's representative choice.
    pub const REQUIRED_FIELDS: [&'static str; 6] =
        ["title", "address", "price", "area", "latitude", "longitude"];

    pub fn new(
        identifier: impl Into<String>,
        source_url: impl Into<String>,
        collected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            title: None,
            address: None,
            price: None,
            area_sqm: None,
            latitude: None,
            longitude: None,
            source_url: source_url.into(),
            collected_at,
            search: None,
        }
    }

    pub fn non_null_required_fields(&self) -> usize {
        [
            self.title.is_some(),
            self.address.is_some(),
            self.price.is_some(),
            self.area_sqm.is_some(),
            self.latitude.is_some(),
            self.longitude.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }

    /// Coordinate pair, only when both halves are present.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap()
    }

    #[test]
    fn target_deserializes_from_camel_case_payload() {
        let target: Target = serde_json::from_str(
            r#"{"city":"ha-noi","propertyType":"nha-rieng","rentOrBuy":"rent","radius":5}"#,
        )
        .unwrap();
        assert_eq!(target.property_type, "nha-rieng");
        assert_eq!(target.rent_or_buy, RentOrBuy::Rent);
        assert_eq!(target.mapping_key(), "ha_noi_rent_nha_rieng_5");
    }

    #[test]
    fn bounds_reject_out_of_box_and_nan() {
        let bounds = GeoBounds::default();
        assert!(bounds.contains(21.0285, 105.8542));
        assert!(bounds.contains(8.0, 110.0));
        assert!(!bounds.contains(48.85, 2.35));
        assert!(!bounds.contains(f64::NAN, 105.0));
    }

    #[test]
    fn completeness_counts_only_required_fields() {
        let mut record = Record::new("abc", "https://example.test/a-pid1.html", ts());
        assert_eq!(record.non_null_required_fields(), 0);
        record.title = Some("Nha pho".into());
        record.price = Some(Price::billions_vnd(2.5));
        record.latitude = Some(21.0);
        assert_eq!(record.non_null_required_fields(), 3);
        assert_eq!(record.coordinates(), None);
        record.longitude = Some(105.8);
        assert_eq!(record.coordinates(), Some((21.0, 105.8)));
    }
}
