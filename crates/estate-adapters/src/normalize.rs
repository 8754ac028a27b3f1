//! Raw listing → canonical [`Record`] conversion and URL-derived identity.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use estate_core::{GeoBounds, Price, Record, Target};
use estate_storage::sha256_hex;
use regex::Regex;
use url::Url;

use crate::{AdapterError, RawListing};

static NUMBER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d+)*").unwrap());

const IDENTIFIER_LEN: usize = 16;

/// Canonical form of a listing URL: absolute, `https:` for protocol-relative links,
/// lowercase host, no fragment, no trailing slash. Non-http links yield `None`.
pub fn normalize_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let href = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let mut url = Url::parse(base).ok()?.join(&href).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    if let Some(host) = url.host_str().map(str::to_lowercase) {
        url.set_host(Some(&host)).ok()?;
    }
    let mut out = url.to_string();
    if url.query().is_none() && out.ends_with('/') {
        out.pop();
    }
    Some(out)
}

/// Stable identifier derived from an already-normalized URL.
pub fn identifier_for(normalized_url: &str) -> String {
    let mut digest = sha256_hex(normalized_url.as_bytes());
    digest.truncate(IDENTIFIER_LEN);
    digest
}

/// Parse a numeric token using `,`/`.` as either decimal or grouping separators.
/// Repeated separators of one kind group thousands; a single separator followed by
/// exactly three digits groups thousands too; anything else is a decimal mark.
fn parse_number(token: &str) -> Option<f64> {
    let has_dot = token.contains('.');
    let has_comma = token.contains(',');
    let cleaned = if has_dot && has_comma {
        let decimal = if token.rfind('.') > token.rfind(',') { '.' } else { ',' };
        let (int_part, frac) = token.rsplit_once(decimal)?;
        let int_digits: String = int_part.chars().filter(char::is_ascii_digit).collect();
        format!("{int_digits}.{frac}")
    } else if has_dot || has_comma {
        let sep = if has_dot { '.' } else { ',' };
        let parts: Vec<&str> = token.split(sep).collect();
        if parts.len() > 2 || parts[1].len() == 3 {
            parts.concat()
        } else {
            parts.join(".")
        }
    } else {
        token.to_string()
    };
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn first_number(text: &str) -> Option<(f64, &str)> {
    let m = NUMBER_TOKEN.find(text)?;
    Some((parse_number(m.as_str())?, &text[m.end()..]))
}

/// Free-text price → billions of VND. Unitless numbers are raw VND.
/// Negotiable ("thỏa thuận") and unparseable prices are `None`, never zero.
pub fn normalize_price(text: &str) -> Option<Price> {
    let lower = text.trim().to_lowercase();
    if lower.is_empty()
        || lower.contains("thỏa thuận")
        || lower.contains("thoả thuận")
        || lower.contains("thoa thuan")
    {
        return None;
    }
    let (value, rest) = first_number(&lower)?;
    let unit = rest.trim_start();
    let billions = if unit.starts_with("tỷ") || unit.starts_with("tỉ") || unit.starts_with("ty") {
        value
    } else if unit.starts_with("triệu") || unit.starts_with("tr") {
        value / 1_000.0
    } else if unit.starts_with("nghìn") || unit.starts_with("ngàn") || unit.starts_with('k') {
        value / 1_000_000.0
    } else {
        value / 1_000_000_000.0
    };
    Some(Price::billions_vnd(billions))
}

/// Free-text area → square meters. Hectares are converted; anything else is read as m².
pub fn normalize_area(text: &str) -> Option<f64> {
    let lower = text.trim().to_lowercase();
    let (value, rest) = first_number(&lower)?;
    let unit = rest.trim_start();
    if unit.starts_with("ha") || unit.starts_with("hecta") {
        Some(value * 10_000.0)
    } else {
        Some(value)
    }
}

/// First candidate pair that lands inside `bounds`, swapping lon/lat when only the
/// reversed order fits. Out-of-box candidates are discarded, never clamped.
pub fn pick_coordinates(candidates: &[(f64, f64)], bounds: &GeoBounds) -> Option<(f64, f64)> {
    candidates.iter().find_map(|&(a, b)| {
        if bounds.contains(a, b) {
            Some((a, b))
        } else if bounds.contains(b, a) {
            Some((b, a))
        } else {
            None
        }
    })
}

pub fn normalize(
    raw: &RawListing,
    base_url: &str,
    bounds: &GeoBounds,
    collected_at: DateTime<Utc>,
    search: Option<Target>,
) -> Result<Record, AdapterError> {
    let source_url = normalize_url(base_url, &raw.url)
        .ok_or_else(|| AdapterError::Message(format!("unusable listing url {:?}", raw.url)))?;
    let mut record = Record::new(identifier_for(&source_url), source_url, collected_at);
    record.title = raw.title.clone().filter(|t| !t.trim().is_empty());
    record.address = raw.address.clone().filter(|a| !a.trim().is_empty());
    record.price = raw.price_text.as_deref().and_then(normalize_price);
    record.area_sqm = raw.area_text.as_deref().and_then(normalize_area);
    if let Some((lat, lon)) = pick_coordinates(&raw.coordinate_candidates, bounds) {
        record.latitude = Some(lat);
        record.longitude = Some(lon);
    }
    record.search = search;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const BASE: &str = "https://nhadat247.com.vn/";

    fn approx(actual: Option<f64>, expected: f64) {
        let actual = actual.expect("value present");
        assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
    }

    #[test]
    fn urls_normalize_to_one_canonical_form() {
        let expected = "https://nhadat247.com.vn/ban-nha-pid1.html";
        for href in [
            "/ban-nha-pid1.html",
            "ban-nha-pid1.html",
            "//nhadat247.com.vn/ban-nha-pid1.html",
            "https://NHADAT247.com.vn/ban-nha-pid1.html#photos",
            "  https://nhadat247.com.vn/ban-nha-pid1.html  ",
        ] {
            assert_eq!(normalize_url(BASE, href).as_deref(), Some(expected), "{href}");
        }
        assert_eq!(
            normalize_url(BASE, "https://nhadat247.com.vn/du-an/").as_deref(),
            Some("https://nhadat247.com.vn/du-an")
        );
        assert_eq!(normalize_url(BASE, "javascript:void(0)"), None);
        assert_eq!(normalize_url(BASE, ""), None);
    }

    #[test]
    fn identifier_is_deterministic_and_url_sensitive() {
        let a = identifier_for("https://nhadat247.com.vn/ban-nha-pid1.html");
        assert_eq!(a.len(), 16);
        assert_eq!(a, identifier_for("https://nhadat247.com.vn/ban-nha-pid1.html"));
        assert_ne!(a, identifier_for("https://nhadat247.com.vn/ban-nha-pid2.html"));
    }

    #[test]
    fn prices_convert_units_to_billions() {
        approx(normalize_price("2,5 tỷ").map(|p| p.amount), 2.5);
        approx(normalize_price("2.5 tỷ").map(|p| p.amount), 2.5);
        approx(normalize_price("850 triệu").map(|p| p.amount), 0.85);
        approx(normalize_price("1.500 triệu").map(|p| p.amount), 1.5);
        approx(normalize_price("2500000000").map(|p| p.amount), 2.5);
        approx(normalize_price("2.500.000.000 đ").map(|p| p.amount), 2.5);
        approx(normalize_price("Giá: 12 tỷ 500 triệu").map(|p| p.amount), 12.0);
        assert_eq!(normalize_price("2,5 tỷ").unwrap().currency, "VND");
    }

    #[test]
    fn unparseable_and_negotiable_prices_stay_null() {
        assert_eq!(normalize_price("Thỏa thuận"), None);
        assert_eq!(normalize_price("Liên hệ"), None);
        assert_eq!(normalize_price(""), None);
    }

    #[test]
    fn areas_are_square_meters() {
        approx(normalize_area("45 m²"), 45.0);
        approx(normalize_area("120,5m2"), 120.5);
        approx(normalize_area("0,12 ha"), 1200.0);
        assert_eq!(normalize_area("chưa rõ"), None);
    }

    #[test]
    fn coordinates_outside_bounds_are_dropped_and_swapped_pairs_fixed() {
        let bounds = GeoBounds::default();
        assert_eq!(pick_coordinates(&[(21.0, 105.8)], &bounds), Some((21.0, 105.8)));
        assert_eq!(pick_coordinates(&[(105.8, 21.0)], &bounds), Some((21.0, 105.8)));
        assert_eq!(pick_coordinates(&[(48.85, 2.35)], &bounds), None);
        assert_eq!(
            pick_coordinates(&[(48.85, 2.35), (10.77, 106.7)], &bounds),
            Some((10.77, 106.7))
        );
    }

    #[test]
    fn normalize_builds_record_with_identity_and_provenance() {
        let collected_at = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();
        let raw = RawListing {
            url: "/ban-nha-pid1.html#map".into(),
            title: Some("Bán nhà".into()),
            address: Some("Thanh Xuân, Hà Nội".into()),
            price_text: Some("Thỏa thuận".into()),
            area_text: Some("45 m2".into()),
            coordinate_candidates: vec![(200.0, 300.0)],
        };
        let target = Target {
            city: "ha-noi".into(),
            property_type: "nha-rieng".into(),
            rent_or_buy: Default::default(),
            radius: 0,
        };
        let record = normalize(&raw, BASE, &GeoBounds::default(), collected_at, Some(target.clone())).unwrap();

        assert_eq!(record.source_url, "https://nhadat247.com.vn/ban-nha-pid1.html");
        assert_eq!(record.identifier, identifier_for(&record.source_url));
        assert_eq!(record.price, None);
        assert_eq!(record.area_sqm, Some(45.0));
        assert_eq!(record.coordinates(), None);
        assert_eq!(record.search, Some(target));
        assert_eq!(record.collected_at, collected_at);
    }
}
