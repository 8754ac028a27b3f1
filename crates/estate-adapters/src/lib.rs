//! Listing-site adapters: search URL generation and HTML extraction into raw listings.

use std::collections::HashSet;
use std::sync::LazyLock;

use estate_core::{RentOrBuy, Target};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod normalize;

pub use normalize::{
    identifier_for, normalize, normalize_area, normalize_price, normalize_url, pick_coordinates,
};

pub const CRATE_NAME: &str = "estate-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("{url}: missing {field}")]
    MissingField { url: String, field: &'static str },
}

/// Unnormalized fields lifted from one detail page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub url: String,
    pub title: Option<String>,
    pub address: Option<String>,
    pub price_text: Option<String>,
    pub area_text: Option<String>,
    /// Candidate number pairs in document order; their lat/lon order is not yet known.
    pub coordinate_candidates: Vec<(f64, f64)>,
}

pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn base_url(&self) -> &'static str;

    /// Listing-page URLs for one search target.
    fn listing_urls(&self, target: &Target) -> Vec<String>;

    /// Absolute detail-page URLs found on a listing page, at most `limit`.
    fn parse_listing(&self, html: &str, limit: usize) -> Result<Vec<String>, AdapterError>;

    fn parse_detail(&self, url: &str, html: &str) -> Result<RawListing, AdapterError>;
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn ListingSource>> {
    match source_id {
        Nhadat247::SOURCE_ID => Some(Box::new(Nhadat247)),
        _ => None,
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).find_map(element_text))
}

fn select_first_attr(document: &Html, css: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

/// Value text of the short-info item whose label contains `label`.
fn short_info_value(document: &Html, label: &str) -> Result<Option<String>, AdapterError> {
    let items = selector("div.re__pr-short-info-item")?;
    let value = selector("span.value, span.re__pr-specs-content-item-value")?;
    Ok(document
        .select(&items)
        .filter(|item| item.text().any(|t| t.contains(label)))
        .find_map(|item| item.select(&value).find_map(element_text)))
}

static COORDINATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)place\?q=([-+]?\d*\.\d+),([-+]?\d*\.\d+)",
        r"([-+]?\d{1,3}\.\d{4,}),\s*([-+]?\d{1,3}\.\d{4,})",
        r#"(?i)"lat"\s*:\s*([-+]?\d*\.\d+).*?"lng"\s*:\s*([-+]?\d*\.\d+)"#,
        r#"(?i)latitude["']\s*:\s*["']?([-+]?\d*\.\d+)["']?.*?longitude["']\s*:\s*["']?([-+]?\d*\.\d+)"#,
        r"(?i)center=([-+]?\d*\.\d+),([-+]?\d*\.\d+)",
        r"@([-+]?\d*\.\d+),([-+]?\d*\.\d+)",
    ]
    .into_iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static AREA_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:[.,]\d+)?\s*(?:m²|m2|mét|vuông))").unwrap()
});

/// Every number pair matched by the known map/JSON coordinate patterns, pattern by pattern.
pub fn coordinate_candidates(html: &str) -> Vec<(f64, f64)> {
    COORDINATE_PATTERNS
        .iter()
        .flat_map(|re| re.captures_iter(html))
        .filter_map(|caps| {
            let a = caps.get(1)?.as_str().parse::<f64>().ok()?;
            let b = caps.get(2)?.as_str().parse::<f64>().ok()?;
            Some((a, b))
        })
        .collect()
}

fn looks_negotiable(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("thỏa thuận") || lower.contains("thoả thuận")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Nhadat247;

impl Nhadat247 {
    pub const SOURCE_ID: &'static str = "nhadat247";
    pub const BASE_URL: &'static str = "https://nhadat247.com.vn/";

    pub fn action_segment(rent_or_buy: RentOrBuy) -> &'static str {
        match rent_or_buy {
            RentOrBuy::Buy => "mua-ban",
            RentOrBuy::Rent => "cho-thue",
        }
    }

    pub fn category_code(property_type: &str) -> &'static str {
        match property_type.trim().to_lowercase().as_str() {
            "nha-rieng" | "house" => "ci40",
            "nha-mat-pho" => "ci41",
            "dat-nen" | "plot" => "ci42",
            "van-phong" | "office-commerce-industry" => "ci43",
            "phong-tro" => "ci44",
            "parking-space" => "ci45",
            "multi-family-residential" => "ci46",
            "agriculture" => "ci47",
            "other-objects" => "ci48",
            _ => "ci38",
        }
    }

    /// Site city code for a city name given as an ascii slug, a compact slug or with diacritics.
    pub fn city_code(city: &str) -> Option<&'static str> {
        let slug = city.trim().replace(' ', "-").to_lowercase();
        if slug.is_empty() {
            return None;
        }
        let compact = slug.replace('-', "");
        CITY_CODES.iter().find_map(|(code, aliases)| {
            let ascii = code.rsplit_once("-xc").map_or(*code, |(name, _)| name);
            let matched = slug == ascii
                || compact == ascii.replace('-', "")
                || aliases.iter().any(|alias| *alias == slug);
            matched.then_some(*code)
        })
    }
}

impl ListingSource for Nhadat247 {
    fn source_id(&self) -> &'static str {
        Self::SOURCE_ID
    }

    fn base_url(&self) -> &'static str {
        Self::BASE_URL
    }

    fn listing_urls(&self, target: &Target) -> Vec<String> {
        let action = Self::action_segment(target.rent_or_buy);
        let category = Self::category_code(&target.property_type);
        let url = match Self::city_code(&target.city) {
            Some(city) => format!("{}{action}-nha-dat-{city}-{category}.html", Self::BASE_URL),
            None => format!("{}{action}-nha-dat-{category}.html", Self::BASE_URL),
        };
        vec![url]
    }

    fn parse_listing(&self, html: &str, limit: usize) -> Result<Vec<String>, AdapterError> {
        let document = Html::parse_document(html);
        let links = selector(r#"a[href*="-pid"]"#)?;
        let mut seen = HashSet::new();
        Ok(document
            .select(&links)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(|href| normalize_url(Self::BASE_URL, href))
            .filter(|url| seen.insert(url.clone()))
            .take(limit)
            .collect())
    }

    fn parse_detail(&self, url: &str, html: &str) -> Result<RawListing, AdapterError> {
        let document = Html::parse_document(html);

        let title = select_first_text(&document, "h1")?
            .or(select_first_text(&document, "title")?)
            .ok_or_else(|| AdapterError::MissingField {
                url: url.to_string(),
                field: "title",
            })?;

        let address = select_first_text(&document, "span.re__pr-short-description")?.map(|text| {
            text.split(',')
                .take(3)
                .collect::<Vec<_>>()
                .join(",")
                .trim()
                .to_string()
        });

        // The hidden price input carries the raw amount in VND; fall back to the visible label.
        let price_text = match select_first_attr(&document, "input.js-gia-bds", "value")? {
            Some(raw) => {
                let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
                if !digits.is_empty() {
                    Some(digits)
                } else if looks_negotiable(html) {
                    Some("Thỏa thuận".to_string())
                } else {
                    Some(raw)
                }
            }
            None => short_info_value(&document, "Mức giá")?,
        };

        let area_text = match short_info_value(&document, "Diện tích")? {
            Some(area) => Some(area),
            None => AREA_IN_TEXT
                .captures(html)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string()),
        };

        Ok(RawListing {
            url: url.to_string(),
            title: Some(title),
            address,
            price_text,
            area_text,
            coordinate_candidates: coordinate_candidates(html),
        })
    }
}

/// City codes with their non-ascii or irregular aliases. The ascii slug is the code minus `-xcNN`.
const CITY_CODES: &[(&str, &[&str])] = &[
    ("ha-noi-xc1", &["hà-nội"]),
    (
        "tp-hcm-xc79",
        &["ho-chi-minh", "ho-chi-minh-city", "hochiminh", "sai-gon", "saigon"],
    ),
    ("da-nang-xc48", &["đà-nẵng"]),
    ("hai-phong-xc31", &["hải-phòng"]),
    ("can-tho-xc92", &["cần-thơ"]),
    ("bac-giang-xc24", &["bắc-giang"]),
    ("bac-kan-xc6", &["bắc-kạn"]),
    ("bac-ninh-xc27", &["bắc-ninh"]),
    ("cao-bang-xc4", &["cao-bằng"]),
    ("dien-bien-xc11", &["điện-biên"]),
    ("gia-lam-xc8", &["gia-lâm"]),
    ("ha-giang-xc2", &["hà-giang"]),
    ("ha-nam-xc35", &["hà-nam"]),
    ("ha-tinh-xc42", &["hà-tĩnh"]),
    ("hung-yen-xc33", &["hưng-yên"]),
    ("lai-chau-xc12", &["lai-châu"]),
    ("lang-son-xc20", &["lạng-sơn"]),
    ("lao-cai-xc10", &["lào-cai"]),
    ("nam-dinh-xc36", &["nam-định"]),
    ("nghe-an-xc40", &["nghệ-an"]),
    ("ninh-binh-xc37", &["ninh-bình"]),
    ("phu-tho-xc25", &["phú-thọ"]),
    ("quang-ninh-xc22", &["quảng-ninh"]),
    ("son-la-xc14", &["sơn-la"]),
    ("thai-binh-xc34", &["thái-bình"]),
    ("thai-nguyen-xc19", &["thái-nguyên"]),
    ("thanh-hoa-xc38", &["thanh-hóa"]),
    ("tuyen-quang-xc8", &["tuyên-quang"]),
    ("vinh-phuc-xc26", &["vĩnh-phúc"]),
    ("yen-bai-xc15", &["yên-bái"]),
    ("binh-dinh-xc52", &["bình-định"]),
    ("binh-thuan-xc60", &["bình-thuận"]),
    ("dak-lak-xc66", &["đắk-lắk"]),
    ("dak-nong-xc67", &["đắk-nông"]),
    ("gia-lai-xc64", &[]),
    ("khanh-hoa-xc56", &["khánh-hòa"]),
    ("kon-tum-xc62", &[]),
    ("lam-dong-xc68", &["lâm-đồng"]),
    ("phu-yen-xc54", &["phú-yên"]),
    ("quang-binh-xc44", &["quảng-bình"]),
    ("quang-nam-xc49", &["quảng-nam"]),
    ("quang-ngai-xc51", &["quảng-ngãi"]),
    ("quang-tri-xc45", &["quảng-trị"]),
    ("thua-thien-hue-xc46", &["thừa-thiên-huế"]),
    ("an-giang-xc89", &[]),
    ("ba-ria-vung-tau-xc77", &["bà-rịa-vũng-tàu"]),
    ("bac-lieu-xc95", &["bạc-liêu"]),
    ("ben-tre-xc83", &["bến-tre"]),
    ("binh-duong-xc74", &["bình-dương"]),
    ("binh-phuoc-xc70", &["bình-phước"]),
    ("ca-mau-xc96", &["cà-mau"]),
    ("dong-nai-xc75", &["đồng-nai"]),
    ("dong-thap-xc87", &["đồng-tháp"]),
    ("hai-duong-xc30", &["hải-dương"]),
    ("hau-giang-xc93", &["hậu-giang"]),
    ("hoa-binh-xc17", &["hòa-bình"]),
    ("kien-giang-xc91", &["kiên-giang"]),
    ("long-an-xc80", &[]),
    ("soc-trang-xc94", &["sóc-trăng"]),
    ("tay-ninh-xc72", &["tây-ninh"]),
    ("tien-giang-xc82", &["tiền-giang"]),
    ("tra-vinh-xc84", &["trà-vinh"]),
    ("vinh-long-xc86", &["vĩnh-long"]),
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(name: &str) -> String {
        let path = workspace_root()
            .join("fixtures")
            .join(Nhadat247::SOURCE_ID)
            .join("sample")
            .join(name);
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn target(city: &str, property_type: &str, rent_or_buy: RentOrBuy) -> Target {
        Target {
            city: city.into(),
            property_type: property_type.into(),
            rent_or_buy,
            radius: 0,
        }
    }

    #[test]
    fn listing_urls_follow_site_url_scheme() {
        let adapter = Nhadat247;
        assert_eq!(
            adapter.listing_urls(&target("Hà Nội", "nha-rieng", RentOrBuy::Buy)),
            vec!["https://nhadat247.com.vn/mua-ban-nha-dat-ha-noi-xc1-ci40.html"]
        );
        assert_eq!(
            adapter.listing_urls(&target("saigon", "van-phong", RentOrBuy::Rent)),
            vec!["https://nhadat247.com.vn/cho-thue-nha-dat-tp-hcm-xc79-ci43.html"]
        );
        assert_eq!(
            adapter.listing_urls(&target("Atlantis", "castle", RentOrBuy::Buy)),
            vec!["https://nhadat247.com.vn/mua-ban-nha-dat-ci38.html"]
        );
    }

    #[test]
    fn city_codes_accept_compact_and_diacritic_spellings() {
        assert_eq!(Nhadat247::city_code("danang"), Some("da-nang-xc48"));
        assert_eq!(Nhadat247::city_code("Thừa Thiên Huế"), Some("thua-thien-hue-xc46"));
        assert_eq!(Nhadat247::city_code("ba-ria-vung-tau"), Some("ba-ria-vung-tau-xc77"));
        assert_eq!(Nhadat247::city_code(""), None);
    }

    #[test]
    fn listing_page_yields_unique_absolute_detail_links() {
        let urls = Nhadat247.parse_listing(&fixture("listing.html"), 10).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://nhadat247.com.vn/ban-nha-rieng-ngo-12-khuong-trung-pid101.html",
                "https://nhadat247.com.vn/ban-can-ho-royal-city-pid102.html",
                "https://nhadat247.com.vn/ban-dat-nen-dong-anh-pid103.html",
                "https://nhadat247.com.vn/ban-nha-mat-pho-hang-bac-pid104.html",
            ]
        );

        let capped = Nhadat247.parse_listing(&fixture("listing.html"), 2).unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn detail_page_extracts_raw_fields() {
        let url = "https://nhadat247.com.vn/ban-nha-rieng-ngo-12-khuong-trung-pid101.html";
        let raw = Nhadat247.parse_detail(url, &fixture("detail.html")).unwrap();

        assert_eq!(
            raw.title.as_deref(),
            Some("Bán nhà riêng ngõ 12 Khương Trung, 45m2, 5 tầng")
        );
        assert_eq!(
            raw.address.as_deref(),
            Some("Phường Khương Trung, Quận Thanh Xuân, Hà Nội")
        );
        assert_eq!(raw.price_text.as_deref(), Some("2500000000"));
        assert_eq!(raw.area_text.as_deref(), Some("45 m²"));
        assert_eq!(raw.coordinate_candidates.first(), Some(&(20.998712, 105.817623)));
    }

    #[test]
    fn negotiable_detail_keeps_marker_text() {
        let raw = Nhadat247
            .parse_detail("https://nhadat247.com.vn/x-pid9.html", &fixture("detail_negotiable.html"))
            .unwrap();
        assert_eq!(raw.price_text.as_deref(), Some("Thỏa thuận"));
        assert_eq!(raw.area_text.as_deref(), Some("0,12 ha"));
        assert!(raw.coordinate_candidates.contains(&(105.78321, 21.03122)));
    }

    #[test]
    fn detail_without_any_title_is_a_parse_failure() {
        let err = Nhadat247
            .parse_detail("https://nhadat247.com.vn/x-pid9.html", "<html><body><p>gone</p></body></html>")
            .unwrap_err();
        assert!(matches!(err, AdapterError::MissingField { field: "title", .. }));
    }

    #[test]
    fn registry_resolves_known_sources_only() {
        assert!(adapter_for_source("nhadat247").is_some());
        assert!(adapter_for_source("unknown").is_none());
    }
}
