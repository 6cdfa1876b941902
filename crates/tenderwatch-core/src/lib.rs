//! Core domain model for tenderwatch: persisted tenders, discovery records and
//! document extraction results.

use std::sync::LazyLock;

use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveDateTime, Offset, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tenderwatch-core";

/// GeM publishes bid dates in India Standard Time.
pub const PORTAL_UTC_OFFSET_MINUTES: i32 = 330;

static TENDER_NO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^GEM/\d{4}/B/\d+$").expect("valid tender number regex"));

/// Persisted tender record, keyed by `tender_no` (the portal bid number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tender {
    pub tender_no: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
    pub documents_required: Vec<String>,
    pub document_download_links: Vec<String>,
    pub consignees: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tender {
    pub fn new(tender_no: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            tender_no: tender_no.into(),
            title: None,
            category: None,
            start_date: None,
            end_date: None,
            documents_required: Vec::new(),
            document_download_links: Vec::new(),
            consignees: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One search hit from a discovery pass. Lives only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredTender {
    pub id: String,
    pub bid_number: String,
    pub category_tags: Vec<String>,
    pub raw_start_date: Option<String>,
    pub discovered_on: Option<NaiveDate>,
}

impl DiscoveredTender {
    pub fn primary_category(&self) -> Option<&str> {
        self.category_tags.first().map(String::as_str)
    }
}

/// Structured fields recovered from one bid document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub bid_number: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub item_category: Option<String>,
    pub documents_required: Option<String>,
    pub consignees: Vec<String>,
    pub source_url: String,
    pub used_ocr: bool,
}

impl ExtractionResult {
    /// Maps the extraction onto a fresh tender record. Consignees are carried over
    /// in full; callers that want a single representative address truncate here.
    pub fn into_tender(self, discovered: &DiscoveredTender, now: DateTime<Utc>) -> Tender {
        let mut tender = Tender::new(self.bid_number, now);
        tender.title = self.item_category.clone();
        tender.category = discovered.primary_category().map(ToString::to_string);
        tender.start_date = self.start_date.as_deref().and_then(parse_document_date);
        tender.end_date = self.end_date.as_deref().and_then(parse_document_date);
        tender.documents_required = self
            .documents_required
            .as_deref()
            .map(split_documents_required)
            .unwrap_or_default();
        tender.document_download_links = vec![self.source_url];
        tender.consignees = self.consignees;
        tender
    }
}

pub fn is_valid_tender_no(value: &str) -> bool {
    TENDER_NO.is_match(value)
}

/// Parses the `dd-mm-yyyy[ hh:mm:ss]` dates printed in bid documents.
/// Malformed input yields `None`.
pub fn parse_document_date(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%d-%m-%Y %H:%M:%S") {
        return Some(dt);
    }
    NaiveDate::parse_from_str(value, "%d-%m-%Y")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Out-of-range offsets fall back to UTC.
pub fn utc_offset_from_minutes(minutes: i32) -> FixedOffset {
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(|| Utc.fix())
}

/// The calendar date `days_back` days before `now`, as seen at `offset`.
pub fn calendar_date_at(now: DateTime<Utc>, offset: FixedOffset, days_back: u32) -> NaiveDate {
    let today = now.with_timezone(&offset).date_naive();
    today
        .checked_sub_days(Days::new(u64::from(days_back)))
        .unwrap_or(today)
}

/// Normalizes the search index's start date (`2025-03-05T10:15:00Z` or a bare
/// ISO date) down to a calendar date at `offset`. Bare dates are taken as is.
pub fn parse_discovery_date(value: &str, offset: FixedOffset) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&offset).date_naive());
    }
    let date_part = value.get(..10)?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

pub fn split_documents_required(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in text.split([',', ';']) {
        let item = part.split_whitespace().collect::<Vec<_>>().join(" ");
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn document_date_with_time() {
        let parsed = parse_document_date("05-03-2025 14:30:00").expect("date");
        let expected = NaiveDate::from_ymd_opt(2025, 3, 5)
            .unwrap()
            .and_hms_opt(14, 30, 0)
            .unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn document_date_without_time_is_midnight() {
        let parsed = parse_document_date("05-03-2025").expect("date");
        let expected = NaiveDate::from_ymd_opt(2025, 3, 5)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn malformed_document_date_is_absent() {
        assert_eq!(parse_document_date("2025/03/05"), None);
        assert_eq!(parse_document_date("31-02-2025"), None);
        assert_eq!(parse_document_date(""), None);
    }

    fn ist() -> FixedOffset {
        utc_offset_from_minutes(PORTAL_UTC_OFFSET_MINUTES)
    }

    #[test]
    fn discovery_date_accepts_rfc3339_and_plain_dates() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 5);
        assert_eq!(parse_discovery_date("2025-03-05T10:15:00Z", ist()), expected);
        assert_eq!(parse_discovery_date("2025-03-05", ist()), expected);
        assert_eq!(parse_discovery_date("yesterday", ist()), None);
    }

    #[test]
    fn discovery_date_is_read_in_portal_time() {
        // 20:00 UTC is already 01:30 the next morning in IST.
        assert_eq!(
            parse_discovery_date("2025-03-05T20:00:00Z", ist()),
            NaiveDate::from_ymd_opt(2025, 3, 6)
        );
        assert_eq!(
            parse_discovery_date("2025-03-05T20:00:00Z", Utc.fix()),
            NaiveDate::from_ymd_opt(2025, 3, 5)
        );
    }

    #[test]
    fn calendar_date_steps_back_in_portal_time() {
        let now = Utc.with_ymd_and_hms(2025, 3, 5, 20, 30, 0).single().unwrap();
        assert_eq!(calendar_date_at(now, ist(), 0), NaiveDate::from_ymd_opt(2025, 3, 6).unwrap());
        assert_eq!(calendar_date_at(now, ist(), 1), NaiveDate::from_ymd_opt(2025, 3, 5).unwrap());
        assert_eq!(
            calendar_date_at(now, Utc.fix(), 1),
            NaiveDate::from_ymd_opt(2025, 3, 4).unwrap()
        );
    }

    #[test]
    fn absurd_offset_falls_back_to_utc() {
        assert_eq!(utc_offset_from_minutes(100_000), Utc.fix());
        assert_eq!(utc_offset_from_minutes(330).local_minus_utc(), 19_800);
    }

    #[test]
    fn tender_number_shape() {
        assert!(is_valid_tender_no("GEM/2025/B/6012345"));
        assert!(!is_valid_tender_no("GEM/25/B/6012345"));
        assert!(!is_valid_tender_no("gem/2025/b/1"));
    }

    #[test]
    fn extraction_maps_onto_tender() {
        let now = Utc.with_ymd_and_hms(2025, 3, 5, 21, 0, 0).single().unwrap();
        let discovered = DiscoveredTender {
            id: "7712345".into(),
            bid_number: "GEM/2025/B/6012345".into(),
            category_tags: vec!["products_hardware".into()],
            raw_start_date: Some("2025-03-05T10:15:00Z".into()),
            discovered_on: NaiveDate::from_ymd_opt(2025, 3, 5),
        };
        let extraction = ExtractionResult {
            bid_number: "GEM/2025/B/6012345".into(),
            start_date: Some("05-03-2025".into()),
            end_date: Some("26-03-2025 15:00:00".into()),
            item_category: Some("Desktop Computers".into()),
            documents_required: Some(
                "Experience Criteria, Bidder Turnover,Experience Criteria".into(),
            ),
            consignees: vec!["a".into(), "b".into()],
            source_url: "https://bidplus.gem.gov.in/showbidDocument/7712345".into(),
            used_ocr: false,
        };

        let tender = extraction.into_tender(&discovered, now);
        assert_eq!(tender.tender_no, "GEM/2025/B/6012345");
        assert_eq!(tender.category.as_deref(), Some("products_hardware"));
        assert_eq!(tender.documents_required, vec!["Experience Criteria", "Bidder Turnover"]);
        assert_eq!(tender.consignees.len(), 2);
        assert!(tender.end_date.is_some());
        assert_eq!(tender.created_at, now);
    }
}
