//! GeM bid portal session gateway: cookie-bound sessions, anti-forgery token
//! extraction and the paginated `search-bids` endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub mod discovery;

pub use discovery::{retain_doc, DiscoveryConfig, DiscoveryEngine, PassOutcome, RunState};

pub const CRATE_NAME: &str = "tenderwatch-portal";

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("anti-forgery cookie `{cookie}` missing after opening {url}")]
    Session { cookie: String, url: String },
    #[error("transient fetch failure: {0}")]
    TransientFetch(String),
    #[error("malformed search response (session likely stale): {0}")]
    Format(String),
    #[error("page {page} failed after {attempts} attempts: {last_error}")]
    DiscoveryFailed {
        page: u32,
        attempts: u32,
        last_error: String,
    },
}

impl PortalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFetch(_))
    }
}

/// Token for one portal session. The cookie jar it belongs to stays inside the
/// gateway that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub token: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub search_type: String,
    pub state: String,
    pub city: String,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            search_type: "con".to_string(),
            state: "JHARKHAND".to_string(),
            city: String::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SearchPayload<'a> {
    #[serde(rename = "searchType")]
    search_type: &'a str,
    state_name_con: &'a str,
    city_name_con: &'a str,
    page: u32,
}

/// Search hit as returned by the portal, before any filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDoc {
    pub id: Option<String>,
    pub bid_numbers: Vec<String>,
    pub category_tags: Vec<String>,
    pub start_dates: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPage {
    pub num_found: u64,
    pub docs: Vec<RawDoc>,
}

impl RawPage {
    /// Parses `{ response: { response: { numFound, docs: [...] } } }`.
    pub fn parse(body: &str) -> Result<Self, PortalError> {
        let value: JsonValue = serde_json::from_str(body)
            .map_err(|e| PortalError::Format(format!("body is not JSON: {e}")))?;
        let inner = value
            .pointer("/response/response")
            .ok_or_else(|| PortalError::Format("missing response.response".to_string()))?;
        let num_found = json_u64(inner.get("numFound"))
            .ok_or_else(|| PortalError::Format("missing numFound".to_string()))?;
        let docs = match inner.get("docs") {
            Some(JsonValue::Array(items)) => items.iter().map(raw_doc).collect(),
            Some(JsonValue::Null) | None => Vec::new(),
            Some(other) => {
                return Err(PortalError::Format(format!("docs is not an array: {other}")));
            }
        };
        Ok(Self { num_found, docs })
    }
}

fn json_u64(value: Option<&JsonValue>) -> Option<u64> {
    match value? {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_scalar_string(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Solr-style fields come back as arrays, occasionally as bare scalars.
fn json_string_list(value: Option<&JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|v| json_scalar_string(Some(v)))
            .collect(),
        other => json_scalar_string(other).into_iter().collect(),
    }
}

fn raw_doc(value: &JsonValue) -> RawDoc {
    RawDoc {
        id: json_scalar_string(value.get("id")),
        bid_numbers: json_string_list(value.get("b_bid_number")),
        category_tags: json_string_list(value.get("b_cat_id")),
        start_dates: json_string_list(value.get("final_start_date_sort")),
    }
}

#[async_trait]
pub trait SessionGateway: Send + Sync {
    async fn open_session(&self) -> Result<SessionHandle, PortalError>;

    async fn search(
        &self,
        session: &SessionHandle,
        page: u32,
        filters: &SearchFilters,
    ) -> Result<RawPage, PortalError>;
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub search_page_path: String,
    pub search_path: String,
    pub document_path: String,
    pub token_cookie: String,
    pub token_field: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://bidplus.gem.gov.in".to_string(),
            search_page_path: "/advance-search".to_string(),
            search_path: "/search-bids".to_string(),
            document_path: "/showbidDocument".to_string(),
            token_cookie: "csrf_gem_cookie".to_string(),
            token_field: "csrf_bd_gem_nk".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                         Chrome/124.0 Safari/537.36"
                .to_string(),
        }
    }
}

impl PortalConfig {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn search_page_url(&self) -> String {
        self.url(&self.search_page_path)
    }

    pub fn search_url(&self) -> String {
        self.url(&self.search_path)
    }

    pub fn document_url(&self, tender_id: &str) -> String {
        format!("{}/{}", self.url(&self.document_path), tender_id)
    }
}

/// Live gateway against the portal. Build one per run: the cookie jar, and with
/// it the session, is dropped together with the gateway.
#[derive(Debug)]
pub struct GemPortal {
    client: reqwest::Client,
    jar: Arc<Jar>,
    config: PortalConfig,
}

impl GemPortal {
    pub fn new(config: PortalConfig) -> anyhow::Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .gzip(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building portal client")?;
        Ok(Self { client, jar, config })
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }
}

/// Pulls one cookie value out of a `Cookie:` header string.
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key.trim() == name && !value.trim().is_empty()).then(|| value.trim().to_string())
    })
}

fn transient(err: reqwest::Error) -> PortalError {
    PortalError::TransientFetch(err.to_string())
}

#[async_trait]
impl SessionGateway for GemPortal {
    async fn open_session(&self) -> Result<SessionHandle, PortalError> {
        let page_url = self.config.search_page_url();
        let resp = self.client.get(&page_url).send().await.map_err(transient)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PortalError::TransientFetch(format!(
                "http status {} for {page_url}",
                status.as_u16()
            )));
        }

        let origin = Url::parse(&self.config.base_url)
            .map_err(|e| PortalError::Format(format!("invalid portal base url: {e}")))?;
        let token = self
            .jar
            .cookies(&origin)
            .and_then(|header| header.to_str().ok().map(ToString::to_string))
            .and_then(|header| cookie_value(&header, &self.config.token_cookie))
            .ok_or_else(|| PortalError::Session {
                cookie: self.config.token_cookie.clone(),
                url: page_url.clone(),
            })?;

        info!(url = %page_url, "portal session opened");
        Ok(SessionHandle {
            token,
            opened_at: Utc::now(),
        })
    }

    async fn search(
        &self,
        session: &SessionHandle,
        page: u32,
        filters: &SearchFilters,
    ) -> Result<RawPage, PortalError> {
        let payload = serde_json::to_string(&SearchPayload {
            search_type: &filters.search_type,
            state_name_con: &filters.state,
            city_name_con: &filters.city,
            page,
        })
        .map_err(|e| PortalError::Format(format!("encoding search payload: {e}")))?;

        let form = [
            ("payload", payload.as_str()),
            (self.config.token_field.as_str(), session.token.as_str()),
        ];
        let resp = self
            .client
            .post(self.config.search_url())
            .header("X-Requested-With", "XMLHttpRequest")
            .header(reqwest::header::REFERER, self.config.search_page_url())
            .form(&form)
            .send()
            .await
            .map_err(transient)?;

        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PortalError::TransientFetch(format!(
                "search page {page} returned {}",
                status.as_u16()
            )));
        }
        let body = resp.text().await.map_err(transient)?;
        if !status.is_success() {
            return Err(PortalError::Format(format!(
                "search page {page} returned {}",
                status.as_u16()
            )));
        }

        let parsed = RawPage::parse(&body)?;
        debug!(page, docs = parsed.docs.len(), num_found = parsed.num_found, "search page fetched");
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_search_response_shape() {
        let body = r#"{
            "response": {"response": {
                "numFound": 2,
                "docs": [
                    {"id": "7712345", "b_bid_number": ["GEM/2025/B/6012345"],
                     "b_cat_id": ["products_hardware"],
                     "final_start_date_sort": ["2025-03-05T10:15:00Z"]},
                    {"id": 7712346, "b_bid_number": "GEM/2025/B/6012346"}
                ]
            }}
        }"#;
        let page = RawPage::parse(body).expect("parse");
        assert_eq!(page.num_found, 2);
        assert_eq!(page.docs.len(), 2);
        assert_eq!(page.docs[0].category_tags, vec!["products_hardware"]);
        assert_eq!(page.docs[1].id.as_deref(), Some("7712346"));
        assert_eq!(page.docs[1].bid_numbers, vec!["GEM/2025/B/6012346"]);
        assert!(page.docs[1].start_dates.is_empty());
    }

    #[test]
    fn html_login_page_is_a_format_error() {
        let err = RawPage::parse("<html><body>Session expired</body></html>").unwrap_err();
        assert!(matches!(err, PortalError::Format(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn json_without_envelope_is_a_format_error() {
        let err = RawPage::parse(r#"{"status": "error"}"#).unwrap_err();
        assert!(matches!(err, PortalError::Format(_)));
    }

    #[test]
    fn token_is_read_from_cookie_header() {
        let header = "ci_session=abc; csrf_gem_cookie=f00dfeed; other=1";
        assert_eq!(cookie_value(header, "csrf_gem_cookie").as_deref(), Some("f00dfeed"));
        assert_eq!(cookie_value(header, "missing"), None);
        assert_eq!(cookie_value("csrf_gem_cookie=", "csrf_gem_cookie"), None);
    }

    #[test]
    fn payload_uses_portal_field_names() {
        let payload = serde_json::to_value(SearchPayload {
            search_type: "con",
            state_name_con: "JHARKHAND",
            city_name_con: "",
            page: 3,
        })
        .unwrap();
        assert_eq!(payload["searchType"], "con");
        assert_eq!(payload["state_name_con"], "JHARKHAND");
        assert_eq!(payload["page"], 3);
    }

    #[test]
    fn document_url_is_built_from_base() {
        let config = PortalConfig {
            base_url: "https://bidplus.gem.gov.in/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.document_url("7712345"),
            "https://bidplus.gem.gov.in/showbidDocument/7712345"
        );
    }
}
