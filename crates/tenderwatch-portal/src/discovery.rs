//! Discovery engine: page scans over the search endpoint and the stabilization
//! loop that repeats them until the portal's index stops growing.
//!
//! The search index lags behind publication, so one page scan can miss tenders
//! that a later scan returns. A run keeps scanning until `confirm_stable_runs`
//! consecutive passes add nothing new, or `max_passes` is reached.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate};
use tenderwatch_core::{
    is_valid_tender_no, parse_discovery_date, utc_offset_from_minutes, DiscoveredTender,
    PORTAL_UTC_OFFSET_MINUTES,
};
use tracing::{info, warn};

use crate::{PortalError, RawDoc, RawPage, SearchFilters, SessionGateway, SessionHandle};

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub target_date: NaiveDate,
    /// Offset the index's start timestamps are read at before comparing dates.
    pub utc_offset: FixedOffset,
    pub excluded_category_prefix: String,
    pub filters: SearchFilters,
    pub page_max_attempts: u32,
    pub page_retry_delay: Duration,
    pub max_pages: u32,
    pub max_passes: u32,
    pub confirm_stable_runs: u32,
    pub pass_delay: Duration,
}

impl DiscoveryConfig {
    pub fn for_date(target_date: NaiveDate) -> Self {
        Self {
            target_date,
            utc_offset: utc_offset_from_minutes(PORTAL_UTC_OFFSET_MINUTES),
            excluded_category_prefix: "services".to_string(),
            filters: SearchFilters::default(),
            page_max_attempts: 3,
            page_retry_delay: Duration::from_secs(5),
            max_pages: 200,
            max_passes: 8,
            confirm_stable_runs: 2,
            pass_delay: Duration::from_secs(30),
        }
    }
}

/// Discovery state for a single pipeline run.
#[derive(Debug, Default)]
pub struct RunState {
    seen: HashSet<String>,
    tenders: BTreeMap<String, DiscoveredTender>,
    stable_streak: u32,
    passes: u32,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one pass into the run and returns how many ids were new.
    pub fn merge(&mut self, found: BTreeMap<String, DiscoveredTender>) -> usize {
        let mut fresh = 0;
        for (id, tender) in found {
            if self.seen.insert(id.clone()) {
                self.tenders.insert(id, tender);
                fresh += 1;
            }
        }
        fresh
    }

    pub fn len(&self) -> usize {
        self.tenders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenders.is_empty()
    }

    pub fn stable_streak(&self) -> u32 {
        self.stable_streak
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    pub fn tenders(&self) -> impl Iterator<Item = &DiscoveredTender> {
        self.tenders.values()
    }

    pub fn into_tenders(self) -> Vec<DiscoveredTender> {
        self.tenders.into_values().collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    pub num_found: u64,
    pub pages: u32,
    pub tenders: BTreeMap<String, DiscoveredTender>,
}

/// Applies the category and date filters to one search hit. Hits without an
/// id or a well-formed bid number are dropped.
pub fn retain_doc(doc: &RawDoc, config: &DiscoveryConfig) -> Option<DiscoveredTender> {
    let id = doc.id.clone()?;
    let bid_number = doc.bid_numbers.first()?.clone();
    if !is_valid_tender_no(&bid_number) {
        warn!(id = %id, bid_number = %bid_number, "search hit has a malformed bid number");
        return None;
    }

    let prefix = config.excluded_category_prefix.to_ascii_lowercase();
    if let Some(category) = doc.category_tags.first() {
        if !prefix.is_empty() && category.to_ascii_lowercase().starts_with(&prefix) {
            return None;
        }
    }

    let raw_start_date = doc.start_dates.first().cloned();
    let discovered_on = raw_start_date
        .as_deref()
        .and_then(|raw| parse_discovery_date(raw, config.utc_offset));
    if discovered_on != Some(config.target_date) {
        return None;
    }

    Some(DiscoveredTender {
        id,
        bid_number,
        category_tags: doc.category_tags.clone(),
        raw_start_date,
        discovered_on,
    })
}

pub struct DiscoveryEngine<'a> {
    gateway: &'a dyn SessionGateway,
    config: &'a DiscoveryConfig,
}

impl<'a> DiscoveryEngine<'a> {
    pub fn new(gateway: &'a dyn SessionGateway, config: &'a DiscoveryConfig) -> Self {
        Self { gateway, config }
    }

    /// Fetches one page, retrying transient failures with a fixed delay. Any
    /// other error is returned immediately.
    pub async fn fetch_page(
        &self,
        session: &SessionHandle,
        page: u32,
    ) -> Result<RawPage, PortalError> {
        let attempts = self.config.page_max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.gateway.search(session, page, &self.config.filters).await {
                Ok(raw) => return Ok(raw),
                Err(PortalError::TransientFetch(message)) => {
                    warn!(page, attempt, error = %message, "search page fetch failed");
                    last_error = message;
                    if attempt < attempts {
                        tokio::time::sleep(self.config.page_retry_delay).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(PortalError::DiscoveryFailed {
            page,
            attempts,
            last_error,
        })
    }

    /// One full page scan. Never returns more tenders than the portal's
    /// reported `numFound`.
    pub async fn run_pass(&self, session: &SessionHandle) -> Result<PassOutcome, PortalError> {
        let mut outcome = PassOutcome::default();
        let mut fetched_ids: HashSet<String> = HashSet::new();

        for page in 1..=self.config.max_pages.max(1) {
            let raw = self.fetch_page(session, page).await?;
            outcome.num_found = raw.num_found;
            if raw.docs.is_empty() {
                break;
            }
            outcome.pages = page;

            for doc in &raw.docs {
                if fetched_ids.len() as u64 >= raw.num_found {
                    break;
                }
                let Some(id) = doc.id.as_ref() else {
                    continue;
                };
                if !fetched_ids.insert(id.clone()) {
                    continue;
                }
                if let Some(tender) = retain_doc(doc, self.config) {
                    outcome.tenders.insert(tender.id.clone(), tender);
                }
            }

            if fetched_ids.len() as u64 >= raw.num_found {
                break;
            }
            if page == self.config.max_pages {
                warn!(max_pages = self.config.max_pages, "page cap reached before numFound");
            }
        }

        Ok(outcome)
    }

    /// Runs passes until the result set is stable or the pass budget is spent.
    /// A failed pass aborts discovery; it is never read as "nothing new".
    pub async fn stabilize(
        &self,
        session: &SessionHandle,
        state: &mut RunState,
    ) -> Result<(), PortalError> {
        let confirm = self.config.confirm_stable_runs.max(1);
        let max_passes = self.config.max_passes.max(1);

        while state.passes < max_passes {
            let outcome = self.run_pass(session).await?;
            state.passes += 1;

            if outcome.tenders.is_empty() && state.is_empty() {
                state.stable_streak = confirm;
                info!(
                    pass = state.passes,
                    num_found = outcome.num_found,
                    target_date = %self.config.target_date,
                    "no tenders for target date; discovery stable"
                );
                break;
            }

            let fresh = state.merge(outcome.tenders);
            if fresh > 0 {
                state.stable_streak = 0;
            } else {
                state.stable_streak += 1;
            }
            info!(
                pass = state.passes,
                pages = outcome.pages,
                num_found = outcome.num_found,
                fresh,
                total = state.len(),
                streak = state.stable_streak,
                "discovery pass complete"
            );

            if state.stable_streak >= confirm {
                break;
            }
            if state.passes < max_passes {
                tokio::time::sleep(self.config.pass_delay).await;
            }
        }

        if state.stable_streak < confirm {
            warn!(
                passes = state.passes,
                total = state.len(),
                "pass budget exhausted before discovery stabilized"
            );
        }
        Ok(())
    }
}
