//! Pipeline orchestration: discovery, idempotency gate, document pipeline and
//! persistence for one target date, plus the scheduled triggers around it.

pub mod config;
pub mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tenderwatch_core::{calendar_date_at, DiscoveredTender};
use tenderwatch_documents::{
    ConsigneeRules, DocumentExtractor, FieldRuleSet, PdfToText, TesseractOcr,
};
use tenderwatch_portal::{
    DiscoveryConfig, DiscoveryEngine, GemPortal, PortalConfig, RunState, SessionGateway,
};
use tenderwatch_storage::{
    ArtifactStore, FetchError, HttpClientConfig, HttpFetcher, RunLog, RunLogOutcome, TenderStore,
};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::PipelineConfig;
pub use scheduler::{build_scheduler, GuardedRunner};

pub const CRATE_NAME: &str = "tenderwatch-sync";

/// Yields a fresh portal session source for each run, so cookies never leak
/// from one run into the next.
pub type GatewayFactory = Box<dyn Fn() -> Result<Arc<dyn SessionGateway>> + Send + Sync>;

#[async_trait]
pub trait DocumentSource: Send + Sync {
    fn document_url(&self, tender_id: &str) -> String;

    async fn fetch_document(&self, run_id: Uuid, tender_id: &str) -> Result<Vec<u8>, FetchError>;
}

/// Bid documents served by the portal, fetched with bounded backoff.
pub struct PortalDocuments {
    fetcher: HttpFetcher,
    portal: PortalConfig,
}

impl PortalDocuments {
    pub fn new(fetcher: HttpFetcher, portal: PortalConfig) -> Self {
        Self { fetcher, portal }
    }
}

#[async_trait]
impl DocumentSource for PortalDocuments {
    fn document_url(&self, tender_id: &str) -> String {
        self.portal.document_url(tender_id)
    }

    async fn fetch_document(&self, run_id: Uuid, tender_id: &str) -> Result<Vec<u8>, FetchError> {
        let url = self.document_url(tender_id);
        Ok(self.fetcher.fetch_bytes(run_id, &url).await?.body)
    }
}

/// A tender is done when its record exists or its document is already on disk.
pub struct IdempotencyGate<'a> {
    store: &'a dyn TenderStore,
    artifacts: &'a ArtifactStore,
}

impl<'a> IdempotencyGate<'a> {
    pub fn new(store: &'a dyn TenderStore, artifacts: &'a ArtifactStore) -> Self {
        Self { store, artifacts }
    }

    pub async fn already_processed(&self, bid_number: &str, tender_id: &str) -> Result<bool> {
        if self
            .store
            .find_by_tender_no(bid_number)
            .await
            .with_context(|| format!("looking up tender {bid_number}"))?
            .is_some()
        {
            return Ok(true);
        }
        self.artifacts.contains(tender_id).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub target_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passes: u32,
    pub discovered: usize,
    pub skipped: usize,
    pub processed: usize,
    pub failed: usize,
    pub persisted: usize,
    pub cancelled: bool,
}

impl RunSummary {
    fn record(&mut self, outcome: RunLogOutcome) {
        match outcome {
            RunLogOutcome::AlreadyProcessed => self.skipped += 1,
            RunLogOutcome::Persisted => {
                self.processed += 1;
                self.persisted += 1;
            }
            RunLogOutcome::FetchFailed
            | RunLogOutcome::ExtractionFailed
            | RunLogOutcome::PersistFailed => {
                self.processed += 1;
                self.failed += 1;
            }
        }
    }
}

/// Per-run context handed through each stage.
struct RunContext {
    run_id: Uuid,
    target_date: NaiveDate,
    state: RunState,
}

pub struct Pipeline {
    gateways: GatewayFactory,
    documents: Arc<dyn DocumentSource>,
    store: Arc<dyn TenderStore>,
    artifacts: ArtifactStore,
    run_log: RunLog,
    extractor: DocumentExtractor,
    discovery: DiscoveryConfig,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        gateways: GatewayFactory,
        documents: Arc<dyn DocumentSource>,
        store: Arc<dyn TenderStore>,
        artifacts: ArtifactStore,
        run_log: RunLog,
        extractor: DocumentExtractor,
        discovery: DiscoveryConfig,
    ) -> Self {
        Self {
            gateways,
            documents,
            store,
            artifacts,
            run_log,
            extractor,
            discovery,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wires the live portal, poppler/tesseract and the given store.
    pub fn from_config(config: &PipelineConfig, store: Arc<dyn TenderStore>) -> Result<Self> {
        let portal = config.portal();
        let gateway_config = portal.clone();
        let gateways: GatewayFactory = Box::new(move || {
            let gateway = GemPortal::new(gateway_config.clone())?;
            Ok(Arc::new(gateway) as Arc<dyn SessionGateway>)
        });

        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(portal.user_agent.clone()),
            ..Default::default()
        })?;

        let rules = match &config.field_rules_path {
            Some(path) => FieldRuleSet::builtin_with_file(path)?,
            None => FieldRuleSet::builtin(),
        };
        let extractor = DocumentExtractor::new(
            Box::new(PdfToText::default()),
            Box::new(TesseractOcr::default().with_languages(config.ocr_languages.clone())),
            rules,
            ConsigneeRules::default(),
        )
        .with_min_text_chars(config.min_text_chars);

        Ok(Self::new(
            gateways,
            Arc::new(PortalDocuments::new(fetcher, portal)),
            store,
            ArtifactStore::new(config.artifacts_dir.clone()),
            RunLog::new(config.run_log_dir.clone()),
            extractor,
            config.discovery(),
        ))
    }

    pub fn store(&self) -> Arc<dyn TenderStore> {
        self.store.clone()
    }

    /// The portal's calendar date `days_back` days before `now`.
    pub fn portal_date(&self, now: DateTime<Utc>, days_back: u32) -> NaiveDate {
        calendar_date_at(now, self.discovery.utc_offset, days_back)
    }

    /// Shared flag; setting it stops the current run before its next document.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub async fn run_pipeline(&self, target_date: NaiveDate) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, %target_date);
        self.run_inner(run_id, target_date).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, target_date: NaiveDate) -> Result<RunSummary> {
        self.cancel.store(false, Ordering::SeqCst);
        let mut summary = RunSummary {
            run_id,
            target_date,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            passes: 0,
            discovered: 0,
            skipped: 0,
            processed: 0,
            failed: 0,
            persisted: 0,
            cancelled: false,
        };
        let mut ctx = RunContext {
            run_id,
            target_date,
            state: RunState::new(),
        };

        let gateway = (self.gateways)().context("building portal gateway")?;
        let session = gateway
            .open_session()
            .await
            .context("opening portal session")?;

        let discovery = DiscoveryConfig {
            target_date,
            ..self.discovery.clone()
        };
        DiscoveryEngine::new(gateway.as_ref(), &discovery)
            .stabilize(&session, &mut ctx.state)
            .await
            .context("discovering tenders")?;
        drop(session);

        summary.passes = ctx.state.passes();
        summary.discovered = ctx.state.len();
        info!(discovered = summary.discovered, passes = summary.passes, "discovery finished");

        let tenders: Vec<DiscoveredTender> = ctx.state.tenders().cloned().collect();
        for tender in &tenders {
            if self.cancel.load(Ordering::SeqCst) {
                let remaining = tenders.len() - summary.skipped - summary.processed;
                warn!(remaining, "run cancelled");
                summary.cancelled = true;
                break;
            }
            let outcome = self.process_tender(&ctx, tender).await?;
            summary.record(outcome);
            if let Err(err) = self
                .run_log
                .append(ctx.target_date, &tender.id, &tender.bid_number, outcome)
                .await
            {
                warn!(error = %err, tender_id = %tender.id, "could not append to run log");
            }
        }

        summary.finished_at = Utc::now();
        info!(
            discovered = summary.discovered,
            skipped = summary.skipped,
            persisted = summary.persisted,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "pipeline run complete"
        );
        Ok(summary)
    }

    /// Per-document failures come back as an outcome; only a failing store
    /// lookup is an error for the whole run.
    async fn process_tender(
        &self,
        ctx: &RunContext,
        tender: &DiscoveredTender,
    ) -> Result<RunLogOutcome> {
        let gate = IdempotencyGate::new(self.store.as_ref(), &self.artifacts);
        if gate.already_processed(&tender.bid_number, &tender.id).await? {
            info!(
                tender_id = %tender.id,
                bid_number = %tender.bid_number,
                "already processed; skipping"
            );
            return Ok(RunLogOutcome::AlreadyProcessed);
        }

        let source_url = self.documents.document_url(&tender.id);
        let bytes = match self.documents.fetch_document(ctx.run_id, &tender.id).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(tender_id = %tender.id, error = %err, "document fetch failed");
                return Ok(RunLogOutcome::FetchFailed);
            }
        };
        let stored = match self.artifacts.store_document(&tender.id, &bytes).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(tender_id = %tender.id, error = %err, "could not store document");
                return Ok(RunLogOutcome::FetchFailed);
            }
        };

        let result = match self
            .extractor
            .extract(&stored.path, &tender.bid_number, &source_url)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                warn!(tender_id = %tender.id, error = %err, "document extraction failed");
                self.discard(&tender.id).await;
                return Ok(RunLogOutcome::ExtractionFailed);
            }
        };

        let record = result.into_tender(tender, Utc::now());
        match self.store.upsert(record).await {
            Ok(saved) => {
                info!(
                    tender_no = %saved.tender_no,
                    content_hash = %stored.content_hash,
                    "tender persisted"
                );
                Ok(RunLogOutcome::Persisted)
            }
            Err(err) => {
                warn!(tender_id = %tender.id, error = %err, "persisting tender failed");
                self.discard(&tender.id).await;
                Ok(RunLogOutcome::PersistFailed)
            }
        }
    }

    async fn discard(&self, tender_id: &str) {
        if let Err(err) = self.artifacts.discard(tender_id).await {
            warn!(tender_id, error = %err, "could not discard artifact");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;

    use chrono::Utc;
    use tenderwatch_documents::{ExtractionError, OcrEngine, TextExtractor};
    use tenderwatch_portal::{PortalError, RawDoc, RawPage, SearchFilters, SessionHandle};
    use tenderwatch_storage::MemoryTenderStore;

    pub fn target() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 5).unwrap()
    }

    pub fn doc(id: u32) -> RawDoc {
        RawDoc {
            id: Some(id.to_string()),
            bid_numbers: vec![format!("GEM/2025/B/{:07}", id)],
            category_tags: vec!["products_hardware".into()],
            start_dates: vec!["2025-03-05T09:00:00Z".into()],
        }
    }

    /// Returns the same single page of docs on every pass.
    pub struct FixedPortal {
        pub docs: Vec<RawDoc>,
        pub session_fails: bool,
    }

    #[async_trait]
    impl SessionGateway for FixedPortal {
        async fn open_session(&self) -> Result<SessionHandle, PortalError> {
            if self.session_fails {
                return Err(PortalError::Session {
                    cookie: "csrf_gem_cookie".into(),
                    url: "https://portal.test/advance-search".into(),
                });
            }
            Ok(SessionHandle {
                token: "token".into(),
                opened_at: Utc::now(),
            })
        }

        async fn search(
            &self,
            _session: &SessionHandle,
            page: u32,
            _filters: &SearchFilters,
        ) -> Result<RawPage, PortalError> {
            let docs = if page == 1 { self.docs.clone() } else { Vec::new() };
            Ok(RawPage {
                num_found: self.docs.len() as u64,
                docs,
            })
        }
    }

    /// Serves a document body per id; ids listed in `failing` return 404 and
    /// ids in `unreadable` come back as bytes no extractor can read.
    /// Optionally raises the cancel flag after the first fetch.
    pub struct FakeDocuments {
        pub failing: Mutex<HashSet<String>>,
        pub unreadable: Mutex<HashSet<String>>,
        pub fetches: Mutex<Vec<String>>,
        pub cancel_after_first: Option<Arc<AtomicBool>>,
    }

    impl FakeDocuments {
        pub fn new() -> Self {
            Self {
                failing: Mutex::new(HashSet::new()),
                unreadable: Mutex::new(HashSet::new()),
                fetches: Mutex::new(Vec::new()),
                cancel_after_first: None,
            }
        }

        pub fn fetch_count(&self) -> usize {
            self.fetches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DocumentSource for FakeDocuments {
        fn document_url(&self, tender_id: &str) -> String {
            format!("https://portal.test/showbidDocument/{tender_id}")
        }

        async fn fetch_document(
            &self,
            _run_id: Uuid,
            tender_id: &str,
        ) -> Result<Vec<u8>, FetchError> {
            self.fetches.lock().unwrap().push(tender_id.to_string());
            if let Some(flag) = &self.cancel_after_first {
                flag.store(true, Ordering::SeqCst);
            }
            if self.failing.lock().unwrap().contains(tender_id) {
                return Err(FetchError::HttpStatus {
                    status: 404,
                    url: self.document_url(tender_id),
                });
            }
            if self.unreadable.lock().unwrap().contains(tender_id) {
                return Ok(UNREADABLE.to_vec());
            }
            Ok(format!("%PDF-1.4 document {tender_id}").into_bytes())
        }
    }

    pub const UNREADABLE: &[u8] = b"\x00\x01 scanned image";

    /// Treats the stored "PDF" bytes as the native text and appends a full
    /// document body, so no OCR is needed. Unreadable bytes fail.
    struct FileText;

    #[async_trait]
    impl TextExtractor for FileText {
        async fn extract_text(&self, path: &Path) -> Result<String, ExtractionError> {
            let raw = tokio::fs::read(path).await?;
            if raw == UNREADABLE {
                return Err(ExtractionError::Native("no text layer".into()));
            }
            let raw = String::from_utf8_lossy(&raw);
            Ok(format!(
                "{raw}\nDated: 05-03-2025\nBid End Date/Time 26-03-2025 15:00:00\n\
                 Item Category Desktop Computers\n\
                 Documents required from seller Experience Criteria, Bidder Turnover\n"
            ))
        }
    }

    struct NoOcr;

    #[async_trait]
    impl OcrEngine for NoOcr {
        async fn recognize_first_page(&self, _path: &Path) -> Result<String, ExtractionError> {
            Err(ExtractionError::Ocr("no ocr in tests".into()))
        }
    }

    pub struct Harness {
        pub pipeline: Pipeline,
        pub store: Arc<MemoryTenderStore>,
        pub documents: Arc<FakeDocuments>,
        pub dir: tempfile::TempDir,
    }

    pub fn harness(portal: FixedPortal, documents: FakeDocuments) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryTenderStore::new());
        let documents = Arc::new(documents);
        let portal: Arc<dyn SessionGateway> = Arc::new(portal);
        let gateways: GatewayFactory = Box::new(move || Ok(portal.clone()));
        let extractor = DocumentExtractor::new(
            Box::new(FileText),
            Box::new(NoOcr),
            FieldRuleSet::builtin(),
            ConsigneeRules::default(),
        )
        .with_min_text_chars(10);
        let discovery = DiscoveryConfig {
            page_retry_delay: Duration::ZERO,
            pass_delay: Duration::ZERO,
            ..DiscoveryConfig::for_date(target())
        };
        let pipeline = Pipeline::new(
            gateways,
            documents.clone(),
            store.clone(),
            ArtifactStore::new(dir.path().join("artifacts")),
            RunLog::new(dir.path().join("logs")),
            extractor,
            discovery,
        );
        Harness {
            pipeline,
            store,
            documents,
            dir,
        }
    }
}
