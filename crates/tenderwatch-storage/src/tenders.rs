use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tenderwatch_core::Tender;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Tender record store keyed by bid number.
///
/// `upsert` is first-write-wins: when `tender_no` already exists the stored
/// record is returned unchanged and no error is raised, so two runs racing on
/// the same tender both succeed.
#[async_trait]
pub trait TenderStore: Send + Sync {
    async fn find_by_tender_no(&self, tender_no: &str) -> Result<Option<Tender>, StoreError>;

    async fn upsert(&self, tender: Tender) -> Result<Tender, StoreError>;

    /// Newest first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Tender>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgTenderStore {
    pool: PgPool,
}

const TENDER_COLUMNS: &str = "tender_no, title, category, start_date, end_date, \
     documents_required, document_download_links, consignees, created_at, updated_at";

impl PgTenderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("tender schema migrations applied");
        Ok(())
    }
}

fn tender_from_row(row: &PgRow) -> Result<Tender, sqlx::Error> {
    Ok(Tender {
        tender_no: row.try_get("tender_no")?,
        title: row.try_get("title")?,
        category: row.try_get("category")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        documents_required: row.try_get("documents_required")?,
        document_download_links: row.try_get("document_download_links")?,
        consignees: row.try_get("consignees")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TenderStore for PgTenderStore {
    async fn find_by_tender_no(&self, tender_no: &str) -> Result<Option<Tender>, StoreError> {
        let sql = format!("SELECT {TENDER_COLUMNS} FROM tenders WHERE tender_no = $1");
        let row = sqlx::query(&sql)
            .bind(tender_no)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(tender_from_row).transpose()?)
    }

    async fn upsert(&self, tender: Tender) -> Result<Tender, StoreError> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let sql = format!(
            r#"
            INSERT INTO tenders ({TENDER_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (tender_no) DO UPDATE SET tender_no = tenders.tender_no
            RETURNING {TENDER_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&tender.tender_no)
            .bind(&tender.title)
            .bind(&tender.category)
            .bind(tender.start_date)
            .bind(tender.end_date)
            .bind(&tender.documents_required)
            .bind(&tender.document_download_links)
            .bind(&tender.consignees)
            .bind(tender.created_at)
            .bind(tender.updated_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(tender_from_row(&row)?)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Tender>, StoreError> {
        let sql = format!("SELECT {TENDER_COLUMNS} FROM tenders ORDER BY created_at DESC LIMIT $1");
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(tender_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }
}

/// Process-local store used by tests and by `run --dry-store`.
#[derive(Debug, Default)]
pub struct MemoryTenderStore {
    tenders: Mutex<BTreeMap<String, Tender>>,
}

impl MemoryTenderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tenders.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tenders.lock().await.is_empty()
    }
}

#[async_trait]
impl TenderStore for MemoryTenderStore {
    async fn find_by_tender_no(&self, tender_no: &str) -> Result<Option<Tender>, StoreError> {
        Ok(self.tenders.lock().await.get(tender_no).cloned())
    }

    async fn upsert(&self, tender: Tender) -> Result<Tender, StoreError> {
        let mut tenders = self.tenders.lock().await;
        Ok(tenders
            .entry(tender.tender_no.clone())
            .or_insert(tender)
            .clone())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Tender>, StoreError> {
        let mut all: Vec<Tender> = self.tenders.lock().await.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        Ok(all)
    }
}
