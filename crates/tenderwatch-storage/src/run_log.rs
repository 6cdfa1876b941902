//! Per-day audit trail of the remote ids a run touched. Write-only; the
//! pipeline never reads it back.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLogOutcome {
    Persisted,
    AlreadyProcessed,
    FetchFailed,
    ExtractionFailed,
    PersistFailed,
}

impl fmt::Display for RunLogOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Persisted => "persisted",
            Self::AlreadyProcessed => "already_processed",
            Self::FetchFailed => "fetch_failed",
            Self::ExtractionFailed => "extraction_failed",
            Self::PersistFailed => "persist_failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_date: NaiveDate) -> PathBuf {
        self.dir.join(format!("run-{}.log", run_date.format("%Y-%m-%d")))
    }

    pub async fn append(
        &self,
        run_date: NaiveDate,
        tender_id: &str,
        bid_number: &str,
        outcome: RunLogOutcome,
    ) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating run log directory {}", self.dir.display()))?;
        let path = self.path_for(run_date);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening run log {}", path.display()))?;
        let line = format!(
            "{}\t{}\t{}\t{}\n",
            Utc::now().to_rfc3339(),
            tender_id,
            bid_number,
            outcome
        );
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to run log {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing run log {}", path.display()))
    }
}
