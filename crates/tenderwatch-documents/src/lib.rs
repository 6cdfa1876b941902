//! Bid document pipeline: native text extraction with an OCR fallback,
//! declarative field rules and consignee address extraction.

pub mod consignees;
pub mod rules;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tenderwatch_core::ExtractionResult;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub use consignees::ConsigneeRules;
pub use rules::{
    strip_non_ascii, ExtractedFields, FieldName, FieldRule, FieldRuleSet, PostProcess,
};

pub const CRATE_NAME: &str = "tenderwatch-documents";

pub const DEFAULT_MIN_TEXT_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("native text extraction failed: {0}")]
    Native(String),
    #[error("could not render first page: {0}")]
    Render(String),
    #[error("ocr failed: {0}")]
    Ocr(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, path: &Path) -> Result<String, ExtractionError>;
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize_first_page(&self, path: &Path) -> Result<String, ExtractionError>;
}

/// Poppler's `pdftotext` in layout mode, so table rows stay on one line.
#[derive(Debug, Clone)]
pub struct PdfToText {
    pub binary: PathBuf,
}

impl Default for PdfToText {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("pdftotext"),
        }
    }
}

#[async_trait]
impl TextExtractor for PdfToText {
    async fn extract_text(&self, path: &Path) -> Result<String, ExtractionError> {
        let output = Command::new(&self.binary)
            .arg("-layout")
            .arg(path)
            .arg("-")
            .output()
            .await
            .map_err(|err| ExtractionError::Native(format!("spawning pdftotext: {err}")))?;
        if !output.status.success() {
            return Err(ExtractionError::Native(format!(
                "pdftotext exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Renders page one with `pdftoppm` and reads it back with `tesseract`.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    pub pdftoppm: PathBuf,
    pub tesseract: PathBuf,
    pub languages: String,
    pub dpi: u32,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self {
            pdftoppm: PathBuf::from("pdftoppm"),
            tesseract: PathBuf::from("tesseract"),
            languages: "eng+hin".to_string(),
            dpi: 300,
        }
    }
}

impl TesseractOcr {
    pub fn with_languages(mut self, languages: impl Into<String>) -> Self {
        self.languages = languages.into();
        self
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize_first_page(&self, path: &Path) -> Result<String, ExtractionError> {
        let scratch = tempfile::tempdir()?;
        let prefix = scratch.path().join("page");
        let render = Command::new(&self.pdftoppm)
            .args(["-f", "1", "-l", "1", "-r"])
            .arg(self.dpi.to_string())
            .args(["-png", "-singlefile"])
            .arg(path)
            .arg(&prefix)
            .output()
            .await
            .map_err(|err| ExtractionError::Render(format!("spawning pdftoppm: {err}")))?;
        let image = prefix.with_extension("png");
        if !render.status.success() || !image.exists() {
            return Err(ExtractionError::Render(format!(
                "pdftoppm exited with {}: {}",
                render.status,
                String::from_utf8_lossy(&render.stderr).trim()
            )));
        }

        let ocr = Command::new(&self.tesseract)
            .arg(&image)
            .arg("stdout")
            .arg("-l")
            .arg(&self.languages)
            .output()
            .await
            .map_err(|err| ExtractionError::Ocr(format!("spawning tesseract: {err}")))?;
        if !ocr.status.success() {
            return Err(ExtractionError::Ocr(format!(
                "tesseract exited with {}: {}",
                ocr.status,
                String::from_utf8_lossy(&ocr.stderr).trim()
            )));
        }
        let text = String::from_utf8_lossy(&ocr.stdout).into_owned();
        if text.trim().is_empty() {
            return Err(ExtractionError::Ocr("no text recognized on page one".into()));
        }
        Ok(text)
    }
}

/// True when native text is too thin to be the real document body.
pub fn needs_ocr(text: &str, min_text_chars: usize) -> bool {
    text.trim().chars().count() < min_text_chars || !text.chars().any(char::is_alphanumeric)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingText {
    pub text: String,
    pub used_ocr: bool,
}

pub struct DocumentExtractor {
    text: Box<dyn TextExtractor>,
    ocr: Box<dyn OcrEngine>,
    rules: FieldRuleSet,
    consignees: ConsigneeRules,
    min_text_chars: usize,
}

impl DocumentExtractor {
    pub fn new(
        text: Box<dyn TextExtractor>,
        ocr: Box<dyn OcrEngine>,
        rules: FieldRuleSet,
        consignees: ConsigneeRules,
    ) -> Self {
        Self {
            text,
            ocr,
            rules,
            consignees,
            min_text_chars: DEFAULT_MIN_TEXT_CHARS,
        }
    }

    pub fn with_min_text_chars(mut self, min_text_chars: usize) -> Self {
        self.min_text_chars = min_text_chars;
        self
    }

    pub async fn working_text(&self, path: &Path) -> Result<WorkingText, ExtractionError> {
        match self.text.extract_text(path).await {
            Ok(text) if !needs_ocr(&text, self.min_text_chars) => {
                return Ok(WorkingText {
                    text,
                    used_ocr: false,
                })
            }
            Ok(text) => debug!(
                path = %path.display(),
                chars = text.trim().chars().count(),
                "native text too thin, falling back to ocr"
            ),
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "native extraction failed, falling back to ocr"
            ),
        }
        let text = self.ocr.recognize_first_page(path).await?;
        Ok(WorkingText {
            text,
            used_ocr: true,
        })
    }

    /// Field and consignee extraction over already-obtained text. The caller's
    /// bid number wins over whatever the document claims.
    pub fn extract_fields(
        &self,
        working: WorkingText,
        bid_number: &str,
        source_url: &str,
    ) -> ExtractionResult {
        let clean = strip_non_ascii(&working.text);
        let fields = self.rules.apply(&clean);
        if let Some(found) = fields.bid_number.as_deref() {
            if found != bid_number {
                warn!(expected = bid_number, found, "bid number in document does not match");
            }
        }
        ExtractionResult {
            bid_number: bid_number.to_string(),
            start_date: fields.start_date,
            end_date: fields.end_date,
            item_category: fields.item_category,
            documents_required: fields.documents_required,
            consignees: self.consignees.extract(&working.text),
            source_url: source_url.to_string(),
            used_ocr: working.used_ocr,
        }
    }

    pub async fn extract(
        &self,
        path: &Path,
        bid_number: &str,
        source_url: &str,
    ) -> Result<ExtractionResult, ExtractionError> {
        let working = self.working_text(path).await?;
        let result = self.extract_fields(working, bid_number, source_url);
        info!(
            bid_number,
            used_ocr = result.used_ocr,
            consignees = result.consignees.len(),
            "document extracted"
        );
        Ok(result)
    }
}
