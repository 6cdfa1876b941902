use std::path::Path;

use async_trait::async_trait;
use tenderwatch_documents::{
    ConsigneeRules, DocumentExtractor, ExtractionError, FieldRuleSet, OcrEngine, TextExtractor,
};

struct FixtureText;

#[async_trait]
impl TextExtractor for FixtureText {
    async fn extract_text(&self, path: &Path) -> Result<String, ExtractionError> {
        Ok(tokio::fs::read_to_string(path).await?)
    }
}

struct UnusedOcr;

#[async_trait]
impl OcrEngine for UnusedOcr {
    async fn recognize_first_page(&self, _path: &Path) -> Result<String, ExtractionError> {
        panic!("layout text is rich enough; ocr must not run");
    }
}

fn fixture() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/bid_document.txt")
}

#[tokio::test]
async fn layout_text_fixture_extracts_every_field() {
    let extractor = DocumentExtractor::new(
        Box::new(FixtureText),
        Box::new(UnusedOcr),
        FieldRuleSet::builtin(),
        ConsigneeRules::default(),
    );
    let result = extractor
        .extract(
            &fixture(),
            "GEM/2025/B/6034567",
            "https://bidplus.gem.gov.in/showbidDocument/7712345",
        )
        .await
        .expect("fixture extracts");

    assert!(!result.used_ocr);
    assert_eq!(result.start_date.as_deref(), Some("05-03-2025"));
    assert_eq!(result.end_date.as_deref(), Some("26-03-2025 15:00:00"));
    assert_eq!(
        result.item_category.as_deref(),
        Some("Multifunction Machines MFM (Q2)")
    );
    assert_eq!(
        result.documents_required.as_deref(),
        Some("Experience Criteria,Bidder Turnover,Certificate (Requested in ATC),OEM Authorization Certificate")
    );
    assert_eq!(
        result.consignees,
        vec![
            "Sanjay Prasad 828303,DVC Chandrapura Thermal Power Station, Post Chandrapura",
            "Meena Kumari 828306,CTPS Colony, Near Rly Station, Post Chirkunda",
        ]
    );
}
