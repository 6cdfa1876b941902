//! Declarative field rules for bid documents.
//!
//! Each rule is `(field, matcher, post-process)`. Rules are tried in order and
//! the first rule that yields a value wins for its field, so a new document
//! layout is supported by adding rules rather than touching control flow.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;
use tenderwatch_core::parse_document_date;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    BidNumber,
    StartDate,
    EndDate,
    ItemCategory,
    DocumentsRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcess {
    BidNumber,
    Date,
    Text,
}

impl PostProcess {
    pub fn apply(self, raw: &str) -> Option<String> {
        match self {
            Self::BidNumber => {
                let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
                let upper = compact.to_ascii_uppercase();
                (!upper.is_empty()).then_some(upper)
            }
            Self::Date => {
                let normalized = collapse_whitespace(raw);
                parse_document_date(&normalized).map(|_| normalized)
            }
            Self::Text => {
                let text = collapse_whitespace(raw);
                let text = text
                    .trim_matches(|c: char| c == ':' || c == '-' || c == '/' || c.is_whitespace());
                (!text.is_empty()).then(|| text.to_string())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    pub field: FieldName,
    pub matcher: Regex,
    pub post: PostProcess,
}

impl FieldRule {
    pub fn new(field: FieldName, pattern: &str, post: PostProcess) -> Result<Self, regex::Error> {
        Ok(Self {
            field,
            matcher: Regex::new(pattern)?,
            post,
        })
    }

    /// Capture group 1 when the pattern has one, otherwise the whole match.
    pub fn find(&self, text: &str) -> Option<String> {
        self.matcher.captures_iter(text).find_map(|caps| {
            let raw = caps.get(1).or_else(|| caps.get(0))?.as_str();
            self.post.apply(raw)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedFields {
    pub bid_number: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub item_category: Option<String>,
    pub documents_required: Option<String>,
}

impl ExtractedFields {
    fn slot(&mut self, field: FieldName) -> &mut Option<String> {
        match field {
            FieldName::BidNumber => &mut self.bid_number,
            FieldName::StartDate => &mut self.start_date,
            FieldName::EndDate => &mut self.end_date,
            FieldName::ItemCategory => &mut self.item_category,
            FieldName::DocumentsRequired => &mut self.documents_required,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    field: FieldName,
    pattern: String,
    post: PostProcess,
}

const DATE_TIME: &str = r"(\d{2}-\d{2}-\d{4}(?:\s+\d{2}:\d{2}:\d{2})?)";

#[derive(Debug, Clone)]
pub struct FieldRuleSet {
    rules: Vec<FieldRule>,
}

impl Default for FieldRuleSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FieldRuleSet {
    pub fn new(rules: Vec<FieldRule>) -> Self {
        Self { rules }
    }

    /// Rules for the bilingual GeM bid document, applied after non-ASCII noise
    /// (the Hindi labels) has been blanked out.
    pub fn builtin() -> Self {
        let builtin: [(FieldName, String, PostProcess); 7] = [
            (
                FieldName::BidNumber,
                r"(?i)bid\s*(?:number|no\.?)[^A-Za-z0-9\n]*(GEM\s*/\s*\d{4}\s*/\s*B\s*/\s*\d+)".to_string(),
                PostProcess::BidNumber,
            ),
            (
                FieldName::BidNumber,
                r"(GEM/\d{4}/B/\d+)".to_string(),
                PostProcess::BidNumber,
            ),
            (
                FieldName::StartDate,
                format!(r"(?i)bid\s+start\s+date\s*/\s*time[^0-9\n]*{DATE_TIME}"),
                PostProcess::Date,
            ),
            (
                FieldName::StartDate,
                r"(?i)\bdated\b[^0-9\n]*(\d{2}-\d{2}-\d{4})".to_string(),
                PostProcess::Date,
            ),
            (
                FieldName::EndDate,
                format!(r"(?i)bid\s+end\s+date\s*/\s*time[^0-9\n]*{DATE_TIME}"),
                PostProcess::Date,
            ),
            (
                FieldName::ItemCategory,
                r"(?i)item\s+category[\s/:]*([A-Za-z0-9][^\n]*)".to_string(),
                PostProcess::Text,
            ),
            (
                FieldName::DocumentsRequired,
                r"(?i)documents?\s+required\s+from\s+seller[\s/:]*([A-Za-z0-9][^\n]*)".to_string(),
                PostProcess::Text,
            ),
        ];
        let rules = builtin
            .into_iter()
            .map(|(field, pattern, post)| {
                FieldRule::new(field, &pattern, post).expect("builtin field rule compiles")
            })
            .collect();
        Self { rules }
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let file: RuleFile = serde_yaml::from_str(yaml).context("parsing field rules")?;
        let rules = file
            .rules
            .into_iter()
            .map(|entry| {
                FieldRule::new(entry.field, &entry.pattern, entry.post)
                    .with_context(|| {
                    format!("compiling rule for {:?}: {}", entry.field, entry.pattern)
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Loads extra rules from a YAML file; they take precedence over the
    /// built-in layout rules.
    pub fn builtin_with_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut extra = Self::from_yaml_str(&yaml)
            .with_context(|| format!("loading {}", path.display()))?;
        extra.rules.extend(Self::builtin().rules);
        Ok(extra)
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    pub fn apply(&self, text: &str) -> ExtractedFields {
        let mut fields = ExtractedFields::default();
        for rule in &self.rules {
            let slot = fields.slot(rule.field);
            if slot.is_some() {
                continue;
            }
            *slot = rule.find(text);
        }
        fields
    }
}

static CONTROL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").expect("valid control regex"));

/// Blanks out non-ASCII characters (bilingual labels, bullets, OCR debris)
/// while keeping line structure.
pub fn strip_non_ascii(text: &str) -> String {
    let ascii: String = text
        .replace("\r\n", "\n")
        .replace('\x0C', "\n")
        .chars()
        .map(|c| if c.is_ascii() { c } else { ' ' })
        .collect();
    CONTROL.replace_all(&ascii, " ").into_owned()
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
