//! Consignee address extraction from the "Consignees/Reporting Officer" table.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::rules::strip_non_ascii;

static ITEM_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bitems?\s*[:#-]?\s*\d+\b").expect("valid item regex"));
static NON_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9\s,./()&#-]").expect("valid punctuation regex"));
static SEQUENCE_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{1,3})[.)]?\s+(\S.*)$").expect("valid sequence regex"));

#[derive(Debug, Clone)]
pub struct ConsigneeRules {
    pub block_start: Regex,
    pub block_end: Regex,
    /// Address ends right after a match; the match itself is kept.
    pub terminal_markers: Vec<Regex>,
    /// Address ends right before a match.
    pub boilerplate: Vec<Regex>,
}

impl Default for ConsigneeRules {
    fn default() -> Self {
        let compile = |p: &str| Regex::new(p).expect("builtin consignee pattern compiles");
        Self {
            block_start: compile(r"(?im)^.*consignees?\s*/\s*reporting\s+officer.*$"),
            block_end: compile(
                r"(?im)^.*(buyer\s+added\s+bid\s+specific|bid\s+specific\s+additional|disclaimer|this\s+bid\s+is\s+(also\s+)?governed).*$",
            ),
            terminal_markers: vec![compile(r"(?i)\bpost\s+chirkunda\b")],
            boilerplate: vec![
                compile(r"(?i)buyer\s+added\s+bid\s+specific"),
                compile(r"(?i)\bdisclaimer\b"),
                compile(r"(?i)\*?\s*the\s+consignee\s+mentioned"),
            ],
        }
    }
}

impl ConsigneeRules {
    /// Every consignee block in `text`, each ending at boilerplate or at the
    /// next block header.
    fn blocks<'t>(&self, text: &'t str) -> Vec<&'t str> {
        let starts: Vec<_> = self.block_start.find_iter(text).collect();
        starts
            .iter()
            .enumerate()
            .map(|(i, start)| {
                let from = start.end();
                let next_start = starts.get(i + 1).map_or(text.len(), |m| m.start());
                let until = self
                    .block_end
                    .find_at(text, from)
                    .map_or(next_start, |m| m.start().min(next_start));
                &text[from..until]
            })
            .collect()
    }

    fn truncate<'a>(&self, address: &'a str) -> &'a str {
        let terminal = self
            .terminal_markers
            .iter()
            .filter_map(|re| re.find(address).map(|m| m.end()));
        let boilerplate = self
            .boilerplate
            .iter()
            .filter_map(|re| re.find(address).map(|m| m.start()));
        match terminal.chain(boilerplate).min() {
            Some(cut) => &address[..cut],
            None => address,
        }
    }

    /// Normalizes one candidate address. Returns `None` when nothing
    /// address-like survives.
    pub fn clean_address(&self, raw: &str) -> Option<String> {
        let ascii = strip_non_ascii(raw);
        let truncated = self.truncate(&ascii);
        let without_items = ITEM_COUNT.replace_all(truncated, " ");
        let without_punct = NON_ADDRESS.replace_all(&without_items, " ");
        let kept: Vec<&str> = without_punct
            .split_whitespace()
            .filter(|token| !(token.len() <= 3 && token.chars().all(|c| c.is_ascii_digit())))
            .collect();
        let cleaned = kept.join(" ");
        let cleaned = cleaned.trim_matches(|c: char| matches!(c, ',' | '.' | '-' | '/' | ' '));
        if cleaned.chars().any(|c| c.is_ascii_alphabetic()) {
            Some(cleaned.to_string())
        } else {
            None
        }
    }

    /// Raw address candidates: a line led by a sequence number opens a new
    /// address, following lines are continuations of it.
    pub fn candidate_addresses(&self, text: &str) -> Vec<String> {
        let ascii = strip_non_ascii(text);
        let mut out = Vec::new();
        for block in self.blocks(&ascii) {
            let mut current: Option<String> = None;
            for line in block.lines() {
                let trimmed = line.trim();
                if trimmed.is_empty() || is_table_header(trimmed) {
                    continue;
                }
                if let Some(caps) = SEQUENCE_START.captures(trimmed) {
                    if let Some(done) = current.take() {
                        out.push(done);
                    }
                    current = Some(caps[2].to_string());
                } else if let Some(address) = current.as_mut() {
                    address.push(' ');
                    address.push_str(trimmed);
                }
            }
            out.extend(current);
        }
        out
    }

    /// Every distinct cleaned address, in first-seen order. Callers that keep
    /// only one representative address truncate the result themselves.
    pub fn extract(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.candidate_addresses(text)
            .iter()
            .filter_map(|raw| self.clean_address(raw))
            .filter(|address| seen.insert(address.clone()))
            .collect()
    }
}

fn is_table_header(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("s.no") || (lower.contains("address") && lower.contains("quantity"))
}
