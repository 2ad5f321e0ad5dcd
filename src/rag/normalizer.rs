//! Boilerplate removal for text extracted from policy documents.

use regex::Regex;
use std::sync::LazyLock;

use super::boundary::starts_with_clause_label;

/// Upper-case lines kept because the chunker uses them as section anchors.
const SECTION_HEADERS: &[&str] = &["DEFINITIONS", "EXCLUSIONS", "BENEFITS", "COVERAGE"];

/// Each pattern removes from its match to the end of the line.
static BOILERPLATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // company and policy meta
        r"(?i)\bpremises\s+no\b",
        r"(?i)\bregistered\s+office\b",
        r"(?i)\bpolicy\s+wordings\b",
        // contact blocks
        r"(?i)\btel(?:ephone)?\s*:",
        r"(?i)\btoll[\s-]*free\s*:",
        r"(?i)\bfax\s*:",
        r"(?i)\be-?mail\s*:",
        r"(?i)\bwebsite\s*:",
        // registration numbers
        r"(?i)\b(?:UIN|CIN|PAN|GSTIN)\b\s*(?:no\.?)?\s*[:\-]",
        r"(?i)\bIRDAI?\s+Regn",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

/// Inline extraction artifacts: page/image markers and page-number footers.
static ARTIFACTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[(?:page|image)[^\]]*\]|\bpage\s*\d+(?:\s*of\s*\d+)?\b").expect("static regex")
});

static HORIZONTAL_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{a0}\u{200b}]+").expect("static regex"));

/// Strip boilerplate from raw extracted text. Deterministic and side-effect free.
///
/// Clause labels are never rewritten, and all-caps lines survive only when they are one of the
/// structural section headers or open with a clause label.
pub fn normalize(raw_text: &str) -> String {
    let text = raw_text.replace("\r\n", "\n").replace('\r', "\n");
    let mut kept: Vec<String> = Vec::new();

    for line in text.lines() {
        let line = ARTIFACTS.replace_all(line, "");
        let line = strip_boilerplate(&line);
        let line = HORIZONTAL_WS.replace_all(line, " ");
        let line = line.trim();

        if line.is_empty() {
            continue;
        }
        if is_all_caps(line) && !is_section_header(line) && !starts_with_clause_label(line) {
            continue;
        }
        kept.push(line.to_string());
    }

    kept.join("\n")
}

fn strip_boilerplate(line: &str) -> &str {
    let cut = BOILERPLATE
        .iter()
        .filter_map(|re| re.find(line).map(|m| m.start()))
        .min();
    match cut {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// At least one cased character and no lower-case ones.
fn is_all_caps(line: &str) -> bool {
    let mut has_cased = false;
    for c in line.chars() {
        if c.is_lowercase() {
            return false;
        }
        if c.is_uppercase() {
            has_cased = true;
        }
    }
    has_cased
}

fn is_section_header(line: &str) -> bool {
    let bare = line.trim_end_matches(':').trim();
    SECTION_HEADERS.contains(&bare)
}
