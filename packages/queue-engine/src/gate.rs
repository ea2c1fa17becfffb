//! Deterministic review gate for worker reports.
//!
//! The gate maps `(success_criteria, report_text, attempt_count)` to a
//! [`Verdict`] without any model or network access:
//! - Criteria are split into items and reduced to keyword sets
//! - The report is normalized once and scanned for phrase/keyword coverage
//! - Failure and block markers are matched with their surrounding spaces
//!   so `failed` does not fire on `unfailing`
//!
//! Marker matching is space-sensitive on purpose: the report is
//! whitespace-collapsed first and then padded with a single leading and
//! trailing space, which is what makes line-boundary tokens match.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Final decision for a reviewed report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Retry,
    Block,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Retry => "RETRY",
            Verdict::Block => "BLOCK",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate evaluation result, carried into routing and audit events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    pub verdict: Verdict,
    pub reasons: Vec<String>,
    pub missing_checks: Vec<String>,
    pub covered_checks: usize,
    pub total_checks: usize,
}

const FAILURE_MARKERS: &[&str] = &[
    " fail ",
    " failed",
    " error",
    " exception",
    " incomplete",
    " not done",
    " todo",
    " missing",
];

const BLOCK_MARKERS: &[&str] = &[" blocker", " blocked", " cannot proceed", " escalation"];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "that", "this", "into", "have", "has", "been", "were",
    "was", "will", "shall", "must", "should", "able", "ensure", "verify", "check", "tests", "test",
];

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref WORD: Regex = Regex::new(r"[a-zA-Z0-9_\-/]{3,}").unwrap();
    static ref CRITERIA_SEP: Regex = Regex::new(r"[;\u{2022}]+").unwrap();
}

/// A single success criterion with its extracted keywords.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CriteriaItem {
    raw: String,
    keywords: Vec<String>,
}

/// Lowercase, collapse all whitespace runs to single spaces, then pad with
/// one leading and one trailing space. Markers rely on this exact shape.
fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let collapsed = WHITESPACE.replace_all(&lowered, " ");
    format!(" {} ", collapsed.trim())
}

/// Split free-text criteria into items: one per line, then further split
/// on `;` and `•` separators. Leading bullet dashes are stripped.
fn split_criteria(success_criteria: &str) -> Vec<String> {
    let text = success_criteria.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    for line in text.lines() {
        let line = line.trim_matches(|c| c == ' ' || c == '-' || c == '\t');
        if line.is_empty() {
            continue;
        }
        for part in CRITERIA_SEP.split(line) {
            let part = part.trim();
            if !part.is_empty() {
                chunks.push(part.to_string());
            }
        }
    }
    chunks
}

/// Keyword extraction: word-ish tokens of length >= 4, stopwords removed,
/// de-duplicated in first-seen order, capped at 6 per item.
fn keywords(item: &str) -> Vec<String> {
    let lower = item.to_lowercase();
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for m in WORD.find_iter(&lower) {
        let w = m.as_str();
        if w.len() < 4 || STOPWORDS.contains(&w) {
            continue;
        }
        if seen.insert(w.to_string()) {
            out.push(w.to_string());
        }
        if out.len() == 6 {
            break;
        }
    }
    out
}

fn build_items(success_criteria: &str) -> Vec<CriteriaItem> {
    split_criteria(success_criteria)
        .into_iter()
        .map(|raw| CriteriaItem {
            keywords: keywords(&raw),
            raw,
        })
        .collect()
}

/// A criterion is covered when its normalized phrase appears verbatim in
/// the report, or any of its keywords appears as a whole space-delimited
/// token.
fn is_item_covered(item: &CriteriaItem, normalized_report: &str) -> bool {
    let phrase = normalize(&item.raw);
    if !phrase.trim().is_empty() && normalized_report.contains(&phrase) {
        return true;
    }
    item.keywords
        .iter()
        .any(|kw| normalized_report.contains(&format!(" {kw} ")))
}

fn find_markers(normalized_report: &str, markers: &[&str]) -> Vec<String> {
    markers
        .iter()
        .filter(|m| normalized_report.contains(*m))
        .map(|m| m.trim().to_string())
        .collect()
}

/// Evaluate a worker report against free-text success criteria.
///
/// Verdict rules:
/// - any block marker in the report => `BLOCK`
/// - all criteria covered and no failure markers => `PASS`
/// - otherwise `RETRY`, promoted to `BLOCK` once `attempt_count` has
///   reached `max_retries`
pub fn evaluate_result(
    success_criteria: &str,
    report_text: &str,
    attempt_count: i64,
    max_retries: i64,
) -> GateOutcome {
    let normalized_report = normalize(report_text);
    let items = build_items(success_criteria);

    let mut missing = Vec::new();
    let mut covered = 0usize;
    for item in &items {
        if is_item_covered(item, &normalized_report) {
            covered += 1;
        } else {
            missing.push(item.raw.clone());
        }
    }

    let failure_markers = find_markers(&normalized_report, FAILURE_MARKERS);
    let block_markers = find_markers(&normalized_report, BLOCK_MARKERS);

    let mut reasons = Vec::new();
    let mut verdict = if !block_markers.is_empty() {
        reasons.push(format!("explicit_block_marker:{}", block_markers.join(",")));
        Verdict::Block
    } else if missing.is_empty() && failure_markers.is_empty() {
        reasons.push("all_success_criteria_covered".to_string());
        Verdict::Pass
    } else {
        if !missing.is_empty() {
            reasons.push(format!("missing_checks:{}", missing.len()));
        }
        if !failure_markers.is_empty() {
            reasons.push(format!("failure_markers:{}", failure_markers.join(",")));
        }
        Verdict::Retry
    };

    if verdict == Verdict::Retry && attempt_count >= max_retries {
        verdict = Verdict::Block;
        reasons.push(format!("retry_limit_reached:{attempt_count}/{max_retries}"));
    }

    GateOutcome {
        verdict,
        reasons,
        missing_checks: missing,
        covered_checks: covered,
        total_checks: items.len(),
    }
}

/// Compose a UI smoke result onto a gate outcome.
///
/// A passing UI check only appends a reason. A failing one records
/// `ui_validation` as a missing check and forces at least `RETRY`; a
/// `PASS` never survives a UI failure, and the retry limit still promotes
/// to `BLOCK`.
pub fn apply_ui_gate(
    outcome: GateOutcome,
    ui: &crate::ui::UiResult,
    attempt_count: i64,
    max_retries: i64,
) -> GateOutcome {
    let mut out = outcome;

    if ui.ok {
        out.reasons.push("ui_validation_passed".to_string());
        return out;
    }

    let ui_reasons = if ui.reasons.is_empty() {
        "ui_validation_failed".to_string()
    } else {
        ui.reasons.join(";")
    };
    out.reasons.push(format!("ui:{ui_reasons}"));
    if !out.missing_checks.iter().any(|c| c == "ui_validation") {
        out.missing_checks.push("ui_validation".to_string());
    }

    if out.verdict != Verdict::Block {
        if attempt_count >= max_retries {
            out.verdict = Verdict::Block;
            out.reasons
                .push(format!("retry_limit_reached:{attempt_count}/{max_retries}"));
        } else {
            out.verdict = Verdict::Retry;
        }
    }

    out
}
