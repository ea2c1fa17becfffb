//! Compact-report structure checks and the token budget state machine.
//!
//! Workers hand back a fixed-section compact report instead of raw logs.
//! [`validate_compact_report`] checks the shape, [`check_budget`] classifies
//! the current token spend, and [`decide_action`] combines the two into
//! ALLOW / SUMMARIZE / BLOCK.
//!
//! Token estimation is `ceil(chars / 4)`: a deterministic heuristic, no
//! model or network access.

use serde::{Deserialize, Serialize};

const REQUIRED_SECTIONS: &[&str] = &[
    "Status:",
    "Files:",
    "Diff-Summary:",
    "Validation:",
    "Risks:",
    "Next:",
];

const MAX_REPORT_CHARS: usize = 8000;
const MAX_BULLETS: usize = 10;

pub const DEFAULT_SOFT_LIMIT: i64 = 2000;
pub const DEFAULT_HARD_LIMIT: i64 = 3500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
}

/// A single report-policy violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub code: String,
    pub message: String,
    pub severity: Severity,
}

impl Violation {
    fn new(code: &str, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            severity,
        }
    }
}

/// Outcome of the structural report check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportValidation {
    pub ok: bool,
    pub violations: Vec<Violation>,
    pub estimated_tokens: i64,
}

/// Token budget classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetState {
    Ok,
    SoftExceeded,
    HardExceeded,
}

impl BudgetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetState::Ok => "OK",
            BudgetState::SoftExceeded => "SOFT_EXCEEDED",
            BudgetState::HardExceeded => "HARD_EXCEEDED",
        }
    }
}

impl std::fmt::Display for BudgetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guardrail decision combining report violations and budget state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardrailAction {
    Allow,
    Summarize,
    Block,
}

impl GuardrailAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailAction::Allow => "ALLOW",
            GuardrailAction::Summarize => "SUMMARIZE",
            GuardrailAction::Block => "BLOCK",
        }
    }
}

impl std::fmt::Display for GuardrailAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `ceil(char_count / 4)` as a rough upper estimate for mixed text.
pub fn estimate_tokens(text: &str) -> i64 {
    let chars = text.chars().count() as i64;
    (chars + 3) / 4
}

/// Structural check of a compact worker report.
///
/// Required shape: `[REPORT <task-id>]` header on the first non-empty
/// line, the six sections in order, at least one bullet each under
/// `Files:` and `Diff-Summary:`, no code fences, at most 8000 chars and
/// 10 bullets overall.
pub fn validate_compact_report(text: &str) -> ReportValidation {
    let mut violations = Vec::new();
    let estimated_tokens = estimate_tokens(text);

    let lines: Vec<&str> = text.lines().collect();
    let non_empty: Vec<&str> = lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();

    if non_empty.is_empty() {
        violations.push(Violation::new("EMPTY", "report is empty", Severity::High));
    } else {
        let first = non_empty[0];
        if !(first.starts_with("[REPORT ") && first.ends_with(']')) {
            violations.push(Violation::new(
                "MISSING_REPORT_HEADER",
                "first line must be [REPORT <task-id>]",
                Severity::High,
            ));
        }
    }

    if text.contains("```") {
        violations.push(Violation::new(
            "CODE_FENCE_FORBIDDEN",
            "full code/log paste is forbidden in compact report",
            Severity::High,
        ));
    }
    if text.chars().count() > MAX_REPORT_CHARS {
        violations.push(Violation::new(
            "REPORT_TOO_LONG",
            "report text too long for compact policy",
            Severity::High,
        ));
    }

    // First occurrence index per section.
    let mut section_indices: Vec<Option<usize>> = vec![None; REQUIRED_SECTIONS.len()];
    for (idx, line) in lines.iter().enumerate() {
        let stripped = line.trim();
        for (si, sec) in REQUIRED_SECTIONS.iter().enumerate() {
            if stripped.starts_with(sec) && section_indices[si].is_none() {
                section_indices[si] = Some(idx);
            }
        }
    }

    for (si, sec) in REQUIRED_SECTIONS.iter().enumerate() {
        if section_indices[si].is_none() {
            violations.push(Violation::new(
                "MISSING_SECTION",
                format!("missing required section: {sec}"),
                Severity::High,
            ));
        }
    }

    // Order check only over the sections that are present.
    let mut last = -1i64;
    for (si, sec) in REQUIRED_SECTIONS.iter().enumerate() {
        if let Some(cur) = section_indices[si] {
            if (cur as i64) < last {
                violations.push(Violation::new(
                    "SECTION_ORDER",
                    format!("section out of order: {sec}"),
                    Severity::Medium,
                ));
            }
            last = cur as i64;
        }
    }

    let bullet_count = lines
        .iter()
        .filter(|l| l.trim_start().starts_with("- "))
        .count();
    if bullet_count > MAX_BULLETS {
        violations.push(Violation::new(
            "TOO_MANY_BULLETS",
            "bullet count exceeds policy recommendation (10)",
            Severity::Medium,
        ));
    }

    let section_has_bullet = |si: usize| -> bool {
        let Some(start) = section_indices[si] else {
            return false;
        };
        let mut end = lines.len();
        for other in section_indices.iter().flatten() {
            if *other > start {
                end = end.min(*other);
            }
        }
        lines[start + 1..end]
            .iter()
            .any(|l| l.trim_start().starts_with("- "))
    };

    // Files: and Diff-Summary: each need at least one bullet.
    if section_indices[1].is_some() && !section_has_bullet(1) {
        violations.push(Violation::new(
            "FILES_EMPTY",
            "Files section must contain at least one bullet path",
            Severity::High,
        ));
    }
    if section_indices[2].is_some() && !section_has_bullet(2) {
        violations.push(Violation::new(
            "DIFF_SUMMARY_EMPTY",
            "Diff-Summary section must contain at least one bullet",
            Severity::High,
        ));
    }

    ReportValidation {
        ok: violations.is_empty(),
        violations,
        estimated_tokens,
    }
}

/// Classify the current token spend. Equality with the soft limit is
/// still OK; equality with the hard limit is SOFT_EXCEEDED.
pub fn check_budget(current_tokens: i64, soft: i64, hard: i64) -> BudgetState {
    if current_tokens > hard {
        BudgetState::HardExceeded
    } else if current_tokens > soft {
        BudgetState::SoftExceeded
    } else {
        BudgetState::Ok
    }
}

/// Combine the budget state and report violations into one action.
pub fn decide_action(state: BudgetState, violations: &[Violation]) -> GuardrailAction {
    let has_severe = violations.iter().any(|v| v.severity == Severity::High);
    if state == BudgetState::HardExceeded || has_severe {
        GuardrailAction::Block
    } else if state == BudgetState::SoftExceeded || !violations.is_empty() {
        GuardrailAction::Summarize
    } else {
        GuardrailAction::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_report() -> String {
        [
            "[REPORT ORCH-001]",
            "Status: done",
            "Files:",
            "- src/main.rs",
            "Diff-Summary:",
            "- added retry loop",
            "Validation: unit tests pass",
            "Risks: none",
            "Next: nothing",
        ]
        .join("\n")
    }

    fn codes(v: &ReportValidation) -> Vec<&str> {
        v.violations.iter().map(|v| v.code.as_str()).collect()
    }

    #[test]
    fn valid_report_has_no_violations() {
        let v = validate_compact_report(&valid_report());
        assert!(v.ok, "unexpected violations: {:?}", v.violations);
    }

    #[test]
    fn empty_report_is_high_violation() {
        let v = validate_compact_report("   \n  ");
        assert!(codes(&v).contains(&"EMPTY"));
    }

    #[test]
    fn missing_header_detected() {
        let report = valid_report().replace("[REPORT ORCH-001]", "report for ORCH-001");
        let v = validate_compact_report(&report);
        assert!(codes(&v).contains(&"MISSING_REPORT_HEADER"));
    }

    #[test]
    fn code_fence_forbidden() {
        let report = format!("{}\n```\nlet x = 1;\n```", valid_report());
        let v = validate_compact_report(&report);
        assert!(codes(&v).contains(&"CODE_FENCE_FORBIDDEN"));
    }

    #[test]
    fn missing_section_detected() {
        let report = valid_report().replace("Risks: none\n", "");
        let v = validate_compact_report(&report);
        assert!(codes(&v).contains(&"MISSING_SECTION"));
    }

    #[test]
    fn section_order_violation_is_medium() {
        let report = [
            "[REPORT ORCH-001]",
            "Files:",
            "- src/main.rs",
            "Status: done",
            "Diff-Summary:",
            "- change",
            "Validation: ok",
            "Risks: none",
            "Next: nothing",
        ]
        .join("\n");
        let v = validate_compact_report(&report);
        let order = v
            .violations
            .iter()
            .find(|v| v.code == "SECTION_ORDER")
            .expect("order violation");
        assert_eq!(order.severity, Severity::Medium);
    }

    #[test]
    fn files_without_bullet_flagged() {
        let report = [
            "[REPORT ORCH-001]",
            "Status: done",
            "Files: none",
            "Diff-Summary:",
            "- change",
            "Validation: ok",
            "Risks: none",
            "Next: nothing",
        ]
        .join("\n");
        let v = validate_compact_report(&report);
        assert!(codes(&v).contains(&"FILES_EMPTY"));
    }

    #[test]
    fn too_many_bullets_flagged() {
        let bullets: Vec<String> = (0..11).map(|i| format!("- item {i}")).collect();
        let report = format!("{}\n{}", valid_report(), bullets.join("\n"));
        let v = validate_compact_report(&report);
        assert!(codes(&v).contains(&"TOO_MANY_BULLETS"));
    }

    #[test]
    fn long_report_flagged() {
        let report = format!("{}\n{}", valid_report(), "x".repeat(8000));
        let v = validate_compact_report(&report);
        assert!(codes(&v).contains(&"REPORT_TOO_LONG"));
    }

    #[test]
    fn estimate_is_ceil_div_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn budget_boundaries() {
        assert_eq!(check_budget(1999, 2000, 3500), BudgetState::Ok);
        assert_eq!(check_budget(2000, 2000, 3500), BudgetState::Ok);
        assert_eq!(check_budget(2001, 2000, 3500), BudgetState::SoftExceeded);
        assert_eq!(check_budget(3500, 2000, 3500), BudgetState::SoftExceeded);
        assert_eq!(check_budget(3501, 2000, 3500), BudgetState::HardExceeded);
    }

    #[test]
    fn hard_exceeded_blocks() {
        assert_eq!(
            decide_action(BudgetState::HardExceeded, &[]),
            GuardrailAction::Block
        );
    }

    #[test]
    fn high_violation_blocks_even_when_ok() {
        let v = vec![Violation::new("EMPTY", "report is empty", Severity::High)];
        assert_eq!(decide_action(BudgetState::Ok, &v), GuardrailAction::Block);
    }

    #[test]
    fn medium_violation_summarizes() {
        let v = vec![Violation::new("SECTION_ORDER", "out of order", Severity::Medium)];
        assert_eq!(
            decide_action(BudgetState::Ok, &v),
            GuardrailAction::Summarize
        );
    }

    #[test]
    fn soft_exceeded_summarizes() {
        assert_eq!(
            decide_action(BudgetState::SoftExceeded, &[]),
            GuardrailAction::Summarize
        );
    }

    #[test]
    fn clean_report_in_budget_allows() {
        assert_eq!(decide_action(BudgetState::Ok, &[]), GuardrailAction::Allow);
    }
}
