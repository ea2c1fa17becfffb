//! # queue-engine
//!
//! Policy layer for the task orchestrator: the pure decision functions
//! that sit between a worker's output and the durable queue.
//!
//! - [`gate`] - criteria-coverage review gate producing PASS/RETRY/BLOCK
//! - [`guardrails`] - compact-report structure checks and the token
//!   budget state machine (ALLOW/SUMMARIZE/BLOCK)
//! - [`ui`] - the UI smoke collaborator contract with an injectable
//!   subprocess runner
//!
//! Nothing in this crate touches storage; verdicts and actions are data
//! that the orchestrator crate routes into state transitions. That split
//! keeps every decision here deterministic and unit-testable.

pub mod gate;
pub mod guardrails;
pub mod ui;

pub use gate::{apply_ui_gate, evaluate_result, GateOutcome, Verdict};
pub use guardrails::{
    check_budget, decide_action, estimate_tokens, validate_compact_report, BudgetState,
    GuardrailAction, ReportValidation, Severity, Violation,
};
pub use ui::{CommandRunner, SubprocessRunner, UiResult, UiSmoke};
