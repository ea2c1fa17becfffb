//! Routes gate verdicts and operator actions into state transitions.
//!
//! Every route is a read-then-write against the store plus one audit
//! event. The notes column is the operator-visible trail: routing only
//! ever appends `review:`/`replan:`/`retry_not_before=` markers to it.

use serde_json::json;
use tracing::info;

use queue_engine::gate::{GateOutcome, Verdict};
use queue_engine::guardrails::{
    check_budget, decide_action, validate_compact_report, GuardrailAction,
};

use crate::clock::Clock;
use crate::error::{Result, StoreError};
use crate::events::EventType;
use crate::item::{append_note, ItemStatus};
use crate::store::QueueStore;

/// Apply a review verdict to an item. Returns the resulting status.
pub async fn route_verdict(
    store: &QueueStore,
    item_id: &str,
    outcome: &GateOutcome,
    max_retries: i64,
) -> Result<ItemStatus> {
    let row = store.get(item_id).await?;

    match outcome.verdict {
        Verdict::Pass => {
            let notes = append_note(
                &row.notes,
                &format!("review:PASS {}", outcome.reasons.join(";")),
            );
            store.mark_done(item_id, &notes).await?;
            store
                .append_event(
                    item_id,
                    EventType::ReviewGate,
                    json!({"verdict": "PASS", "reasons": outcome.reasons}),
                )
                .await?;
            Ok(ItemStatus::Done)
        }
        Verdict::Retry => {
            let attempts = row.attempt_count + 1;
            if attempts > max_retries {
                // A RETRY may not push attempt_count past the cap.
                let reason = format!("retry_limit_reached:{}/{max_retries}", row.attempt_count);
                let notes = append_note(&row.notes, &format!("review:BLOCK {reason}"));
                store.mark_blocked(item_id, &notes).await?;
                store
                    .append_event(
                        item_id,
                        EventType::ReviewGate,
                        json!({"verdict": "BLOCK", "reasons": [reason]}),
                    )
                    .await?;
                return Ok(ItemStatus::Blocked);
            }
            let missing = outcome.missing_checks.join(",");
            let notes = append_note(
                &row.notes,
                &format!("review:RETRY attempt={attempts}/{max_retries} missing={missing}"),
            );
            store
                .reset_to_pending(
                    item_id,
                    &notes,
                    Some(attempts),
                    EventType::ReviewGate,
                    json!({
                        "verdict": "RETRY",
                        "attempt": attempts,
                        "max_retries": max_retries,
                        "missing_checks": outcome.missing_checks,
                    }),
                )
                .await?;
            Ok(ItemStatus::Pending)
        }
        Verdict::Block => {
            let reason = if outcome.reasons.is_empty() {
                "review_gate_blocked".to_string()
            } else {
                outcome.reasons.join(";")
            };
            let notes = append_note(&row.notes, &format!("review:BLOCK {reason}"));
            store.mark_blocked(item_id, &notes).await?;
            store
                .append_event(
                    item_id,
                    EventType::ReviewGate,
                    json!({"verdict": "BLOCK", "reasons": outcome.reasons}),
                )
                .await?;
            Ok(ItemStatus::Blocked)
        }
    }
}

/// Operator cancel: any non-terminal item moves to BLOCKED.
pub async fn operator_cancel(store: &QueueStore, item_id: &str) -> Result<ItemStatus> {
    let row = store.get(item_id).await?;
    if matches!(row.status, ItemStatus::Done | ItemStatus::Failed) {
        return Err(StoreError::InvalidTransition(format!(
            "cannot cancel terminal item: {item_id} ({})",
            row.status
        )));
    }
    let notes = append_note(&row.notes, "cancelled_by_operator");
    store.mark_blocked(item_id, &notes).await?;
    info!(item_id, "cancelled by operator");
    Ok(ItemStatus::Blocked)
}

/// Operator replan: running work is parked as BLOCKED, anything else is
/// sent back to PENDING with owner and lease cleared.
pub async fn operator_replan(store: &QueueStore, item_id: &str, notes: &str) -> Result<ItemStatus> {
    let row = store.get(item_id).await?;
    let merged = append_note(&row.notes, &format!("replan:{}", notes.trim()));

    if row.status == ItemStatus::InProgress {
        store.mark_blocked(item_id, &merged).await?;
        Ok(ItemStatus::Blocked)
    } else {
        store
            .reset_to_pending(
                item_id,
                &merged,
                None,
                EventType::Replan,
                json!({"status": "PENDING", "notes": merged}),
            )
            .await?;
        Ok(ItemStatus::Pending)
    }
}

/// Operator retry: only FAILED items or timed-out IN_PROGRESS items are
/// eligible, and the attempt cap is enforced by rejection rather than
/// clamping.
pub async fn operator_retry(
    store: &QueueStore,
    item_id: &str,
    now_ts: Option<i64>,
    backoff: &[i64],
) -> Result<ItemStatus> {
    let row = store.get(item_id).await?;
    if !row.attempts_remaining() {
        return Err(StoreError::InvalidTransition(format!(
            "max attempts reached: {item_id} ({}/{})",
            row.attempt_count, row.max_attempts
        )));
    }

    let now = now_ts.unwrap_or_else(|| store.clock().now_epoch());
    let timed_out = row.status == ItemStatus::InProgress && row.lease_expired(now);
    if row.status != ItemStatus::Failed && !timed_out {
        return Err(StoreError::InvalidTransition(format!(
            "retry allowed only for FAILED or timed-out IN_PROGRESS: {item_id} ({})",
            row.status
        )));
    }

    let idx = (row.attempt_count as usize).min(backoff.len().saturating_sub(1));
    let delay = backoff.get(idx).copied().unwrap_or(0);
    let notes = append_note(&row.notes, &format!("retry_not_before={}", now + delay));
    store
        .reset_to_pending(
            item_id,
            &notes,
            Some(row.attempt_count + 1),
            EventType::Retried,
            json!({"reason": "operator_retry"}),
        )
        .await?;
    Ok(ItemStatus::Pending)
}

/// Outcome of one guardrail enforcement run.
#[derive(Debug, Clone)]
pub struct GuardrailOutcome {
    pub state: String,
    pub action: GuardrailAction,
    pub violation_count: usize,
    pub estimated_tokens: i64,
}

/// Validate the report, classify the budget, record the decision, and
/// block the item when the policy says so.
pub async fn enforce_guardrails(
    store: &QueueStore,
    item_id: &str,
    report_text: &str,
    current_tokens: i64,
    soft: i64,
    hard: i64,
) -> Result<GuardrailOutcome> {
    let validation = validate_compact_report(report_text);
    let state = check_budget(current_tokens, soft, hard);
    let action = decide_action(state, &validation.violations);

    store
        .append_guardrail_event(
            item_id,
            state.as_str(),
            action.as_str(),
            current_tokens,
            validation.estimated_tokens,
            serde_json::to_value(&validation.violations)?,
        )
        .await?;

    if action == GuardrailAction::Block {
        let reason = format!(
            "Guardrail BLOCK: state={state}; violations={}",
            validation.violations.len()
        );
        store.mark_blocked(item_id, &reason).await?;
        info!(item_id, %state, "guardrail blocked item");
    }

    Ok(GuardrailOutcome {
        state: state.as_str().to_string(),
        action,
        violation_count: validation.violations.len(),
        estimated_tokens: validation.estimated_tokens,
    })
}
