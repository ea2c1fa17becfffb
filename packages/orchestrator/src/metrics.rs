//! KPI aggregation over the run log and the store.
//!
//! Success/latency numbers come from `run_end` entries; the retry count
//! comes from the event log; staleness comes from live IN_PROGRESS rows.
//! Alerts compare the aggregate against operator thresholds and are
//! advisory unless the caller asks for a failing exit code.

use serde::Serialize;
use serde_json::Value;

use crate::clock::{parse_wall, Clock};
use crate::error::Result;
use crate::events::EventType;
use crate::item::ItemStatus;
use crate::store::{ListFilter, QueueStore};

/// Commands whose `run_end` marks a terminal outcome for an item.
const TERMINAL_COMMANDS: &[&str] = &["done", "fail"];

#[derive(Debug, Clone, Serialize, Default)]
pub struct KpiReport {
    pub source: String,
    pub total_runs: usize,
    pub terminal_runs: usize,
    pub success: usize,
    pub failed: usize,
    pub success_rate: Option<f64>,
    pub latency_avg_ms: Option<f64>,
    pub latency_p95_ms: Option<i64>,
    pub retry_count: Option<i64>,
    pub stale_in_progress: Option<i64>,
}

/// Alert thresholds for [`evaluate_alerts`].
#[derive(Debug, Clone, Copy)]
pub struct KpiThresholds {
    pub max_failure_rate: f64,
    pub max_latency_p95_ms: i64,
    pub max_stale_in_progress: i64,
}

impl Default for KpiThresholds {
    fn default() -> Self {
        Self {
            max_failure_rate: 0.5,
            max_latency_p95_ms: 60_000,
            max_stale_in_progress: 3,
        }
    }
}

fn percentile(sorted: &[i64], p: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() - 1) as f64 * p) as usize;
    sorted[idx]
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Aggregate success rate and latency from run-log entries.
pub fn aggregate_from_log(source: &str, entries: &[Value]) -> KpiReport {
    let run_end: Vec<&Value> = entries
        .iter()
        .filter(|e| e.get("event").and_then(Value::as_str) == Some("run_end"))
        .collect();

    let terminal: Vec<&&Value> = run_end
        .iter()
        .filter(|e| {
            let command = e.get("command").and_then(Value::as_str).unwrap_or("");
            TERMINAL_COMMANDS.contains(&command)
                && e.get("exit_code").and_then(Value::as_i64) == Some(0)
        })
        .collect();
    let success = terminal
        .iter()
        .filter(|e| e.get("command").and_then(Value::as_str) == Some("done"))
        .count();
    let failed = terminal
        .iter()
        .filter(|e| e.get("command").and_then(Value::as_str) == Some("fail"))
        .count();
    let terminal_runs = success + failed;

    let mut durations: Vec<i64> = run_end
        .iter()
        .filter_map(|e| e.get("duration_ms").and_then(Value::as_i64))
        .collect();
    durations.sort_unstable();

    let success_rate = if terminal_runs > 0 {
        Some(round_to(success as f64 / terminal_runs as f64, 4))
    } else {
        None
    };
    let latency_avg_ms = if durations.is_empty() {
        None
    } else {
        let sum: i64 = durations.iter().sum();
        Some(round_to(sum as f64 / durations.len() as f64, 2))
    };
    let latency_p95_ms = if durations.is_empty() {
        None
    } else {
        Some(percentile(&durations, 0.95))
    };

    KpiReport {
        source: source.to_string(),
        total_runs: run_end.len(),
        terminal_runs,
        success,
        failed,
        success_rate,
        latency_avg_ms,
        latency_p95_ms,
        retry_count: None,
        stale_in_progress: None,
    }
}

/// Fill in the store-derived KPI fields: retry count from the event log
/// and the number of IN_PROGRESS rows older than `stale_minutes`.
pub async fn enrich_from_store(
    report: &mut KpiReport,
    store: &QueueStore,
    stale_minutes: i64,
) -> Result<()> {
    report.retry_count = Some(store.count_events(&EventType::Retried).await?);

    let now = store.clock().now_epoch();
    let offset = store.clock().offset();
    let cutoff = now - stale_minutes * 60;

    let in_progress = store.list(ListFilter::status(ItemStatus::InProgress)).await?;
    let stale = in_progress
        .iter()
        .filter(|item| {
            parse_wall(offset, &item.started_at)
                .map(|started| started.timestamp() <= cutoff)
                .unwrap_or(false)
        })
        .count();
    report.stale_in_progress = Some(stale as i64);
    Ok(())
}

/// Compare a report against thresholds; each breach yields one message.
pub fn evaluate_alerts(report: &KpiReport, thresholds: &KpiThresholds) -> Vec<String> {
    let mut alerts = Vec::new();

    if report.terminal_runs > 0 {
        let failure_rate = report.failed as f64 / report.terminal_runs as f64;
        if failure_rate > thresholds.max_failure_rate {
            alerts.push(format!(
                "failure_rate {:.4} exceeds {:.4}",
                failure_rate, thresholds.max_failure_rate
            ));
        }
    }

    if let Some(p95) = report.latency_p95_ms {
        if p95 > thresholds.max_latency_p95_ms {
            alerts.push(format!(
                "latency_p95_ms {} exceeds {}",
                p95, thresholds.max_latency_p95_ms
            ));
        }
    }

    if let Some(stale) = report.stale_in_progress {
        if stale > thresholds.max_stale_in_progress {
            alerts.push(format!(
                "stale_in_progress {} exceeds {}",
                stale, thresholds.max_stale_in_progress
            ));
        }
    }

    alerts
}
