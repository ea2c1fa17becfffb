//! Orchestrator CLI.
//!
//! One binary, cron-friendly subcommands. Every run is bracketed by
//! `run_start`/`run_end` entries in the JSONL run log; operational
//! errors print a single `ERROR: <message>` line and exit 1. KPI alerts
//! escalate to exit 2 only with `--fail-on-alert`.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orchestrator_core::clock::{Clock, SystemClock};
use orchestrator_core::config::Config;
use orchestrator_core::item::{ItemStatus, NewItem, Priority};
use orchestrator_core::metrics::{self, KpiThresholds};
use orchestrator_core::ops;
use orchestrator_core::router;
use orchestrator_core::runlog;
use orchestrator_core::store::{ListFilter, QueueStore};
use orchestrator_core::view::{self, ViewFile};
use orchestrator_core::watchdog;
use queue_engine::gate;
use queue_engine::ui::{SubprocessRunner, UiSmoke};

#[derive(Parser)]
#[command(name = "orch")]
#[command(about = "Persistent task orchestrator: durable queue, leases, retries, review gate")]
struct Cli {
    /// Override ORCH_DB_PATH
    #[arg(long, global = true)]
    store_path: Option<PathBuf>,

    /// Override ORCH_VIEW_PATH
    #[arg(long, global = true)]
    view_path: Option<PathBuf>,

    /// Override ORCH_LOG_PATH
    #[arg(long, global = true)]
    log_path: Option<PathBuf>,

    /// Trace id for this run (default: auto-generated)
    #[arg(long, global = true)]
    trace_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue item operations
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Operator commands
    Ops {
        #[command(subcommand)]
        command: OpsCommands,
    },

    /// Pick one eligible item (cron entrypoint); prints id or NOOP
    Dispatcher {
        #[arg(long, default_value = "dispatcher")]
        owner_session: String,
    },

    /// Sweep failed and stale work; prints RESET <csv> or NOOP
    Watchdog {
        #[arg(long)]
        stale_minutes: Option<i64>,
    },

    /// Review a worker report against success criteria and route the item
    ReviewAndRoute {
        #[arg(long)]
        id: String,
        #[arg(long)]
        success_criteria: String,
        /// Report text, or a path to a file containing it
        #[arg(long)]
        report: String,
        #[arg(long, default_value_t = 3)]
        max_retries: i64,
        /// Optional URL for UI smoke validation
        #[arg(long)]
        ui_url: Option<String>,
        /// Required terms in the UI snapshot (repeatable)
        #[arg(long = "ui-contains")]
        ui_contains: Vec<String>,
        /// UI smoke timeout in seconds
        #[arg(long = "ui-timeout", default_value_t = 45)]
        ui_timeout_seconds: u64,
        #[arg(long)]
        ui_session: Option<String>,
    },

    /// Check a compact report against report/token guardrails
    EnforceGuardrails {
        #[arg(long)]
        id: String,
        /// Path to the compact report text file
        #[arg(long)]
        report: PathBuf,
        #[arg(long)]
        current_tokens: i64,
        #[arg(long)]
        soft: Option<i64>,
        #[arg(long)]
        hard: Option<i64>,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Add a queue item
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        priority: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        success_criteria: String,
        #[arg(long)]
        due: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        idempotency_key: Option<String>,
        #[arg(long)]
        max_attempts: Option<i64>,
    },

    /// List queue items
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        priority: Option<String>,
    },

    /// Pick the next pending item; prints id or "No pending tasks"
    Pick {
        #[arg(long)]
        owner_session: Option<String>,
    },

    /// Mark an item done
    Done {
        #[arg(long)]
        id: String,
        #[arg(long)]
        notes: String,
    },

    /// Mark an item failed
    Fail {
        #[arg(long)]
        id: String,
        #[arg(long)]
        notes: String,
    },
}

#[derive(Subcommand)]
enum OpsCommands {
    /// Summary by status plus top in-progress rows
    Status,

    /// Owner-session distribution of in-progress items
    Workers,

    /// Cancel an active item (moves to BLOCKED)
    Cancel {
        #[arg(long)]
        id: String,
    },

    /// Apply a replan note and status transition
    Replan {
        #[arg(long)]
        id: String,
        #[arg(long)]
        notes: String,
    },

    /// Move an eligible item back to PENDING
    Retry {
        #[arg(long)]
        id: String,
    },

    /// Rebuild the tabular view from the store
    RenderView,

    /// Compare the tabular view against the store
    ConsistencyCheck,

    /// Aggregate KPIs from the run log and the store
    Kpi {
        #[arg(long)]
        max_failure_rate: Option<f64>,
        #[arg(long)]
        max_latency_p95_ms: Option<i64>,
        #[arg(long)]
        max_stale_in_progress: Option<i64>,
        #[arg(long)]
        stale_minutes: Option<i64>,
        /// Exit with code 2 when any alert fires
        #[arg(long)]
        fail_on_alert: bool,
    },
}

/// Leaf command name recorded in the run log (the KPI aggregator keys
/// off "done"/"fail").
fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Queue { command } => match command {
            QueueCommands::Add { .. } => "add",
            QueueCommands::List { .. } => "list",
            QueueCommands::Pick { .. } => "pick",
            QueueCommands::Done { .. } => "done",
            QueueCommands::Fail { .. } => "fail",
        },
        Commands::Ops { command } => match command {
            OpsCommands::Status => "status",
            OpsCommands::Workers => "workers",
            OpsCommands::Cancel { .. } => "cancel",
            OpsCommands::Replan { .. } => "replan",
            OpsCommands::Retry { .. } => "retry",
            OpsCommands::RenderView => "render-view",
            OpsCommands::ConsistencyCheck => "consistency-check",
            OpsCommands::Kpi { .. } => "kpi",
        },
        Commands::Dispatcher { .. } => "dispatcher",
        Commands::Watchdog { .. } => "watchdog",
        Commands::ReviewAndRoute { .. } => "review-and-route",
        Commands::EnforceGuardrails { .. } => "enforce-guardrails",
    }
}

struct RunOutcome {
    exit_code: i32,
    item_id: Option<String>,
}

impl RunOutcome {
    fn ok() -> Self {
        Self {
            exit_code: 0,
            item_id: None,
        }
    }

    fn with_item(item_id: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            item_id: Some(item_id.into()),
        }
    }
}

/// `--report` accepts either inline text or a file path.
fn read_report_arg(report: &str) -> String {
    let path = std::path::Path::new(report);
    if path.is_file() {
        std::fs::read_to_string(path).unwrap_or_else(|_| report.to_string())
    } else {
        report.to_string()
    }
}

async fn run(
    command: Commands,
    config: &Config,
    store: &QueueStore,
    view_path: &PathBuf,
    log_path: &PathBuf,
) -> Result<RunOutcome> {
    match command {
        Commands::Queue { command } => run_queue(command, store).await,
        Commands::Ops { command } => run_ops(command, config, store, view_path, log_path).await,
        Commands::Dispatcher { owner_session } => {
            match store.pick_next(&owner_session).await? {
                Some(item) => {
                    println!("{}", item.id);
                    Ok(RunOutcome::with_item(item.id))
                }
                None => {
                    println!("NOOP");
                    Ok(RunOutcome::ok())
                }
            }
        }
        Commands::Watchdog { stale_minutes } => {
            let stale = stale_minutes.unwrap_or(watchdog::DEFAULT_STALE_MINUTES);
            let reset = watchdog::sweep(store, stale).await?;
            if reset.is_empty() {
                println!("NOOP");
            } else {
                println!("RESET {}", reset.join(","));
            }
            Ok(RunOutcome::ok())
        }
        Commands::ReviewAndRoute {
            id,
            success_criteria,
            report,
            max_retries,
            ui_url,
            ui_contains,
            ui_timeout_seconds,
            ui_session,
        } => {
            let report_text = read_report_arg(&report);
            let row = store.get(&id).await?;

            let mut outcome =
                gate::evaluate_result(&success_criteria, &report_text, row.attempt_count, max_retries);

            if let Some(url) = ui_url {
                let smoke = UiSmoke::new(Arc::new(SubprocessRunner));
                let ui_result = smoke
                    .validate(&url, &ui_contains, ui_timeout_seconds, ui_session.as_deref())
                    .await;
                outcome = gate::apply_ui_gate(outcome, &ui_result, row.attempt_count, max_retries);
            }

            let status = router::route_verdict(store, &id, &outcome, max_retries).await?;
            println!("{id} -> {status} ({})", outcome.verdict);
            Ok(RunOutcome::with_item(id))
        }
        Commands::EnforceGuardrails {
            id,
            report,
            current_tokens,
            soft,
            hard,
        } => {
            let report_text = std::fs::read_to_string(&report)
                .with_context(|| format!("cannot read report file: {}", report.display()))?;
            let outcome = router::enforce_guardrails(
                store,
                &id,
                &report_text,
                current_tokens,
                soft.unwrap_or(config.token_soft_limit),
                hard.unwrap_or(config.token_hard_limit),
            )
            .await?;
            println!(
                "item={id} state={} action={} violations={}",
                outcome.state, outcome.action, outcome.violation_count
            );
            Ok(RunOutcome::with_item(id))
        }
    }
}

async fn run_queue(command: QueueCommands, store: &QueueStore) -> Result<RunOutcome> {
    match command {
        QueueCommands::Add {
            id,
            priority,
            task,
            success_criteria,
            due,
            notes,
            idempotency_key,
            max_attempts,
        } => {
            let priority = Priority::from_str(&priority)?;
            let mut new = NewItem::new(id.clone(), priority, task)
                .success_criteria(success_criteria)
                .due_at(due.unwrap_or_else(|| "-".to_string()))
                .notes(notes.unwrap_or_default());
            if let Some(key) = idempotency_key {
                new = new.idempotency_key(key);
            }
            if let Some(max) = max_attempts {
                new = new.max_attempts(max);
            }
            store.add(new).await?;
            println!("Added {id}");
            Ok(RunOutcome::with_item(id))
        }
        QueueCommands::List { status, priority } => {
            let filter = ListFilter {
                status: status.as_deref().map(ItemStatus::from_str).transpose()?,
                priority: priority.as_deref().map(Priority::from_str).transpose()?,
            };
            for item in store.list(filter).await? {
                println!("{}\t{}\t{}\t{}", item.id, item.status, item.priority, item.task);
            }
            Ok(RunOutcome::ok())
        }
        QueueCommands::Pick { owner_session } => {
            let owner = owner_session.unwrap_or_else(|| "-".to_string());
            match store.pick_next(&owner).await? {
                Some(item) => {
                    println!("{}", item.id);
                    Ok(RunOutcome::with_item(item.id))
                }
                None => {
                    println!("No pending tasks");
                    Ok(RunOutcome::ok())
                }
            }
        }
        QueueCommands::Done { id, notes } => {
            store.mark_done(&id, &notes).await?;
            println!("{id} -> DONE");
            Ok(RunOutcome::with_item(id))
        }
        QueueCommands::Fail { id, notes } => {
            store.mark_failed(&id, &notes).await?;
            println!("{id} -> FAILED");
            Ok(RunOutcome::with_item(id))
        }
    }
}

async fn run_ops(
    command: OpsCommands,
    config: &Config,
    store: &QueueStore,
    view_path: &PathBuf,
    log_path: &PathBuf,
) -> Result<RunOutcome> {
    match command {
        OpsCommands::Status => {
            let items = store.list(ListFilter::default()).await?;
            println!("{}", ops::status_summary(&items));
            Ok(RunOutcome::ok())
        }
        OpsCommands::Workers => {
            let items = store.list(ListFilter::default()).await?;
            println!("{}", ops::workers_summary(&items));
            Ok(RunOutcome::ok())
        }
        OpsCommands::Cancel { id } => {
            let status = router::operator_cancel(store, &id).await?;
            println!("{id} -> {status}");
            Ok(RunOutcome::with_item(id))
        }
        OpsCommands::Replan { id, notes } => {
            let status = router::operator_replan(store, &id, &notes).await?;
            println!("{id} -> {status}");
            Ok(RunOutcome::with_item(id))
        }
        OpsCommands::Retry { id } => {
            let status =
                router::operator_retry(store, &id, None, &config.retry_backoff_seconds).await?;
            println!("{id} -> {status}");
            Ok(RunOutcome::with_item(id))
        }
        OpsCommands::RenderView => {
            if config.view_read_only {
                anyhow::bail!("view is read-only (ORCH_VIEW_READ_ONLY is set)");
            }
            let items = store.list(ListFilter::default()).await?;
            let count = view::project(&items, view_path)?;
            println!("rendered {count} rows");
            Ok(RunOutcome::ok())
        }
        OpsCommands::ConsistencyCheck => {
            let items = store.list(ListFilter::default()).await?;
            let rows = ViewFile::load(view_path)?.rows;
            let report = view::check_consistency(&items, &rows);

            if report.is_consistent() {
                println!("consistent items={}", items.len());
            } else {
                if !report.missing_in_view.is_empty() {
                    println!("missing_in_view: {}", report.missing_in_view.join(","));
                }
                if !report.missing_in_store.is_empty() {
                    println!("missing_in_store: {}", report.missing_in_store.join(","));
                }
                for m in &report.mismatches {
                    println!(
                        "mismatch {} {}: store={} view={}",
                        m.id, m.field, m.store_value, m.view_value
                    );
                }
            }
            Ok(RunOutcome::ok())
        }
        OpsCommands::Kpi {
            max_failure_rate,
            max_latency_p95_ms,
            max_stale_in_progress,
            stale_minutes,
            fail_on_alert,
        } => {
            let entries = runlog::read_entries(log_path);
            let mut report =
                metrics::aggregate_from_log(&log_path.display().to_string(), &entries);
            metrics::enrich_from_store(
                &mut report,
                store,
                stale_minutes.unwrap_or(watchdog::DEFAULT_STALE_MINUTES),
            )
            .await?;

            // Serialize through a Value so keys print sorted.
            let value = serde_json::to_value(&report)?;
            println!("{}", serde_json::to_string_pretty(&value)?);

            let defaults = KpiThresholds::default();
            let thresholds = KpiThresholds {
                max_failure_rate: max_failure_rate.unwrap_or(defaults.max_failure_rate),
                max_latency_p95_ms: max_latency_p95_ms.unwrap_or(defaults.max_latency_p95_ms),
                max_stale_in_progress: max_stale_in_progress
                    .unwrap_or(defaults.max_stale_in_progress),
            };
            let alerts = metrics::evaluate_alerts(&report, &thresholds);
            for alert in &alerts {
                println!("alert {alert}");
            }

            if fail_on_alert && !alerts.is_empty() {
                return Ok(RunOutcome {
                    exit_code: 2,
                    item_id: None,
                });
            }
            Ok(RunOutcome::ok())
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            println!("ERROR: {e:#}");
            std::process::exit(1);
        }
    };

    let store_path = cli.store_path.clone().unwrap_or_else(|| config.store_path.clone());
    let view_path = cli.view_path.clone().unwrap_or_else(|| config.view_path.clone());
    let log_path = cli.log_path.clone().unwrap_or_else(|| config.log_path.clone());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::from_offset_hours(config.tz_offset_hours));
    let trace_id = cli.trace_id.clone().unwrap_or_else(runlog::new_trace_id);
    let command = command_name(&cli.command);
    let started = Instant::now();

    if let Err(e) = runlog::emit_run_start(&log_path, clock.as_ref(), &trace_id, command) {
        tracing::warn!(error = %e, "failed to write run_start");
    }

    let result = match QueueStore::open(&store_path, clock.clone()).await {
        Ok(store) => {
            let store = store.with_retry_backoff(config.retry_backoff_seconds.clone());
            run(cli.command, &config, &store, &view_path, &log_path).await
        }
        Err(e) => Err(e.into()),
    };

    let duration_ms = started.elapsed().as_millis() as i64;
    match result {
        Ok(outcome) => {
            if let Err(e) = runlog::emit_run_end(
                &log_path,
                clock.as_ref(),
                &trace_id,
                command,
                outcome.exit_code,
                "ok",
                outcome.item_id.as_deref(),
                duration_ms,
                None,
            ) {
                tracing::warn!(error = %e, "failed to write run_end");
            }
            std::process::exit(outcome.exit_code);
        }
        Err(e) => {
            let message = format!("{e:#}");
            if let Err(log_err) = runlog::emit_run_end(
                &log_path,
                clock.as_ref(),
                &trace_id,
                command,
                1,
                "error",
                None,
                duration_ms,
                Some(&message),
            ) {
                tracing::warn!(error = %log_err, "failed to write run_end");
            }
            println!("ERROR: {message}");
            std::process::exit(1);
        }
    }
}
