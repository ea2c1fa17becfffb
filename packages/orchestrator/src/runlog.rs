//! Append-only JSONL run log.
//!
//! Every CLI invocation writes a `run_start` and a `run_end` object, one
//! JSON document per line with sorted keys. The metrics aggregator reads
//! this file back; unparseable lines are skipped, never fatal.

use std::io::Write;
use std::path::Path;

use serde_json::{json, Value};

use crate::clock::Clock;
use crate::error::Result;

/// Trace id for one CLI run: `trace-<12 hex chars>`.
pub fn new_trace_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("trace-{}", &hex[..12])
}

fn append_line(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    // serde_json's map keeps keys sorted on output.
    writeln!(file, "{}", serde_json::to_string(value)?)?;
    Ok(())
}

fn stamp(clock: &dyn Clock, mut payload: Value) -> Value {
    if let Some(map) = payload.as_object_mut() {
        map.insert("ts_wall".to_string(), json!(clock.now_wall()));
        map.insert("ts_epoch_ms".to_string(), json!(clock.now_epoch() * 1000));
    }
    payload
}

/// Record the start of a CLI run.
pub fn emit_run_start(path: &Path, clock: &dyn Clock, trace_id: &str, command: &str) -> Result<()> {
    let payload = stamp(
        clock,
        json!({
            "event": "run_start",
            "trace_id": trace_id,
            "command": command,
        }),
    );
    append_line(path, &payload)
}

/// Record the end of a CLI run, successful or not.
#[allow(clippy::too_many_arguments)]
pub fn emit_run_end(
    path: &Path,
    clock: &dyn Clock,
    trace_id: &str,
    command: &str,
    exit_code: i32,
    status: &str,
    item_id: Option<&str>,
    duration_ms: i64,
    error: Option<&str>,
) -> Result<()> {
    let mut payload = json!({
        "event": "run_end",
        "trace_id": trace_id,
        "command": command,
        "exit_code": exit_code,
        "status": status,
        "item_id": item_id,
        "duration_ms": duration_ms,
    });
    if let (Some(map), Some(err)) = (payload.as_object_mut(), error) {
        map.insert("error".to_string(), json!(err));
    }
    let payload = stamp(clock, payload);
    append_line(path, &payload)
}

/// Read the log back, one JSON value per parseable line.
pub fn read_entries(path: &Path) -> Vec<Value> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    #[test]
    fn trace_ids_have_fixed_shape() {
        let id = new_trace_id();
        assert!(id.starts_with("trace-"));
        assert_eq!(id.len(), "trace-".len() + 12);
        assert_ne!(new_trace_id(), new_trace_id());
    }

    #[test]
    fn run_start_and_end_are_appended() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs.jsonl");
        let clock = ManualClock::new(1_700_000_000);

        emit_run_start(&path, &clock, "trace-abc", "pick").unwrap();
        emit_run_end(
            &path,
            &clock,
            "trace-abc",
            "pick",
            0,
            "ok",
            Some("ORCH-1"),
            42,
            None,
        )
        .unwrap();

        let entries = read_entries(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["event"], "run_start");
        assert_eq!(entries[0]["trace_id"], "trace-abc");
        assert_eq!(entries[1]["event"], "run_end");
        assert_eq!(entries[1]["exit_code"], 0);
        assert_eq!(entries[1]["item_id"], "ORCH-1");
        assert_eq!(entries[1]["duration_ms"], 42);
        assert_eq!(entries[1]["ts_epoch_ms"], 1_700_000_000_000i64);
    }

    #[test]
    fn error_field_only_present_on_failures() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs.jsonl");
        let clock = ManualClock::new(1_700_000_000);

        emit_run_end(&path, &clock, "t", "done", 1, "error", None, 5, Some("boom")).unwrap();
        emit_run_end(&path, &clock, "t", "done", 0, "ok", None, 5, None).unwrap();

        let entries = read_entries(&path);
        assert_eq!(entries[0]["error"], "boom");
        assert!(entries[1].get("error").is_none());
    }

    #[test]
    fn lines_have_sorted_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs.jsonl");
        let clock = ManualClock::new(1_700_000_000);
        emit_run_start(&path, &clock, "t", "list").unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let line = text.lines().next().unwrap();
        let keys: Vec<&str> = line
            .trim_matches(|c| c == '{' || c == '}')
            .split(',')
            .map(|kv| kv.split(':').next().unwrap().trim_matches('"'))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn unreadable_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs.jsonl");
        std::fs::write(&path, "{\"event\":\"run_end\"}\nnot json\n\n").unwrap();
        assert_eq!(read_entries(&path).len(), 1);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_entries(&dir.path().join("absent.jsonl")).is_empty());
    }
}
