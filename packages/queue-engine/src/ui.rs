//! UI smoke validation through an external browser-automation CLI.
//!
//! The collaborator contract is two invocations of the tool: `open <url>`
//! followed by `snapshot`. The snapshot's stdout+stderr must contain every
//! required term (case-insensitive). All command invocations go through
//! [`CommandRunner`] so tests can substitute a scripted runner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_TOOL: &str = "playwright-cli";
const SNAPSHOT_EXCERPT_CHARS: usize = 400;

/// Exit code used when the external command times out.
pub const RC_TIMEOUT: i32 = 124;
/// Exit code used when the external command binary is missing.
pub const RC_NOT_FOUND: i32 = 127;

/// Result of a UI smoke validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiResult {
    pub ok: bool,
    pub reasons: Vec<String>,
    pub missing: Vec<String>,
    pub snapshot_excerpt: String,
}

/// Injectable subprocess seam. Returns `(exit_code, stdout, stderr)`;
/// failures to launch are mapped to exit codes, never errors.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &[String], timeout_seconds: u64) -> (i32, String, String);
}

/// Default runner on `tokio::process` with a hard timeout.
pub struct SubprocessRunner;

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(&self, cmd: &[String], timeout_seconds: u64) -> (i32, String, String) {
        let (program, args) = match cmd.split_first() {
            Some(parts) => parts,
            None => return (RC_NOT_FOUND, String::new(), "command_not_found:".to_string()),
        };

        let fut = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(Duration::from_secs(timeout_seconds), fut).await {
            Err(_) => (RC_TIMEOUT, String::new(), "timeout".to_string()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                (RC_NOT_FOUND, String::new(), format!("command_not_found:{program}"))
            }
            Ok(Err(e)) => (1, String::new(), e.to_string()),
            Ok(Ok(output)) => (
                output.status.code().unwrap_or(1),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ),
        }
    }
}

/// UI smoke checker bound to a runner and a tool binary name.
pub struct UiSmoke {
    runner: Arc<dyn CommandRunner>,
    tool: String,
}

impl UiSmoke {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            tool: DEFAULT_TOOL.to_string(),
        }
    }

    pub fn with_tool(runner: Arc<dyn CommandRunner>, tool: impl Into<String>) -> Self {
        Self {
            runner,
            tool: tool.into(),
        }
    }

    fn session_args(session: Option<&str>) -> Vec<String> {
        match session {
            Some(s) if !s.is_empty() => vec![format!("--session={s}")],
            _ => Vec::new(),
        }
    }

    fn missing_terms(snapshot_text: &str, required_terms: &[String]) -> Vec<String> {
        let lower = snapshot_text.to_lowercase();
        required_terms
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .filter(|t| !lower.contains(&t.to_lowercase()))
            .map(|t| t.to_string())
            .collect()
    }

    fn excerpt(text: &str) -> String {
        text.chars().take(SNAPSHOT_EXCERPT_CHARS).collect()
    }

    /// Open the url, snapshot the page, and require every term to appear
    /// in the snapshot text.
    pub async fn validate(
        &self,
        url: &str,
        required_terms: &[String],
        timeout_seconds: u64,
        session: Option<&str>,
    ) -> UiResult {
        let mut open_cmd = vec![self.tool.clone()];
        open_cmd.extend(Self::session_args(session));
        open_cmd.push("open".to_string());
        open_cmd.push(url.to_string());

        let (rc, out, err) = self.runner.run(&open_cmd, timeout_seconds).await;
        if rc != 0 {
            let reason = {
                let r = if err.trim().is_empty() { out.trim() } else { err.trim() };
                if r.is_empty() {
                    format!("open_failed_rc={rc}")
                } else {
                    r.to_string()
                }
            };
            debug!(url, rc, "ui open failed");
            return UiResult {
                ok: false,
                reasons: vec![format!("ui_open_failed:{reason}")],
                missing: required_terms.to_vec(),
                snapshot_excerpt: String::new(),
            };
        }

        let mut snapshot_cmd = vec![self.tool.clone()];
        snapshot_cmd.extend(Self::session_args(session));
        snapshot_cmd.push("snapshot".to_string());

        let (rc, out, err) = self.runner.run(&snapshot_cmd, timeout_seconds).await;
        if rc != 0 {
            let reason = {
                let r = if err.trim().is_empty() { out.trim() } else { err.trim() };
                if r.is_empty() {
                    format!("snapshot_failed_rc={rc}")
                } else {
                    r.to_string()
                }
            };
            debug!(url, rc, "ui snapshot failed");
            return UiResult {
                ok: false,
                reasons: vec![format!("ui_snapshot_failed:{reason}")],
                missing: required_terms.to_vec(),
                snapshot_excerpt: String::new(),
            };
        }

        let snapshot_text = if err.is_empty() {
            out
        } else {
            format!("{out}\n{err}")
        };

        let missing = Self::missing_terms(&snapshot_text, required_terms);
        if !missing.is_empty() {
            return UiResult {
                ok: false,
                reasons: vec![format!("ui_missing_terms:{}", missing.join(","))],
                missing,
                snapshot_excerpt: Self::excerpt(&snapshot_text),
            };
        }

        UiResult {
            ok: true,
            reasons: vec!["ui_smoke_passed".to_string()],
            missing: Vec::new(),
            snapshot_excerpt: Self::excerpt(&snapshot_text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted runner: pops one `(rc, stdout, stderr)` per invocation and
    /// records the argv it saw.
    struct ScriptedRunner {
        responses: Mutex<Vec<(i32, String, String)>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn new(responses: Vec<(i32, &str, &str)>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .rev()
                        .map(|(rc, o, e)| (rc, o.to_string(), e.to_string()))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, cmd: &[String], _timeout_seconds: u64) -> (i32, String, String) {
            self.calls.lock().unwrap().push(cmd.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or((1, String::new(), "exhausted".to_string()))
        }
    }

    fn terms(ts: &[&str]) -> Vec<String> {
        ts.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn smoke_passes_when_all_terms_present() {
        let runner = ScriptedRunner::new(vec![(0, "", ""), (0, "Welcome to the Dashboard", "")]);
        let smoke = UiSmoke::new(runner.clone());
        let result = smoke
            .validate("http://localhost:3000", &terms(&["welcome", "dashboard"]), 45, None)
            .await;
        assert!(result.ok);
        assert_eq!(result.reasons, vec!["ui_smoke_passed".to_string()]);

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0], vec!["playwright-cli", "open", "http://localhost:3000"]);
        assert_eq!(calls[1], vec!["playwright-cli", "snapshot"]);
    }

    #[tokio::test]
    async fn missing_term_fails_with_term_list() {
        let runner = ScriptedRunner::new(vec![(0, "", ""), (0, "Welcome", "")]);
        let smoke = UiSmoke::new(runner);
        let result = smoke
            .validate("http://localhost", &terms(&["Welcome", "Dashboard"]), 45, None)
            .await;
        assert!(!result.ok);
        assert_eq!(result.missing, vec!["Dashboard".to_string()]);
        assert_eq!(result.reasons, vec!["ui_missing_terms:Dashboard".to_string()]);
    }

    #[tokio::test]
    async fn open_failure_short_circuits() {
        let runner = ScriptedRunner::new(vec![(RC_TIMEOUT, "", "timeout")]);
        let smoke = UiSmoke::new(runner.clone());
        let result = smoke
            .validate("http://localhost", &terms(&["Welcome"]), 1, None)
            .await;
        assert!(!result.ok);
        assert_eq!(result.reasons, vec!["ui_open_failed:timeout".to_string()]);
        assert_eq!(result.missing, vec!["Welcome".to_string()]);
        // snapshot must not have been attempted
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_failure_reported() {
        let runner = ScriptedRunner::new(vec![(0, "", ""), (2, "", "crash")]);
        let smoke = UiSmoke::new(runner);
        let result = smoke.validate("http://localhost", &[], 45, None).await;
        assert!(!result.ok);
        assert_eq!(result.reasons, vec!["ui_snapshot_failed:crash".to_string()]);
    }

    #[tokio::test]
    async fn session_flag_is_threaded_through() {
        let runner = ScriptedRunner::new(vec![(0, "", ""), (0, "ok", "")]);
        let smoke = UiSmoke::new(runner.clone());
        let _ = smoke
            .validate("http://localhost", &[], 45, Some("smoke-1"))
            .await;
        let calls = runner.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            vec!["playwright-cli", "--session=smoke-1", "open", "http://localhost"]
        );
        assert_eq!(calls[1], vec!["playwright-cli", "--session=smoke-1", "snapshot"]);
    }

    #[tokio::test]
    async fn stderr_is_part_of_snapshot_text() {
        let runner = ScriptedRunner::new(vec![(0, "", ""), (0, "partial", "Dashboard ready")]);
        let smoke = UiSmoke::new(runner);
        let result = smoke
            .validate("http://localhost", &terms(&["dashboard"]), 45, None)
            .await;
        assert!(result.ok);
    }

    #[test]
    fn excerpt_is_char_bounded() {
        let text = "x".repeat(1000);
        assert_eq!(UiSmoke::excerpt(&text).len(), SNAPSHOT_EXCERPT_CHARS);
    }

    #[test]
    fn blank_terms_are_ignored() {
        let missing = UiSmoke::missing_terms("hello world", &terms(&["  ", "hello"]));
        assert!(missing.is_empty());
    }
}
