use crate::errors::ReplayError;
use crate::log_retention::enforce_total_budget;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub ts_ms: u128,
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: 4096,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), ReplayError> {
        let io = |e: std::io::Error| ReplayError::Io(format!("{}: {e}", self.path.display()));
        let dir = self.path.parent();
        if let Some(dir) = dir {
            fs::create_dir_all(dir).map_err(io)?;
        }

        let mut line = serde_json::to_vec(&LogEvent {
            payload: truncate_json(event.payload.clone(), self.max_payload_bytes),
            ..event.clone()
        })
        .map_err(|e| ReplayError::Io(e.to_string()))?;
        line.push(b'\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&line))
            .map_err(io)?;

        if let Some(dir) = dir {
            enforce_total_budget(dir, self.budget_bytes, &self.path)?;
        }
        Ok(())
    }
}

fn run_log() -> &'static Mutex<Option<JsonlLogger>> {
    static RUN_LOG: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();
    RUN_LOG.get_or_init(|| Mutex::new(None))
}

/// Installs the process-wide run log at `<dir>/run-<unix_ms>.jsonl`. Older run
/// files in `dir` are pruned against the disk budget.
pub fn init_run_log(dir: &Path) -> PathBuf {
    let path = dir.join(format!("run-{}.jsonl", now_ms()));
    if let Ok(mut slot) = run_log().lock() {
        *slot = Some(JsonlLogger::new(&path));
    }
    path
}

/// Appends an event to the run log. Silently does nothing before `init_run_log`
/// or when the log cannot be written; logging never fails a run.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let Ok(slot) = run_log().lock() else {
        return;
    };
    let Some(logger) = slot.as_ref() else {
        return;
    };
    let _ = logger.append(&LogEvent {
        ts_ms: now_ms(),
        level,
        event_type,
        payload,
    });
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

pub fn structured_fallback_line(stage: &str, state: &str, message: &str) -> String {
    format!(
        "stage={stage} state={state} message={}",
        message.replace('\n', "\\n")
    )
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

#[cfg(test)]
mod tests {
    use super::{structured_fallback_line, truncate_json, JsonlLogger, LogEvent};
    use serde_json::json;

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;
        logger.budget_bytes = 1024;

        logger
            .append(&LogEvent {
                ts_ms: 1,
                level: "info",
                event_type: "readiness.attempt_failed",
                payload: json!({"error": "abcdefghijklmnopqrstuvwxyz"}),
            })
            .expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"event_type\":\"readiness.attempt_failed\""));
        assert!(text.contains("..."));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let value = json!({"body": "ééééééééééééééééééé"});
        let truncated = truncate_json(value, 12);
        let text = truncated.as_str().expect("string");
        assert!(text.ends_with("..."));
    }

    #[test]
    fn fallback_line_is_deterministic() {
        let line = structured_fallback_line("replay_serve", "spawned", "pid 42\nready");
        assert_eq!(line, "stage=replay_serve state=spawned message=pid 42\\nready");
    }
}
