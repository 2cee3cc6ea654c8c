//! Launches the two pipeline stages: the capture import (mitmdump with the dump
//! script) and the replay server.

use crate::config::{BackendConfig, PipelineConfig};
use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::runtime::{ProcessHandle, ProcessRequest, ProcessRunner, StdioMode};
use serde_json::json;

/// Builds the capture import invocation. Configuration travels through the
/// child's environment; the parent environment is inherited underneath it.
pub fn capture_import_request(cfg: &PipelineConfig) -> ProcessRequest {
    let mut env = vec![
        ("FLOW_FILE".to_string(), cfg.flow_file.display().to_string()),
        ("STORE".to_string(), cfg.store().as_str().to_string()),
        ("KEY_PREFIX".to_string(), cfg.key_prefix.clone()),
        ("BATCH_SIZE".to_string(), cfg.batch_size.to_string()),
    ];
    for (enabled, key) in [
        (cfg.overwrite, "OVERWRITE"),
        (cfg.include_empty, "INCLUDE_EMPTY"),
        (cfg.include_errors, "INCLUDE_ERRORS"),
    ] {
        if enabled {
            env.push((key.to_string(), "1".to_string()));
        }
    }
    match &cfg.backend {
        BackendConfig::Redis(redis) => env.push(("REDIS_URL".to_string(), redis.url.clone())),
        BackendConfig::Sqlite(sqlite) => env.push((
            "SQLITE_PATH".to_string(),
            sqlite.path.display().to_string(),
        )),
    }

    let mut request = ProcessRequest::new(cfg.capture.program.clone());
    request.args = vec![
        "-s".to_string(),
        cfg.capture.script.display().to_string(),
        "-n".to_string(),
    ];
    request.env = env;
    request.stdio = StdioMode::Inherit;
    request
}

/// Runs the capture import to completion. A non-zero exit aborts the pipeline
/// and carries the child's exit code.
pub fn run_capture_import(
    process_runner: &dyn ProcessRunner,
    cfg: &PipelineConfig,
) -> Result<(), ReplayError> {
    let request = capture_import_request(cfg);
    let command = request.command_line();
    append_run_log(
        "info",
        "pipeline.capture_import.started",
        json!({
            "command": command,
            "flow_file": cfg.flow_file.display().to_string(),
            "store": cfg.store().as_str(),
        }),
    );
    let output = process_runner.run(request).map_err(|err| {
        append_run_log(
            "error",
            "pipeline.capture_import.spawn_failed",
            json!({ "command": command, "error": err.to_string() }),
        );
        err
    })?;
    if output.exit_code != 0 {
        append_run_log(
            "error",
            "pipeline.capture_import.failed",
            json!({ "command": command, "exit_code": output.exit_code }),
        );
        return Err(ReplayError::UpstreamProcess {
            code: output.exit_code,
            command,
        });
    }
    append_run_log(
        "info",
        "pipeline.capture_import.finished",
        json!({ "command": command }),
    );
    Ok(())
}

pub fn replay_serve_args(cfg: &PipelineConfig) -> Vec<String> {
    let mut args = cfg.server.args.clone();
    args.extend([
        "-listen".to_string(),
        cfg.listen.clone(),
        "-store".to_string(),
        cfg.store().as_str().to_string(),
        "-key-prefix".to_string(),
        cfg.key_prefix.clone(),
    ]);
    if cfg.log_not_found {
        args.push("-log-not-found".to_string());
    }
    match &cfg.backend {
        BackendConfig::Redis(redis) => {
            args.extend([
                "-redis-addr".to_string(),
                redis.addr.clone(),
                "-redis-db".to_string(),
                redis.db.clone(),
            ]);
            if !redis.password.is_empty() {
                args.extend(["-redis-password".to_string(), redis.password.clone()]);
            }
            if let Some(timeout) = &redis.timeout {
                args.extend(["-redis-timeout".to_string(), timeout.clone()]);
            }
        }
        BackendConfig::Sqlite(sqlite) => {
            args.extend([
                "-sqlite-path".to_string(),
                sqlite.path.display().to_string(),
            ]);
            if let Some(timeout) = &sqlite.timeout {
                args.extend(["-sqlite-timeout".to_string(), timeout.clone()]);
            }
        }
    }
    if !cfg.upstream.is_empty() {
        args.extend(["-upstream".to_string(), cfg.upstream.clone()]);
        if let Some(timeout) = &cfg.upstream_timeout {
            args.extend(["-upstream-timeout".to_string(), timeout.clone()]);
        }
    }
    if cfg.record_miss {
        args.push("-record-miss".to_string());
        if cfg.record_overwrite {
            args.push("-record-overwrite".to_string());
        }
    }
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// Server shares the terminal: inherited stdio, same process group, so
    /// Ctrl-C reaches it.
    Foreground,
    /// Server is owned by a supervisor: captured output, own process group.
    Supervised,
}

/// Builds the replay server invocation: flags only, started from the project root.
pub fn replay_serve_request(cfg: &PipelineConfig, mode: ServeMode) -> ProcessRequest {
    let mut request = ProcessRequest::new(cfg.server.program.clone());
    request.args = replay_serve_args(cfg);
    request.cwd = Some(cfg.root.clone());
    match mode {
        ServeMode::Foreground => {
            request.stdio = StdioMode::Inherit;
            request.own_process_group = false;
        }
        ServeMode::Supervised => {
            request.stdio = StdioMode::Capture;
            request.own_process_group = true;
        }
    }
    request
}

/// Starts the replay server and returns without waiting for it.
pub fn spawn_replay_server(
    process_runner: &dyn ProcessRunner,
    cfg: &PipelineConfig,
    mode: ServeMode,
) -> Result<ProcessHandle, ReplayError> {
    let request = replay_serve_request(cfg, mode);
    let command = redacted_command_line(&request);
    let handle = process_runner.spawn(request).map_err(|err| {
        append_run_log(
            "error",
            "pipeline.replay_serve.spawn_failed",
            json!({ "command": command, "error": err.to_string() }),
        );
        err
    })?;
    append_run_log(
        "info",
        "pipeline.replay_serve.spawned",
        json!({
            "command": command,
            "pid": handle.pid,
            "pgid": handle.pgid,
            "cwd": cfg.root.display().to_string(),
        }),
    );
    Ok(handle)
}

fn redacted_command_line(request: &ProcessRequest) -> String {
    let mut parts = vec![request.program.clone()];
    let mut mask_next = false;
    for arg in &request.args {
        if mask_next {
            parts.push("***".to_string());
        } else {
            parts.push(arg.clone());
        }
        mask_next = arg == "-redis-password";
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::{redacted_command_line, replay_serve_args};
    use crate::config::{
        BackendConfig, CaptureTool, PipelineConfig, RedisConnection, ServerCommand,
    };
    use crate::runtime::ProcessRequest;
    use std::path::PathBuf;

    fn redis_cfg() -> PipelineConfig {
        PipelineConfig {
            flow_file: PathBuf::from("/flows/a.flow"),
            key_prefix: "k".to_string(),
            batch_size: 10,
            overwrite: false,
            include_empty: false,
            include_errors: false,
            log_not_found: false,
            record_miss: false,
            record_overwrite: true,
            listen: ":9000".to_string(),
            upstream: String::new(),
            upstream_timeout: Some("10s".to_string()),
            backend: BackendConfig::Redis(RedisConnection {
                url: "redis://localhost:6379/0".to_string(),
                addr: "localhost:6379".to_string(),
                db: "0".to_string(),
                password: String::new(),
                timeout: None,
            }),
            capture: CaptureTool {
                program: "mitmdump".to_string(),
                script: PathBuf::from("/scripts/dump.py"),
            },
            server: ServerCommand::default(),
            root: PathBuf::from("/repo"),
        }
    }

    #[test]
    fn record_overwrite_needs_record_miss_and_upstream_timeout_needs_upstream() {
        let args = replay_serve_args(&redis_cfg());
        assert!(!args.contains(&"-record-overwrite".to_string()));
        assert!(!args.contains(&"-upstream-timeout".to_string()));
        assert!(!args.contains(&"-redis-password".to_string()));
    }

    #[test]
    fn password_is_masked_in_logged_command() {
        let mut request = ProcessRequest::new("mitmredis");
        request.args = vec![
            "-redis-password".to_string(),
            "hunter2".to_string(),
            "-redis-db".to_string(),
            "1".to_string(),
        ];
        assert_eq!(
            redacted_command_line(&request),
            "mitmredis -redis-password *** -redis-db 1"
        );
    }
}
