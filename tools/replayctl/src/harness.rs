//! End-to-end flows built from the pipeline pieces: `run` serves in the
//! foreground, `verify` checks one replayed response and always tears down.

use crate::config::PipelineConfig;
use crate::errors::ReplayError;
use crate::logging::{append_run_log, structured_fallback_line};
use crate::pipeline::{run_capture_import, spawn_replay_server, ServeMode};
use crate::readiness::{poll_until_ready, PollPolicy, ReadinessProbe};
use crate::runtime::ProductionRuntime;
use crate::teardown::{ServerGuard, TeardownReport};
use crate::verify::{expected_payload, verify_response};
use serde_json::json;
use std::time::Duration;

pub const MATCH_MESSAGE: &str = "Replay response matches expected payload";

/// Imports the flow file, then runs the replay server until it exits and
/// returns its exit code.
pub fn run_pipeline(runtime: &ProductionRuntime, cfg: &PipelineConfig) -> Result<i32, ReplayError> {
    let runner = runtime.process_runner.as_ref();
    run_capture_import(runner, cfg)?;
    let handle = spawn_replay_server(runner, cfg, ServeMode::Foreground)?;
    runtime.terminal.write_error_line(&structured_fallback_line(
        "replay_serve",
        "running",
        &format!("pid={} listen={}", handle.pid, cfg.listen),
    ))?;
    let output = runner.wait(&handle)?;
    append_run_log(
        "info",
        "pipeline.replay_serve.exited",
        json!({ "pid": handle.pid, "exit_code": output.exit_code }),
    );
    Ok(output.exit_code)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRun {
    pub attempts: u32,
    pub teardown: Option<TeardownReport>,
}

/// Imports the flow file, starts the replay server in its own process group,
/// waits for it to answer `probe`, and compares the answer with the expected
/// payload. The server is stopped on every path out of this function.
pub fn run_verification(
    runtime: &ProductionRuntime,
    cfg: &PipelineConfig,
    probe: &ReadinessProbe,
    policy: &PollPolicy,
    grace: Duration,
) -> Result<VerificationRun, ReplayError> {
    if !runtime.file_system.exists(&cfg.flow_file) {
        return Err(ReplayError::MissingResource(format!(
            "Missing flow file: {}",
            cfg.flow_file.display()
        )));
    }

    let runner = runtime.process_runner.as_ref();
    run_capture_import(runner, cfg)?;
    let handle = spawn_replay_server(runner, cfg, ServeMode::Supervised)?;
    let mut guard = ServerGuard::new(
        runner,
        runtime.clock.as_ref(),
        runtime.terminal.as_ref(),
        handle,
        grace,
    );

    let outcome = poll_until_ready(runtime.http.as_ref(), runtime.clock.as_ref(), probe, policy)
        .and_then(|polled| {
            verify_response(polled.status, &polled.body, &expected_payload())?;
            Ok(polled.attempts)
        });

    let teardown = guard.release();
    if let Some(report) = &teardown {
        if !report.output.is_empty() {
            runtime.terminal.write_error_line("replay server output:")?;
            runtime
                .terminal
                .write_error_line(report.output.trim_end())?;
        }
        if !report.exited() {
            runtime.terminal.write_error_line(&format!(
                "replay server process group {} still running after teardown",
                handle.pgid.unwrap_or(handle.pid)
            ))?;
        }
        for error in &report.errors {
            runtime
                .terminal
                .write_error_line(&format!("teardown: {error}"))?;
        }
    }

    let attempts = outcome?;
    runtime.terminal.write_line(MATCH_MESSAGE)?;
    Ok(VerificationRun { attempts, teardown })
}
