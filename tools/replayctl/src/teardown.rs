use crate::logging::append_run_log;
use crate::runtime::{Clock, ProcessHandle, ProcessRunner, Signal, Terminal};
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub exit_code: Option<i32>,
    pub forced: bool,
    pub output: String,
    /// Signals or output reads the runner refused, in the order they happened.
    pub errors: Vec<String>,
}

impl TeardownReport {
    pub fn exited(&self) -> bool {
        self.exit_code.is_some()
    }
}

/// Stops the process group behind `handle`: SIGTERM, up to `grace` for the
/// leader to exit, then SIGKILL to the whole group. The KILL is sent even when
/// the leader went down on TERM, so members that ignore TERM do not outlive
/// it. Safe to call on a group that is already gone, and safe to call more
/// than once. Failures along the way are logged and collected in the report.
pub fn terminate_group(
    process_runner: &dyn ProcessRunner,
    clock: &dyn Clock,
    handle: &ProcessHandle,
    grace: Duration,
) -> TeardownReport {
    let mut errors = Vec::new();
    send_signal(process_runner, handle, Signal::Terminate, &mut errors);
    let mut exit_code = wait_for_exit(process_runner, clock, handle, grace);

    let forced = exit_code.is_none();
    if forced {
        append_run_log(
            "warn",
            "teardown.escalated",
            json!({ "pid": handle.pid, "grace_ms": grace.as_millis() as u64 }),
        );
    }
    if forced || handle.pgid.is_some() {
        send_signal(process_runner, handle, Signal::Kill, &mut errors);
    }
    if forced {
        exit_code = wait_for_exit(process_runner, clock, handle, grace);
    }

    let output = match process_runner.take_output(handle) {
        Ok(output) => output,
        Err(err) => {
            append_run_log(
                "warn",
                "teardown.output_failed",
                json!({ "pid": handle.pid, "error": err.to_string() }),
            );
            errors.push(err.to_string());
            String::new()
        }
    };
    append_run_log(
        "info",
        "teardown.finished",
        json!({
            "pid": handle.pid,
            "pgid": handle.pgid,
            "exit_code": exit_code,
            "forced": forced,
            "output_bytes": output.len(),
            "errors": errors.len(),
        }),
    );
    TeardownReport {
        exit_code,
        forced,
        output,
        errors,
    }
}

fn send_signal(
    process_runner: &dyn ProcessRunner,
    handle: &ProcessHandle,
    signal: Signal,
    errors: &mut Vec<String>,
) {
    if let Err(err) = process_runner.signal_group(handle, signal) {
        append_run_log(
            "warn",
            "teardown.signal_failed",
            json!({
                "pid": handle.pid,
                "pgid": handle.pgid,
                "signal": format!("{signal:?}"),
                "error": err.to_string(),
            }),
        );
        errors.push(err.to_string());
    }
}

fn wait_for_exit(
    process_runner: &dyn ProcessRunner,
    clock: &dyn Clock,
    handle: &ProcessHandle,
    grace: Duration,
) -> Option<i32> {
    let deadline = clock.now() + grace;
    loop {
        match process_runner.try_wait(handle) {
            Ok(Some(code)) => return Some(code),
            Ok(None) => {}
            // The runner no longer tracks it, so there is nothing left to wait for.
            Err(_) => return Some(-1),
        }
        let now = clock.now();
        if now >= deadline {
            return None;
        }
        let _ = clock.sleep_until((now + EXIT_POLL_INTERVAL).min(deadline));
    }
}

/// Owns a running replay server and guarantees its process group is stopped
/// exactly once, whether `release` is called or the guard is dropped on an
/// error path.
pub struct ServerGuard<'a> {
    process_runner: &'a dyn ProcessRunner,
    clock: &'a dyn Clock,
    terminal: &'a dyn Terminal,
    handle: Option<ProcessHandle>,
    grace: Duration,
}

impl<'a> ServerGuard<'a> {
    pub fn new(
        process_runner: &'a dyn ProcessRunner,
        clock: &'a dyn Clock,
        terminal: &'a dyn Terminal,
        handle: ProcessHandle,
        grace: Duration,
    ) -> Self {
        Self {
            process_runner,
            clock,
            terminal,
            handle: Some(handle),
            grace,
        }
    }

    /// Tears the server down and returns what happened. Later calls return `None`.
    pub fn release(&mut self) -> Option<TeardownReport> {
        let handle = self.handle.take()?;
        Some(terminate_group(
            self.process_runner,
            self.clock,
            &handle,
            self.grace,
        ))
    }
}

impl Drop for ServerGuard<'_> {
    fn drop(&mut self) {
        if let Some(report) = self.release() {
            if !report.output.is_empty() {
                let _ = self.terminal.write_error_line("replay server output:");
                let _ = self.terminal.write_error_line(report.output.trim_end());
            }
        }
    }
}
