use crate::errors::ReplayError;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

/// How long a reaped child's reader threads get to hit EOF. A pipe can stay
/// open past the child's exit when a descendant inherited it.
pub const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// Child shares the parent's stdout/stderr.
    Inherit,
    /// Child output is drained into a buffer readable through `take_output`.
    Capture,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdio: StdioMode,
    pub own_process_group: bool,
}

impl ProcessRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdio: StdioMode::Capture,
            own_process_group: false,
        }
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub id: u64,
    pub pid: u32,
    pub pgid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ReplayError>;
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<ProcessHandle, ReplayError>;
    /// Blocks until the process exits and returns its exit code and captured output.
    fn wait(&self, handle: &ProcessHandle) -> Result<ProcessOutput, ReplayError>;
    /// Returns the exit code once the process has exited, `None` while it runs.
    fn try_wait(&self, handle: &ProcessHandle) -> Result<Option<i32>, ReplayError>;
    /// Signals the whole process group. A group that no longer exists is not an error.
    fn signal_group(&self, handle: &ProcessHandle, signal: Signal) -> Result<(), ReplayError>;
    /// Drains the combined stdout/stderr buffered so far.
    fn take_output(&self, handle: &ProcessHandle) -> Result<String, ReplayError>;

    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, ReplayError> {
        let handle = self.spawn(request)?;
        self.wait(&handle)
    }
}

pub trait HttpClient: Send + Sync {
    /// Any received response is `Ok`, whatever its status.
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, ReplayError>;
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, ReplayError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ReplayError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), ReplayError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), ReplayError>;
    fn write_error_line(&self, line: &str) -> Result<(), ReplayError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ReplayError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ReplayError> {
        std::fs::read_to_string(path)
            .map_err(|e| ReplayError::Io(format!("{}: {e}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ReplayError> {
        std::fs::write(path, contents).map_err(|e| ReplayError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), ReplayError> {
        std::fs::create_dir_all(path).map_err(|e| ReplayError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

struct TrackedChild {
    child: std::process::Child,
    exit: Option<i32>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    combined: SharedBuffer,
    pumps: Vec<JoinHandle<()>>,
    pumps_done: Receiver<()>,
}

impl TrackedChild {
    /// Joins the reader threads if they all finish within `limit`. Threads
    /// still blocked on a pipe after that are detached; whatever they buffered
    /// so far stays readable.
    fn join_pumps(&mut self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let mut pending = self.pumps.len();
        while pending > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.pumps_done.recv_timeout(left) {
                Ok(()) => pending -= 1,
                Err(_) => break,
            }
        }
        if pending > 0 {
            self.pumps.clear();
            return false;
        }
        for pump in self.pumps.drain(..) {
            let _ = pump.join();
        }
        true
    }
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, TrackedChild>,
    finished: HashMap<u64, i32>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
        }
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_pump<R: Read + Send + 'static>(
    mut source: R,
    own: SharedBuffer,
    combined: SharedBuffer,
    done: Sender<()>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match source.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = own.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    if let Ok(mut buf) = combined.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
        let _ = done.send(());
    })
}

fn drain_buffer(buffer: &SharedBuffer) -> String {
    match buffer.lock() {
        Ok(mut buf) => String::from_utf8_lossy(&std::mem::take(&mut *buf)).to_string(),
        Err(_) => String::new(),
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<ProcessHandle, ReplayError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        match request.stdio {
            StdioMode::Inherit => {
                cmd.stdout(std::process::Stdio::inherit())
                    .stderr(std::process::Stdio::inherit());
            }
            StdioMode::Capture => {
                cmd.stdin(std::process::Stdio::null())
                    .stdout(std::process::Stdio::piped())
                    .stderr(std::process::Stdio::piped());
            }
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            if request.own_process_group {
                cmd.process_group(0);
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            ReplayError::Process(format!("failed to start {}: {e}", request.program))
        })?;

        let stdout: SharedBuffer = Arc::default();
        let stderr: SharedBuffer = Arc::default();
        let combined: SharedBuffer = Arc::default();
        let (done_tx, pumps_done) = mpsc::channel();
        let mut pumps = Vec::new();
        if let Some(out) = child.stdout.take() {
            pumps.push(spawn_pump(
                out,
                Arc::clone(&stdout),
                Arc::clone(&combined),
                done_tx.clone(),
            ));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(spawn_pump(
                err,
                Arc::clone(&stderr),
                Arc::clone(&combined),
                done_tx.clone(),
            ));
        }
        drop(done_tx);

        let pid = child.id();
        let pgid = if cfg!(unix) && request.own_process_group {
            Some(pid)
        } else {
            None
        };
        let mut state = self.state.lock().expect("process lock poisoned");
        let id = state.next_handle;
        state.next_handle += 1;
        state.children.insert(
            id,
            TrackedChild {
                child,
                exit: None,
                stdout,
                stderr,
                combined,
                pumps,
                pumps_done,
            },
        );
        Ok(ProcessHandle { id, pid, pgid })
    }

    fn wait(&self, handle: &ProcessHandle) -> Result<ProcessOutput, ReplayError> {
        let tracked = {
            let mut state = self.state.lock().expect("process lock poisoned");
            state.children.remove(&handle.id)
        };
        let mut tracked = tracked
            .ok_or_else(|| ReplayError::Process(format!("unknown handle {}", handle.id)))?;
        let exit_code = match tracked.exit {
            Some(code) => code,
            None => {
                let status = tracked
                    .child
                    .wait()
                    .map_err(|e| ReplayError::Process(e.to_string()))?;
                exit_code_of(status)
            }
        };
        tracked.join_pumps(PUMP_DRAIN_TIMEOUT);
        let output = ProcessOutput {
            exit_code,
            stdout: drain_buffer(&tracked.stdout),
            stderr: drain_buffer(&tracked.stderr),
        };
        self.state
            .lock()
            .expect("process lock poisoned")
            .finished
            .insert(handle.id, exit_code);
        Ok(output)
    }

    fn try_wait(&self, handle: &ProcessHandle) -> Result<Option<i32>, ReplayError> {
        let mut state = self.state.lock().expect("process lock poisoned");
        if let Some(code) = state.finished.get(&handle.id) {
            return Ok(Some(*code));
        }
        let tracked = state
            .children
            .get_mut(&handle.id)
            .ok_or_else(|| ReplayError::Process(format!("unknown handle {}", handle.id)))?;
        if let Some(code) = tracked.exit {
            return Ok(Some(code));
        }
        let status = tracked
            .child
            .try_wait()
            .map_err(|e| ReplayError::Process(e.to_string()))?;
        tracked.exit = status.map(exit_code_of);
        Ok(tracked.exit)
    }

    #[cfg(unix)]
    fn signal_group(&self, handle: &ProcessHandle, signal: Signal) -> Result<(), ReplayError> {
        let signo = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let rc = match handle.pgid {
            Some(pgid) => unsafe { libc::killpg(pgid as libc::pid_t, signo) },
            None => unsafe { libc::kill(handle.pid as libc::pid_t, signo) },
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(ReplayError::Process(format!(
            "failed to signal process group {}: {err}",
            handle.pgid.unwrap_or(handle.pid)
        )))
    }

    #[cfg(not(unix))]
    fn signal_group(&self, handle: &ProcessHandle, _signal: Signal) -> Result<(), ReplayError> {
        let mut state = self.state.lock().expect("process lock poisoned");
        if let Some(tracked) = state.children.get_mut(&handle.id) {
            let _ = tracked.child.kill();
        }
        Ok(())
    }

    fn take_output(&self, handle: &ProcessHandle) -> Result<String, ReplayError> {
        let exited = self.try_wait(handle).unwrap_or(Some(-1)).is_some();
        let mut state = self.state.lock().expect("process lock poisoned");
        if !exited {
            return Ok(state
                .children
                .get(&handle.id)
                .map(|tracked| drain_buffer(&tracked.combined))
                .unwrap_or_default());
        }
        let Some(mut tracked) = state.children.remove(&handle.id) else {
            return Ok(String::new());
        };
        let exit_code = tracked.exit.unwrap_or(-1);
        state.finished.insert(handle.id, exit_code);
        drop(state);
        tracked.join_pumps(PUMP_DRAIN_TIMEOUT);
        Ok(drain_buffer(&tracked.combined))
    }
}

pub struct ReqwestHttpClient {
    client: reqwest::blocking::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self, ReplayError> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| ReplayError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestHttpClient {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, ReplayError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ReplayError::Http(format!("invalid method {}: {e}", request.method)))?;
        let response = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout)
            .send()
            .map_err(|e| ReplayError::Http(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|e| ReplayError::Http(e.to_string()))?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), ReplayError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| ReplayError::Io(e.to_string()))
    }

    fn write_error_line(&self, line: &str) -> Result<(), ReplayError> {
        use std::io::Write;
        let mut err = std::io::stderr();
        writeln!(err, "{line}").map_err(|e| ReplayError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub http: Arc<dyn HttpClient>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Result<Self, ReplayError> {
        Ok(Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            http: Arc::new(ReqwestHttpClient::new()?),
            terminal: Arc::new(ProductionTerminal),
        })
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ReplayError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        let mut now = self.now.lock().expect("clock lock");
        if deadline > *now {
            *now = deadline;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<ReplayError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: ReplayError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    fn maybe_fail(&self) -> Result<(), ReplayError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ReplayError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| ReplayError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ReplayError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), ReplayError> {
        self.maybe_fail()?;
        self.dirs
            .lock()
            .expect("dirs lock")
            .push(path.to_path_buf());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
            || self.dirs.lock().expect("dirs lock").iter().any(|d| d == path)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }

    pub fn error_lines(&self) -> Vec<String> {
        self.errors.lock().expect("errors lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), ReplayError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }

    fn write_error_line(&self, line: &str) -> Result<(), ReplayError> {
        self.errors
            .lock()
            .expect("errors lock")
            .push(line.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FakeLiveness {
    Running,
    Exited(i32),
}

#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    responses: Arc<Mutex<Vec<Result<ProcessOutput, ReplayError>>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    waits: Arc<Mutex<Vec<u64>>>,
    signals: Arc<Mutex<Vec<(u64, Signal)>>>,
    liveness: Arc<Mutex<HashMap<u64, FakeLiveness>>>,
    ignore_terminate: Arc<Mutex<bool>>,
    refuse_signals: Arc<Mutex<bool>>,
    exit_on_spawn: Arc<Mutex<Option<i32>>>,
    output: Arc<Mutex<String>>,
    next_handle: Arc<Mutex<u64>>,
}

impl FakeProcessRunner {
    pub fn push_response(&self, output: Result<ProcessOutput, ReplayError>) {
        self.responses.lock().expect("responses lock").push(output);
    }

    /// Processes keep running after SIGTERM and only die on SIGKILL.
    pub fn ignore_terminate(&self) {
        *self.ignore_terminate.lock().expect("ignore lock") = true;
    }

    /// Signals are recorded but fail with EPERM and change nothing.
    pub fn refuse_signals(&self) {
        *self.refuse_signals.lock().expect("refuse lock") = true;
    }

    /// Every process spawned from now on has already exited with `code`.
    pub fn exit_on_spawn(&self, code: i32) {
        *self.exit_on_spawn.lock().expect("exit lock") = Some(code);
    }

    pub fn set_output(&self, output: impl Into<String>) {
        *self.output.lock().expect("output lock") = output.into();
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn waits(&self) -> Vec<u64> {
        self.waits.lock().expect("waits lock").clone()
    }

    pub fn signals(&self) -> Vec<(u64, Signal)> {
        self.signals.lock().expect("signals lock").clone()
    }

    pub fn is_running(&self, handle: &ProcessHandle) -> bool {
        matches!(
            self.liveness.lock().expect("liveness lock").get(&handle.id),
            Some(FakeLiveness::Running)
        )
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<ProcessHandle, ReplayError> {
        let own_group = request.own_process_group;
        self.spawned.lock().expect("spawned lock").push(request);
        let mut next = self.next_handle.lock().expect("next lock");
        let id = *next;
        *next += 1;
        let state = match *self.exit_on_spawn.lock().expect("exit lock") {
            Some(code) => FakeLiveness::Exited(code),
            None => FakeLiveness::Running,
        };
        self.liveness
            .lock()
            .expect("liveness lock")
            .insert(id, state);
        let pid = 40_000 + id as u32;
        Ok(ProcessHandle {
            id,
            pid,
            pgid: own_group.then_some(pid),
        })
    }

    fn wait(&self, handle: &ProcessHandle) -> Result<ProcessOutput, ReplayError> {
        self.waits.lock().expect("waits lock").push(handle.id);
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            return Err(ReplayError::Process("no fake response queued".to_string()));
        }
        let response = responses.remove(0);
        if let Ok(output) = &response {
            self.liveness
                .lock()
                .expect("liveness lock")
                .insert(handle.id, FakeLiveness::Exited(output.exit_code));
        }
        response
    }

    fn try_wait(&self, handle: &ProcessHandle) -> Result<Option<i32>, ReplayError> {
        match self.liveness.lock().expect("liveness lock").get(&handle.id) {
            Some(FakeLiveness::Running) => Ok(None),
            Some(FakeLiveness::Exited(code)) => Ok(Some(*code)),
            None => Err(ReplayError::Process(format!("unknown handle {}", handle.id))),
        }
    }

    fn signal_group(&self, handle: &ProcessHandle, signal: Signal) -> Result<(), ReplayError> {
        self.signals
            .lock()
            .expect("signals lock")
            .push((handle.id, signal));
        if *self.refuse_signals.lock().expect("refuse lock") {
            return Err(ReplayError::Process(format!(
                "failed to signal process group {}: operation not permitted",
                handle.pgid.unwrap_or(handle.pid)
            )));
        }
        let mut liveness = self.liveness.lock().expect("liveness lock");
        let ignore_terminate = *self.ignore_terminate.lock().expect("ignore lock");
        if let Some(state) = liveness.get_mut(&handle.id) {
            if *state == FakeLiveness::Running {
                match signal {
                    Signal::Terminate if !ignore_terminate => *state = FakeLiveness::Exited(143),
                    Signal::Kill => *state = FakeLiveness::Exited(137),
                    Signal::Terminate => {}
                }
            }
        }
        Ok(())
    }

    fn take_output(&self, _handle: &ProcessHandle) -> Result<String, ReplayError> {
        Ok(std::mem::take(&mut *self.output.lock().expect("output lock")))
    }
}

#[derive(Default, Clone)]
pub struct FakeHttpClient {
    responses: Arc<Mutex<Vec<Result<HttpResponse, ReplayError>>>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
    clock: Option<FakeClock>,
    attempt_cost: Duration,
}

impl FakeHttpClient {
    /// Each request advances `clock` by `attempt_cost`, capped at the request timeout.
    pub fn with_clock(clock: FakeClock, attempt_cost: Duration) -> Self {
        Self {
            clock: Some(clock),
            attempt_cost,
            ..Self::default()
        }
    }

    pub fn push_response(&self, response: Result<HttpResponse, ReplayError>) {
        self.responses.lock().expect("responses lock").push(response);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl HttpClient for FakeHttpClient {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, ReplayError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if let Some(clock) = &self.clock {
            clock.advance(self.attempt_cost.min(request.timeout));
        }
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            return Err(ReplayError::Http("connection refused".to_string()));
        }
        responses.remove(0)
    }
}
