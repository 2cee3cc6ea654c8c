use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("io error: {0}")]
    Io(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("missing resource: {0}")]
    MissingResource(String),
    #[error("capture import exited with status {code}: {command}")]
    UpstreamProcess { code: i32, command: String },
    #[error("request to {url} failed after {waited_ms}ms: {last_error}")]
    ReadinessTimeout {
        url: String,
        waited_ms: u128,
        last_error: String,
    },
    #[error("response mismatch\n{detail}")]
    VerificationMismatch { detail: String },
    #[error("process error: {0}")]
    Process(String),
    #[error("http error: {0}")]
    Http(String),
}

impl ReplayError {
    /// Exit status reported by the binary for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UpstreamProcess { code, .. } if *code > 0 => *code,
            _ => 1,
        }
    }
}
