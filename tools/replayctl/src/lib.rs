pub mod config;
pub mod errors;
pub mod harness;
pub mod log_retention;
pub mod logging;
pub mod pipeline;
pub mod readiness;
pub mod runtime;
pub mod teardown;
pub mod types;
pub mod verify;

use clap::{error::ErrorKind, Args, Parser, Subcommand, ValueEnum};
use config::{load_config, CliOverrides, EnvMap, ModeDefaults, PipelineConfig};
use errors::ReplayError;
use harness::{run_pipeline, run_verification};
use logging::{append_run_log, init_run_log, structured_fallback_line};
use readiness::{local_base_url, PollPolicy, ReadinessProbe};
use runtime::ProductionRuntime;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use teardown::DEFAULT_GRACE_PERIOD;
use types::{RuntimeScope, StoreKind};
use verify::SAMPLE_PATH;

pub const SAMPLE_FLOW: &str = "testdata/sample.flow";
const LOG_DIR: &str = ".cache/replayctl/logs";

#[derive(Debug, Clone, Parser)]
#[command(name = "replayctl")]
#[command(version)]
#[command(about = "Imports captured HTTP flows into a store and serves them back through the replay server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Import the flow file, then run the replay server in the foreground.
    Run(PipelineArgs),
    /// Import the sample flow, start the replay server and check one replayed response.
    Verify(VerifyArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliStore {
    Redis,
    Sqlite,
}

impl From<CliStore> for StoreKind {
    fn from(value: CliStore) -> Self {
        match value {
            CliStore::Redis => StoreKind::Redis,
            CliStore::Sqlite => StoreKind::Sqlite,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct PipelineArgs {
    /// TOML file with pipeline defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory the replay server runs from (default: git top-level).
    #[arg(long)]
    pub root: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub store: Option<CliStore>,
    #[arg(long)]
    pub flow_file: Option<PathBuf>,
    #[arg(long)]
    pub key_prefix: Option<String>,
    #[arg(long)]
    pub listen: Option<String>,
    #[arg(long)]
    pub batch_size: Option<u32>,
    #[arg(long, default_value_t = false)]
    pub overwrite: bool,
    #[arg(long, default_value_t = false)]
    pub include_empty: bool,
    #[arg(long, default_value_t = false)]
    pub include_errors: bool,
    #[arg(long, default_value_t = false)]
    pub log_not_found: bool,
    /// Dump script passed to the capture tool (falls back to MITM_DUMP_SCRIPT).
    #[arg(long)]
    pub dump_script: Option<PathBuf>,
    #[arg(long)]
    pub redis_url: Option<String>,
    #[arg(long)]
    pub redis_addr: Option<String>,
    #[arg(long)]
    pub redis_db: Option<String>,
    #[arg(long)]
    pub redis_password: Option<String>,
    #[arg(long)]
    pub redis_timeout: Option<String>,
    #[arg(long)]
    pub sqlite_path: Option<PathBuf>,
    #[arg(long)]
    pub sqlite_timeout: Option<String>,
    /// Forward cache misses upstream and store the answers (needs --upstream).
    #[arg(long, default_value_t = false)]
    pub record_miss: bool,
    #[arg(long, default_value_t = false)]
    pub record_overwrite: bool,
    #[arg(long)]
    pub upstream: Option<String>,
    #[arg(long)]
    pub upstream_timeout: Option<String>,
    /// Replay server executable (falls back to REPLAY_SERVER_BIN, then `go run ./cmd/mitmredis`).
    #[arg(long)]
    pub server_bin: Option<String>,
    /// Directory for the JSONL run log.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl PipelineArgs {
    fn overrides(&self, fallbacks: ModeDefaults) -> CliOverrides {
        CliOverrides {
            config_path: self.config.clone(),
            root: self.root.clone(),
            store: self.store.map(Into::into),
            flow_file: self.flow_file.clone(),
            key_prefix: self.key_prefix.clone(),
            listen: self.listen.clone(),
            batch_size: self.batch_size,
            overwrite: self.overwrite,
            include_empty: self.include_empty,
            include_errors: self.include_errors,
            log_not_found: self.log_not_found,
            record_miss: self.record_miss,
            record_overwrite: self.record_overwrite,
            dump_script: self.dump_script.clone(),
            redis_url: self.redis_url.clone(),
            redis_addr: self.redis_addr.clone(),
            redis_db: self.redis_db.clone(),
            redis_password: self.redis_password.clone(),
            redis_timeout: self.redis_timeout.clone(),
            sqlite_path: self.sqlite_path.clone(),
            sqlite_timeout: self.sqlite_timeout.clone(),
            upstream: self.upstream.clone(),
            upstream_timeout: self.upstream_timeout.clone(),
            server_bin: self.server_bin.clone(),
            fallbacks,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,
    /// Request URL (default: derived from --listen).
    #[arg(long)]
    pub url: Option<String>,
    #[arg(long, default_value = "POST")]
    pub method: String,
    /// Overall readiness deadline.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}

pub fn run() -> Result<i32, ReplayError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let env = std::env::vars_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| ReplayError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new()?;
    run_with_runtime(&args, &env, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    env: &[(std::ffi::OsString, std::ffi::OsString)],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, ReplayError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp
            | ErrorKind::DisplayVersion
            | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(ReplayError::Cli(error.to_string())),
        },
    };

    let env_map = env_to_map(env);
    match cli.command {
        Command::Run(args) => {
            let (cfg, scope) = resolve(runtime, &args, ModeDefaults::default(), cwd, &env_map)?;
            start_run_log(runtime, &args, &scope, &cfg);
            run_pipeline(runtime, &cfg)
        }
        Command::Verify(args) => {
            let scratch = tempfile::tempdir().map_err(|e| ReplayError::Io(e.to_string()))?;
            let fallbacks = ModeDefaults {
                store: Some(StoreKind::Sqlite),
                flow_file: Some(PathBuf::from(SAMPLE_FLOW)),
                sqlite_path: Some(scratch.path().join(config::DEFAULT_SQLITE_FILE)),
            };
            let (cfg, scope) = resolve(runtime, &args.pipeline, fallbacks, cwd, &env_map)?;
            start_run_log(runtime, &args.pipeline, &scope, &cfg);

            let probe = ReadinessProbe {
                method: args.method.to_ascii_uppercase(),
                url: args
                    .url
                    .clone()
                    .unwrap_or_else(|| format!("{}{SAMPLE_PATH}", local_base_url(&cfg.listen))),
            };
            let policy = PollPolicy {
                timeout: Duration::from_secs(args.timeout_secs),
                ..PollPolicy::default()
            };
            run_verification(runtime, &cfg, &probe, &policy, DEFAULT_GRACE_PERIOD)?;
            Ok(0)
        }
    }
}

fn resolve(
    runtime: &ProductionRuntime,
    args: &PipelineArgs,
    fallbacks: ModeDefaults,
    cwd: &Path,
    env_map: &EnvMap,
) -> Result<(PipelineConfig, RuntimeScope), ReplayError> {
    load_config(
        &args.overrides(fallbacks),
        cwd,
        env_map,
        runtime.file_system.as_ref(),
        runtime.process_runner.as_ref(),
    )
}

fn start_run_log(
    runtime: &ProductionRuntime,
    args: &PipelineArgs,
    scope: &RuntimeScope,
    cfg: &PipelineConfig,
) {
    let dir = match &args.log_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => scope.process_cwd.join(dir),
        None => scope.root.join(LOG_DIR),
    };
    if let Err(err) = runtime.file_system.create_dir_all(&dir) {
        let _ = runtime.terminal.write_error_line(&structured_fallback_line(
            "run_log",
            "disabled",
            &err.to_string(),
        ));
        return;
    }
    let path = init_run_log(&dir);
    append_run_log(
        "info",
        "config.resolved",
        json!({
            "log_path": path.display().to_string(),
            "process_cwd": scope.process_cwd.display().to_string(),
            "repo_root": scope.repo_root.as_ref().map(|root| root.display().to_string()),
            "config": cfg.describe(),
        }),
    );
}

fn env_to_map(env: &[(std::ffi::OsString, std::ffi::OsString)]) -> EnvMap {
    let mut map = EnvMap::new();
    for (key, value) in env {
        if let (Some(key), Some(value)) = (key.to_str(), value.to_str()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command};
    use clap::{CommandFactory, Parser};

    #[test]
    fn verify_defaults_match_the_sample_request() {
        let cli = Cli::try_parse_from(["replayctl", "verify"]).expect("parse");
        let Command::Verify(args) = cli.command else {
            panic!("expected verify");
        };
        assert_eq!(args.method, "POST");
        assert_eq!(args.timeout_secs, 30);
        assert!(args.url.is_none());
        assert!(args.pipeline.store.is_none());
    }

    #[test]
    fn help_lists_subcommands_and_pipeline_flags() {
        let mut cmd = Cli::command();
        let help = cmd.render_long_help().to_string();
        assert!(help.contains("run"));
        assert!(help.contains("verify"));
        cmd.build();
        let run_help = cmd
            .find_subcommand_mut("run")
            .expect("run subcommand")
            .render_long_help()
            .to_string();
        for flag in ["--redis-url", "--record-miss", "--dump-script", "--server-bin"] {
            assert!(run_help.contains(flag), "missing {flag}");
        }
    }
}
