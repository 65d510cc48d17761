//! Process supervision
//!
//! Runs one external command per [`ProcessRun`]:
//! - Passes an explicit environment map to the child (the worker's own
//!   environment is never modified)
//! - Streams stdout/stderr into the log, and optionally into a log file
//! - Races the exit against a timeout; a timed out child is killed and reaped
//!   before the call returns
//! - Classifies the exit code against the run's soft-fail set

use async_trait::async_trait;
use forge_core::codes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Environment variables whose values never reach the log
const MASKED_ENVARS: [&str; 1] = ["REPO_LICENSE"];

/// Command-line flags whose values never reach the log
const MASKED_FLAGS: [&str; 1] = ["--password"];

/// How long to keep draining output after the child has exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One supervised external command
#[derive(Debug, Clone)]
pub struct ProcessRun {
    pub executable: PathBuf,

    pub arguments: Vec<String>,

    /// Non-zero exit codes treated as success
    pub success_codes: Vec<i32>,

    pub timeout: Duration,

    /// Extra environment for this invocation only
    pub env: BTreeMap<String, String>,

    /// Tag for the child's log lines (e.g., "CONVERTER")
    pub label: String,

    /// File the child's output is appended to
    pub output_log: Option<PathBuf>,
}

impl ProcessRun {
    pub fn new(
        executable: impl Into<PathBuf>,
        arguments: Vec<String>,
        timeout: Duration,
        label: impl Into<String>,
    ) -> Self {
        Self {
            executable: executable.into(),
            arguments,
            success_codes: Vec::new(),
            timeout,
            env: BTreeMap::new(),
            label: label.into(),
            output_log: None,
        }
    }

    pub fn with_success_codes(mut self, codes: &[i32]) -> Self {
        self.success_codes = codes.to_vec();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_output_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_log = Some(path.into());
        self
    }

    /// Whether `code` counts as a successful exit for this run
    pub fn is_success(&self, code: i32) -> bool {
        code == codes::OK || self.success_codes.contains(&code)
    }
}

/// Errors that can end a supervised run
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for {label}: {source}")]
    Wait {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{label} timed out after {timeout:?}")]
    Timeout { label: String, timeout: Duration },

    #[error("{label} exited with code {code}")]
    Exited { label: String, code: i32 },

    /// The platform reported no exit code (e.g., killed by a signal)
    #[error("{label} terminated without an exit code")]
    Crashed { label: String },
}

impl ProcessError {
    /// Return code reported for this failure
    pub fn code(&self) -> i32 {
        match self {
            ProcessError::Spawn { .. } | ProcessError::Wait { .. } => codes::CONVERTER_CRASH,
            ProcessError::Timeout { .. } => codes::TIMEOUT,
            ProcessError::Exited { code, .. } => *code,
            ProcessError::Crashed { .. } => codes::UNKNOWN,
        }
    }
}

/// Runs external commands
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs `run` to completion
    ///
    /// Resolves with the exit code when it is 0 or one of the run's success
    /// codes.
    async fn run(&self, run: ProcessRun) -> Result<i32, ProcessError>;
}

/// [`ProcessRunner`] backed by real child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for ProcessSupervisor {
    async fn run(&self, run: ProcessRun) -> Result<i32, ProcessError> {
        let label = run.label.clone();

        for (key, value) in &run.env {
            let shown = if MASKED_ENVARS.contains(&key.as_str()) {
                "********"
            } else {
                value.as_str()
            };
            info!("[{}] [ENVAR]: {} - {}", label, key, shown);
        }

        info!(
            "[{}] Executing command: {} {}",
            label,
            run.executable.display(),
            loggable_arguments(&run.arguments)
        );

        let mut child = Command::new(&run.executable)
            .args(&run.arguments)
            .envs(&run.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                executable: run.executable.display().to_string(),
                source,
            })?;

        let log_file = match &run.output_log {
            Some(path) => open_output_log(path).await,
            None => None,
        };

        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(
                stdout,
                label.clone(),
                false,
                log_file.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(
                stderr,
                label.clone(),
                true,
                log_file.clone(),
            )));
        }

        let status = match tokio::time::timeout(run.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                abort_all(&readers);
                return Err(ProcessError::Wait { label, source });
            }
            Err(_) => {
                warn!("[{}] Timed out after {:?}, killing process", label, run.timeout);
                // kill() also reaps the child
                if let Err(e) = child.kill().await {
                    error!("[{}] Failed to kill process: {}", label, e);
                }
                abort_all(&readers);
                return Err(ProcessError::Timeout {
                    label,
                    timeout: run.timeout,
                });
            }
        };

        for reader in readers {
            // Output may stay open if the child left descendants behind
            let abort = reader.abort_handle();
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!("[{}] Output still open after exit, detaching", label);
                abort.abort();
            }
        }

        match status.code() {
            Some(code) if run.is_success(code) => {
                info!("[{}] Process exited with code {}", label, code);
                Ok(code)
            }
            Some(code) => {
                error!("[{}] Process exited with code {}", label, code);
                Err(ProcessError::Exited { label, code })
            }
            None => {
                error!("[{}] Process terminated without an exit code", label);
                Err(ProcessError::Crashed { label })
            }
        }
    }
}

type SharedLog = Arc<Mutex<File>>;

async fn open_output_log(path: &Path) -> Option<SharedLog> {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!("Failed to create log directory {}: {}", parent.display(), e);
            return None;
        }
    }

    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(Arc::new(Mutex::new(file))),
        Err(e) => {
            warn!("Failed to open output log {}: {}", path.display(), e);
            None
        }
    }
}

async fn forward_lines<R>(reader: R, label: String, is_stderr: bool, log_file: Option<SharedLog>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!("[{}] {}", label, line);
        } else {
            info!("[{}] {}", label, line);
        }

        if let Some(file) = &log_file {
            let mut file = file.lock().await;
            if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
                debug!("[{}] Failed to write output log: {}", label, e);
            }
        }
    }

    if let Some(file) = &log_file {
        if let Err(e) = file.lock().await.flush().await {
            debug!("[{}] Failed to flush output log: {}", label, e);
        }
    }
}

/// Arguments joined for logging, with secret flag values masked
fn loggable_arguments(arguments: &[String]) -> String {
    let mut shown = Vec::with_capacity(arguments.len());
    let mut mask_next = false;

    for argument in arguments {
        if mask_next {
            shown.push("********".to_string());
            mask_next = false;
            continue;
        }

        match argument.split_once('=') {
            Some((flag, _)) if MASKED_FLAGS.contains(&flag) => {
                shown.push(format!("{}=********", flag));
            }
            _ => {
                mask_next = MASKED_FLAGS.contains(&argument.as_str());
                shown.push(argument.clone());
            }
        }
    }

    shown.join(" ")
}

fn abort_all(readers: &[JoinHandle<()>]) {
    for reader in readers {
        reader.abort();
    }
}
