//! Job executor: runs a claimed job's shell command and records the outcome.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use jobq_core::{Job, QueueConfig, RetryPolicy, WorkerId};

use super::retry::{RetryOutcome, RetryScheduler};
use super::store::JobStore;
use crate::error::{QueueResult, retry_transient};

/// Per-stream capture limit.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Hard wall-clock limit per attempt
    pub timeout: Duration,
    /// Maximum bytes captured from each of stdout and stderr
    pub max_output_bytes: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl ExecutorOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            timeout: config.job_timeout(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }
}

/// Why a command run did not succeed.
///
/// Never escapes the executor: it is rendered into `last_error` and handed
/// to the retry scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionFailure {
    #[error("failed to spawn command: {0}")]
    Spawn(String),

    #[error("i/o error while running command: {0}")]
    Io(String),

    #[error("command {}", describe_exit(.code, .stderr))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command output exceeded {limit} bytes")]
    OutputOverflow { limit: usize },
}

fn describe_exit(code: &Option<i32>, stderr: &str) -> String {
    let status = match code {
        Some(code) => format!("exited with status {code}"),
        None => "terminated by signal".to_string(),
    };
    if stderr.is_empty() {
        status
    } else {
        format!("{status}: {stderr}")
    }
}

/// Captured output of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Trimmed stdout, or trimmed stderr when stdout is empty.
    pub fn summary(&self) -> Option<String> {
        [self.stdout.trim(), self.stderr.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Runs shell commands under a timeout with bounded output capture.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    options: ExecutorOptions,
}

impl CommandRunner {
    pub fn new(options: ExecutorOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Run `command` through the platform shell.
    ///
    /// Timeout and output overflow kill the shell and everything it forked.
    pub async fn run(&self, command: &str) -> Result<CommandOutput, ExecutionFailure> {
        let mut child = shell(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionFailure::Spawn(e.to_string()))?;
        let group = GroupGuard(child.id());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.options.max_output_bytes;

        let result = tokio::time::timeout(self.options.timeout, async {
            let (out, err) =
                tokio::try_join!(read_capped(stdout, limit), read_capped(stderr, limit))?;
            let status = child
                .wait()
                .await
                .map_err(|e| ExecutionFailure::Io(e.to_string()))?;
            Ok::<_, ExecutionFailure>((status, out, err))
        })
        .await;

        match result {
            Ok(Ok((status, stdout, stderr))) => {
                group.disarm();
                finish(status, stdout, stderr)
            }
            Ok(Err(failure)) => {
                kill(&mut child, group).await;
                Err(failure)
            }
            Err(_elapsed) => {
                kill(&mut child, group).await;
                Err(ExecutionFailure::Timeout(self.options.timeout))
            }
        }
    }
}

/// The shell leads its own process group so the whole tree can be killed.
#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).process_group(0);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Kills the command's process group when dropped, including when the
/// running future is cancelled.
struct GroupGuard(Option<u32>);

impl GroupGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        kill_group(self.0.take());
    }
}

#[cfg(unix)]
fn kill_group(leader: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pgid) = leader.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => debug!(pgid, error = %e, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_leader: Option<u32>) {}

async fn kill(child: &mut tokio::process::Child, group: GroupGuard) {
    drop(group);
    if let Err(e) = child.kill().await {
        debug!(error = %e, "failed to kill command");
    }
}

/// Read a stream to the end, failing once more than `limit` bytes arrive.
async fn read_capped<R>(stream: Option<R>, limit: usize) -> Result<Vec<u8>, ExecutionFailure>
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return Ok(Vec::new());
    };
    let mut buf = Vec::new();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    stream
        .take(cap)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| ExecutionFailure::Io(e.to_string()))?;
    if buf.len() > limit {
        return Err(ExecutionFailure::OutputOverflow { limit });
    }
    Ok(buf)
}

fn finish(
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
) -> Result<CommandOutput, ExecutionFailure> {
    let output = CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    };
    if status.success() {
        Ok(output)
    } else {
        Err(ExecutionFailure::NonZeroExit {
            code: status.code(),
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { output: Option<String> },
    Retrying { attempts: u32, next_retry_at: DateTime<Utc> },
    DeadLettered { attempts: u32 },
    /// The worker no longer held the job's lease; nothing was recorded.
    LeaseLost,
}

impl From<RetryOutcome> for JobOutcome {
    fn from(outcome: RetryOutcome) -> Self {
        match outcome {
            RetryOutcome::Retrying {
                attempts,
                next_retry_at,
            } => JobOutcome::Retrying {
                attempts,
                next_retry_at,
            },
            RetryOutcome::DeadLettered { attempts } => JobOutcome::DeadLettered { attempts },
            RetryOutcome::LeaseLost => JobOutcome::LeaseLost,
        }
    }
}

/// Executes claimed jobs on behalf of a worker.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    jobs: JobStore,
    scheduler: RetryScheduler,
    runner: CommandRunner,
    policy: RetryPolicy,
}

impl JobExecutor {
    pub fn new(
        jobs: JobStore,
        scheduler: RetryScheduler,
        options: ExecutorOptions,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            jobs,
            scheduler,
            runner: CommandRunner::new(options),
            policy,
        }
    }

    /// Run one attempt of a job claimed by `worker`.
    ///
    /// Bookkeeping writes are retried through transient store errors so a
    /// finished run is not left looking abandoned.
    pub async fn execute(&self, job: &Job, worker: WorkerId) -> QueueResult<JobOutcome> {
        let id = job.id.as_str();

        let started = retry_transient("begin attempt", || {
            self.jobs.begin_attempt(id, worker, Utc::now())
        })
        .await?;
        let Some(job) = started else {
            warn!(worker_id = %worker, job_id = %id, "lease lost before execution");
            return Ok(JobOutcome::LeaseLost);
        };

        info!(
            worker_id = %worker,
            job_id = %id,
            attempt = job.attempts,
            command = %job.command,
            "executing job"
        );

        match self.runner.run(&job.command).await {
            Ok(output) => {
                let output = output.summary();
                let completed = retry_transient("complete job", || {
                    self.jobs.complete(id, worker, output.clone(), Utc::now())
                })
                .await?;
                match completed {
                    Some(_) => {
                        info!(worker_id = %worker, job_id = %id, "job completed");
                        Ok(JobOutcome::Completed { output })
                    }
                    None => {
                        warn!(worker_id = %worker, job_id = %id, "lease lost during execution");
                        Ok(JobOutcome::LeaseLost)
                    }
                }
            }
            Err(failure) => {
                let error = failure.to_string();
                debug!(worker_id = %worker, job_id = %id, error = %error, "job attempt failed");
                let outcome = retry_transient("record failure", || {
                    self.scheduler
                        .schedule_retry(id, Some(worker), &error, &self.policy, Utc::now())
                })
                .await?;
                Ok(outcome.into())
            }
        }
    }
}
