//! Task execution: cache restore or shell command, then cache write

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use gantry_cache::{Cache, CacheSource, ItemStatus};
use gantry_core::{EnvMode, OutputMode};

use crate::daemon::OutputWatcher;
use crate::env::EnvironmentVariableMap;
use crate::error::{HashError, TaskError};
use crate::hash::expand_outputs;
use crate::reporter::{TaskEvent, TaskReporter};
use crate::summary::{CacheSummary, ExecutionSummary, TaskSummary};
use crate::task::{PackageTask, TaskId};

/// Executes one hashed task
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: PackageTask, summary: TaskSummary) -> Result<(), TaskError>;

    /// `task` will not run because a dependency failed
    fn blocked(&self, _task: &TaskId) {}
}

/// Settings for real runs
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Ignore existing cache entries (results are still written)
    pub force: bool,
    /// Keep scheduling other tasks after a failure
    pub continue_on_error: bool,
    /// Overrides every task's configured output mode
    pub output_mode: Option<OutputMode>,
    pub single_package: bool,
    /// `globalEnv` patterns, visible to strict-mode tasks
    pub global_env: Vec<String>,
    /// `globalPassThroughEnv` patterns, visible to strict-mode tasks
    pub global_pass_through_env: Option<Vec<String>>,
}

/// Runs task commands through `sh -c` in the package directory
pub struct ShellTaskRunner {
    repo_root: PathBuf,
    cache: Arc<dyn Cache>,
    reporter: Arc<dyn TaskReporter>,
    watcher: Option<Arc<dyn OutputWatcher>>,
    env: EnvironmentVariableMap,
    opts: RunOptions,
    cancel: CancellationToken,
    stats: Mutex<ExecutionSummary>,
    summaries: Mutex<Vec<TaskSummary>>,
}

impl ShellTaskRunner {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        cache: Arc<dyn Cache>,
        reporter: Arc<dyn TaskReporter>,
        env: EnvironmentVariableMap,
        opts: RunOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            cache,
            reporter,
            watcher: None,
            env,
            opts,
            cancel,
            stats: Mutex::new(ExecutionSummary::default()),
            summaries: Mutex::new(Vec::new()),
        }
    }

    /// Consult `watcher` before restoring cache hits
    pub fn with_watcher(mut self, watcher: Arc<dyn OutputWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn stats(&self) -> ExecutionSummary {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Summaries of every task this runner saw, in completion order
    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.summaries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn bump(&self, update: impl FnOnce(&mut ExecutionSummary)) {
        update(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }

    fn record(&self, summary: TaskSummary) {
        self.summaries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(summary);
    }

    /// Restore outputs for a cache hit; `None` on a miss
    async fn try_restore(
        &self,
        task: &PackageTask,
        prefix: &str,
        mode: OutputMode,
    ) -> Result<Option<ItemStatus>, TaskError> {
        let globs = task.repo_relative_outputs().inclusions;

        if let Some(watcher) = &self.watcher {
            let (changed, time_saved) = watcher.get_changed_outputs(&task.hash, &globs).await;
            if changed.is_empty() {
                debug!(task = %task.id, "Outputs unchanged on disk, skipping restore");
                let status = ItemStatus::hit(CacheSource::Fs, time_saved);
                self.replay(task, prefix, mode, status).await;
                return Ok(Some(status));
            }
        }

        let (status, files) = self.cache.fetch(&self.repo_root, &task.hash).await?;
        if !status.hit {
            return Ok(None);
        }
        debug!(task = %task.id, files = files.len(), "Restored outputs from cache");

        if let Some(watcher) = &self.watcher {
            watcher
                .notify_outputs_written(&task.hash, &globs, status.time_saved)
                .await;
        }
        self.replay(task, prefix, mode, status).await;
        Ok(Some(status))
    }

    /// Report a cache hit, replaying the saved log in `full` mode
    async fn replay(&self, task: &PackageTask, prefix: &str, mode: OutputMode, status: ItemStatus) {
        self.reporter.report(&TaskEvent::CacheHit {
            id: task.id.clone(),
            prefix: prefix.to_string(),
            hash: task.hash.clone(),
            source: status.source,
            time_saved: Duration::from_millis(status.time_saved),
        });
        if mode != OutputMode::Full {
            return;
        }
        match tokio::fs::read_to_string(self.repo_root.join(task.log_file())).await {
            Ok(log) => {
                for line in log.lines() {
                    self.reporter.report(&TaskEvent::Output {
                        id: task.id.clone(),
                        prefix: prefix.to_string(),
                        line: line.to_string(),
                        is_stderr: false,
                    });
                }
            }
            Err(e) => debug!(task = %task.id, error = %e, "No log to replay"),
        }
    }

    /// Environment for the child process
    fn child_env(&self, task: &PackageTask) -> Result<Option<EnvironmentVariableMap>, TaskError> {
        if task.env_mode != EnvMode::Strict {
            return Ok(None);
        }
        let mut declared = self.opts.global_env.clone();
        declared.extend(task.definition.env.iter().cloned());
        let mut pass_through = self.opts.global_pass_through_env.clone().unwrap_or_default();
        pass_through.extend(task.definition.pass_through_env.iter().flatten().cloned());
        let allowed = self
            .env
            .strict_child_env(&declared, &pass_through)
            .map_err(HashError::from)?;
        Ok(Some(allowed))
    }

    /// Run the command, streaming output to the log file and the reporter
    async fn run_command(
        &self,
        task: &PackageTask,
        command: &str,
        prefix: &str,
        mode: OutputMode,
    ) -> Result<(), TaskError> {
        let log_path = self.repo_root.join(task.log_file());
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut log = tokio::fs::File::create(&log_path).await?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(full_command(command, &task.pass_through_args))
            .current_dir(self.repo_root.join(&task.dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = self.child_env(task)? {
            cmd.env_clear().envs(env.iter());
        }
        cmd.env("GANTRY_HASH", &task.hash);

        let mut child = cmd.spawn().map_err(|source| TaskError::Spawn {
            task: task.id.clone(),
            source,
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, false, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, true, tx.clone()));
        }
        drop(tx);

        loop {
            tokio::select! {
                next = rx.recv() => {
                    let Some((line, is_stderr)) = next else {
                        break;
                    };
                    log.write_all(line.as_bytes()).await?;
                    log.write_all(b"\n").await?;
                    if mode != OutputMode::None {
                        self.reporter.report(&TaskEvent::Output {
                            id: task.id.clone(),
                            prefix: prefix.to_string(),
                            line,
                            is_stderr,
                        });
                    }
                }
                _ = self.cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(TaskError::Cancelled(task.id.clone()));
                }
            }
        }
        log.flush().await?;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = self.cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(TaskError::Cancelled(task.id.clone()));
            }
        };
        if status.success() {
            Ok(())
        } else {
            Err(TaskError::Failed {
                task: task.id.clone(),
                code: status.code(),
            })
        }
    }

    /// Archive the task's outputs. Failures only warn.
    async fn save_outputs(&self, task: &PackageTask, duration: Duration) {
        let root = self.repo_root.clone();
        let dir = task.dir.clone();
        let outputs = task.hashable_outputs();
        let files = match tokio::task::spawn_blocking(move || expand_outputs(&root, &dir, &outputs)).await {
            Ok(Ok(files)) => files,
            Ok(Err(e)) => {
                warn!(task = %task.id, error = %e, "Failed to collect outputs");
                return;
            }
            Err(e) => {
                warn!(task = %task.id, error = %e, "Failed to collect outputs");
                return;
            }
        };

        let duration_ms = duration.as_millis() as u64;
        if let Err(e) = self
            .cache
            .put(&self.repo_root, &task.hash, duration_ms, &files)
            .await
        {
            warn!(task = %task.id, hash = %task.hash, error = %e, "Failed to cache outputs");
            return;
        }
        if let Some(watcher) = &self.watcher {
            let globs = task.repo_relative_outputs().inclusions;
            watcher
                .notify_outputs_written(&task.hash, &globs, duration_ms)
                .await;
        }
    }
}

#[async_trait]
impl TaskRunner for ShellTaskRunner {
    async fn run(&self, task: PackageTask, mut summary: TaskSummary) -> Result<(), TaskError> {
        self.bump(|s| s.attempted += 1);

        let Some(command) = task.command.clone() else {
            self.reporter.report(&TaskEvent::Skipped {
                id: task.id.clone(),
                reason: "no script defined".to_string(),
            });
            self.bump(|s| s.succeeded += 1);
            self.record(summary);
            return Ok(());
        };
        let prefix = task.output_prefix(self.opts.single_package);
        let mode = self.opts.output_mode.unwrap_or(task.definition.output_mode);

        if task.definition.cache && !self.opts.force {
            if let Some(status) = self.try_restore(&task, &prefix, mode).await? {
                self.reporter.report(&TaskEvent::Completed {
                    id: task.id.clone(),
                    duration: Duration::ZERO,
                    cached: true,
                });
                self.bump(|s| {
                    s.cached += 1;
                    s.succeeded += 1;
                });
                summary.cache = CacheSummary::from(status);
                self.record(summary);
                return Ok(());
            }
        }

        self.reporter.report(&TaskEvent::Started {
            id: task.id.clone(),
            prefix: prefix.clone(),
            command: command.clone(),
        });
        let start = Instant::now();
        let result = self.run_command(&task, &command, &prefix, mode).await;
        let duration = start.elapsed();
        self.record(summary);

        match result {
            Ok(()) => {
                if task.definition.cache {
                    self.save_outputs(&task, duration).await;
                }
                self.reporter.report(&TaskEvent::Completed {
                    id: task.id.clone(),
                    duration,
                    cached: false,
                });
                self.bump(|s| s.succeeded += 1);
                Ok(())
            }
            Err(err) => {
                self.reporter.report(&TaskEvent::Failed {
                    id: task.id.clone(),
                    duration,
                    error: err.to_string(),
                });
                self.bump(|s| s.failed += 1);
                if self.opts.continue_on_error || matches!(err, TaskError::Cancelled(_)) {
                    Err(err)
                } else {
                    Err(err.stop_execution())
                }
            }
        }
    }

    fn blocked(&self, task: &TaskId) {
        self.reporter.report(&TaskEvent::Skipped {
            id: task.clone(),
            reason: "a dependency failed".to_string(),
        });
    }
}

async fn forward_lines<R>(reader: R, is_stderr: bool, tx: mpsc::UnboundedSender<(String, bool)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((line, is_stderr)).is_err() {
            break;
        }
    }
}

/// Append shell-quoted pass-through arguments to a command
fn full_command(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        return command.to_string();
    }
    let quoted: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
    format!("{} {}", command, quoted.join(" "))
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}
