//! Run command: execute tasks across the workspace

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Args, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use gantry_cache::{new_cache, Cache, CacheOpts, RemoteCacheOpts, TracingRecorder};
use gantry_core::config::defaults::{OUTPUT_STATE_FILE, TASK_LOG_DIR};
use gantry_core::{OutputMode, ROOT_PKG_NAME};
use gantry_tasks::hash::{calculate_global_hash, get_global_hash_inputs};
use gantry_tasks::{
    populate_cache_state, ContinuationPolicy, DryRunRunner, Engine, EnvironmentVariableMap,
    ExecutionOptions, GlobalHashSummary, OutputTracker, PackageTaskVisitor, RunOptions,
    RunSummary, ShellTaskRunner, TaskEvent, TaskHashTracker, TaskReporter, TaskReporterRegistry,
    VisitorOptions,
};

use crate::cli::context::RepoContext;
use crate::cli::output::{self, ConsoleReporter};
use crate::cli::{Cli, OutputFormat};
use crate::exit_codes;

/// Rendering of a dry run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DryRunFormat {
    Text,
    Json,
}

/// Which task output reaches the terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputLogs {
    /// Everything, including logs replayed from the cache
    Full,
    /// Only output of tasks that actually ran
    New,
    /// Nothing
    None,
}

impl From<OutputLogs> for OutputMode {
    fn from(logs: OutputLogs) -> Self {
        match logs {
            OutputLogs::Full => OutputMode::Full,
            OutputLogs::New => OutputMode::New,
            OutputLogs::None => OutputMode::None,
        }
    }
}

/// Run tasks across the workspace
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Tasks to run (e.g., build test lint)
    #[arg(required = true)]
    pub tasks: Vec<String>,

    /// Only start from these packages (can be repeated)
    #[arg(long)]
    pub filter: Vec<String>,

    /// Maximum concurrent tasks
    #[arg(long, env = "GANTRY_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Ignore task dependencies and run everything at once
    #[arg(long)]
    pub parallel: bool,

    /// Keep running other tasks after a failure
    #[arg(long = "continue")]
    pub continue_on_error: bool,

    /// Hash every task and report what would run
    #[arg(
        long,
        value_enum,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "text"
    )]
    pub dry_run: Option<DryRunFormat>,

    /// Ignore existing cache entries
    #[arg(long)]
    pub force: bool,

    /// Disable the task cache
    #[arg(long)]
    pub no_cache: bool,

    /// Only use the remote cache
    #[arg(long)]
    pub remote_only: bool,

    /// Override every task's output mode
    #[arg(long, value_enum)]
    pub output_logs: Option<OutputLogs>,

    /// Remote cache base URL
    #[arg(long, env = "GANTRY_REMOTE_CACHE_URL")]
    pub remote_cache_url: Option<String>,

    /// Remote cache bearer token
    #[arg(long, env = "GANTRY_REMOTE_CACHE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Remote cache team
    #[arg(long, env = "GANTRY_TEAM")]
    pub team: Option<String>,

    /// Arguments passed to the requested tasks
    #[arg(last = true)]
    pub pass_through_args: Vec<String>,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    /// Cache tiers for this run: flags override the config file
    fn cache_opts(&self, ctx: &RepoContext) -> CacheOpts {
        let cache = &ctx.config.cache;
        let remote_enabled = cache.remote.enabled || self.remote_cache_url.is_some();
        let remote = self
            .remote_cache_url
            .clone()
            .or_else(|| cache.remote.url.clone())
            .filter(|_| remote_enabled)
            .map(|url| RemoteCacheOpts {
                url,
                token: self.token.clone().or_else(|| cache.remote.token.clone()),
                team: self.team.clone().or_else(|| cache.remote.team.clone()),
                timeout: Duration::from_secs(cache.remote.timeout_secs),
            });

        CacheOpts {
            dir: ctx.cache_dir(),
            disabled: self.no_cache || (!cache.enabled && remote.is_none()),
            skip_filesystem: self.remote_only || !cache.enabled,
            remote,
        }
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<i32> {
        let cwd = std::env::current_dir()?;
        let ctx = RepoContext::load(&cwd)?;

        let concurrency = self.concurrency.unwrap_or(ctx.config.concurrency);
        if concurrency == 0 {
            anyhow::bail!("--concurrency must be at least 1");
        }

        let graph = Arc::new(ctx.task_graph(&self.tasks, &self.filter)?);
        if graph.is_empty() {
            if !cli.quiet {
                output::info("No tasks to run.");
            }
            return Ok(exit_codes::SUCCESS);
        }
        let scope = RepoContext::packages_in_scope(&graph);

        let env = EnvironmentVariableMap::from_process();
        let root_external = ctx
            .packages
            .package(ROOT_PKG_NAME)
            .map(|p| p.external_dependencies.clone())
            .unwrap_or_default();
        let lockfile = ctx.workspace.lockfile();
        let global_inputs = get_global_hash_inputs(
            &ctx.root,
            &ctx.config,
            ctx.config_path.as_deref(),
            lockfile.as_deref(),
            &root_external,
            &env,
        )
        .context("Failed to collect global hash inputs")?;
        let global_hash = calculate_global_hash(&global_inputs)?;
        debug!(hash = %global_hash, "Global hash");

        let cache: Arc<dyn Cache> = Arc::new(
            new_cache(&self.cache_opts(&ctx), Arc::new(TracingRecorder))
                .context("Failed to open the task cache")?,
        );
        let tracker = Arc::new(TaskHashTracker::new(&ctx.root, global_hash, env.clone()));

        let RepoContext {
            root,
            config,
            packages,
            ..
        } = ctx;
        let env_mode = config.env_mode;
        let single_package = packages.is_single_package();
        let run_opts = RunOptions {
            force: self.force,
            continue_on_error: self.continue_on_error,
            output_mode: self.output_logs.map(OutputMode::from),
            single_package,
            global_env: config.global_env.clone(),
            global_pass_through_env: config.global_pass_through_env.clone(),
        };
        let config = Arc::new(config);
        let packages = Arc::new(packages);
        let visitor_opts = VisitorOptions {
            targets: self.tasks.clone(),
            pass_through_args: self.pass_through_args.clone(),
            parallel: self.parallel,
        };

        if let Some(format) = self.dry_run {
            let runner = Arc::new(DryRunRunner::new());
            let visitor = PackageTaskVisitor::new(
                config,
                packages,
                graph.clone(),
                tracker,
                runner.clone(),
                visitor_opts,
            )?;
            let errors = Engine::new(graph)
                .execute(
                    Arc::new(visitor),
                    ExecutionOptions::serial(),
                    CancellationToken::new(),
                )
                .await;
            if let Some(err) = errors.into_iter().next() {
                cache.shutdown().await;
                return Err(anyhow::Error::new(err).context("Dry run failed"));
            }

            let mut summaries = runner.summaries();
            populate_cache_state(cache.clone(), &mut summaries).await;
            cache.shutdown().await;

            let summary = RunSummary::new(
                GlobalHashSummary::from(&global_inputs),
                scope,
                env_mode,
                summaries,
            );
            match format {
                DryRunFormat::Text => print!("{}", summary.render_text()),
                DryRunFormat::Json => println!("{}", summary.to_json()?),
            }
            return Ok(exit_codes::SUCCESS);
        }

        if !cli.quiet && cli.format == OutputFormat::Text {
            output::info(&format!(
                "Running {} in {}",
                self.tasks.join(", "),
                output::plural(scope.len(), "package")
            ));
        }

        let cancel = CancellationToken::new();
        let ctrl_c = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, stopping running tasks");
                    cancel.cancel();
                }
            })
        };

        let mut registry = TaskReporterRegistry::new();
        if !cli.quiet && cli.format == OutputFormat::Text {
            registry.register(ConsoleReporter::new(cli.verbose > 0));
        }
        let reporter: Arc<dyn TaskReporter> = Arc::new(registry);

        let outputs = Arc::new(OutputTracker::open(
            &root,
            root.join(TASK_LOG_DIR).join(OUTPUT_STATE_FILE),
        ));
        let runner = Arc::new(
            ShellTaskRunner::new(
                &root,
                cache.clone(),
                reporter.clone(),
                env,
                run_opts,
                cancel.clone(),
            )
            .with_watcher(outputs.clone()),
        );
        let visitor = PackageTaskVisitor::new(
            config,
            packages,
            graph.clone(),
            tracker,
            runner.clone(),
            visitor_opts,
        )?;
        let exec_opts = ExecutionOptions {
            concurrency,
            parallel: self.parallel,
            policy: if self.continue_on_error {
                ContinuationPolicy::Continue
            } else {
                ContinuationPolicy::Block
            },
        };

        let start = Instant::now();
        let errors = Engine::new(graph)
            .execute(Arc::new(visitor), exec_opts, cancel.clone())
            .await;
        ctrl_c.abort();
        if let Err(e) = outputs.save() {
            warn!(error = %e, "Failed to save output state");
        }

        let stats = runner.stats();
        reporter.report(&TaskEvent::AllCompleted {
            attempted: stats.attempted,
            succeeded: stats.succeeded,
            failed: stats.failed,
            cached: stats.cached,
            duration: start.elapsed(),
        });
        cache.shutdown().await;

        if cli.format == OutputFormat::Json {
            let summary = RunSummary::new(
                GlobalHashSummary::from(&global_inputs),
                scope,
                env_mode,
                runner.summaries(),
            )
            .with_execution(stats);
            println!("{}", summary.to_json()?);
        }

        if cancel.is_cancelled() {
            output::warning("Run cancelled");
            return Ok(exit_codes::CANCELLED);
        }
        if !errors.is_empty() {
            for err in &errors {
                output::error(&err.to_string());
            }
            return Ok(exit_codes::TASK_FAILED);
        }
        Ok(exit_codes::SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use gantry_core::config::{CacheConfig, RemoteCacheConfig};
    use gantry_core::{Config, PackageGraph, Workspace};
    use std::path::PathBuf;

    use crate::cli::Commands;

    fn parse(args: &[&str]) -> RunCommand {
        let mut argv = vec!["gantry", "run"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(cmd) => cmd,
            other => panic!("unexpected command {:?}", other),
        }
    }

    fn context(config: Config) -> RepoContext {
        let root = PathBuf::from("/repo");
        RepoContext {
            root: root.clone(),
            config,
            config_path: None,
            workspace: Workspace::new(root.clone(), gantry_core::monorepo::WorkspaceType::Npm),
            packages: PackageGraph::build(root, &[]).unwrap(),
        }
    }

    #[test]
    fn test_parse_flags() {
        let cmd = parse(&[
            "build",
            "test",
            "--filter",
            "web",
            "--continue",
            "--dry-run=json",
            "--output-logs",
            "new",
            "--",
            "--watch",
        ]);
        assert_eq!(cmd.tasks, vec!["build", "test"]);
        assert_eq!(cmd.filter, vec!["web"]);
        assert!(cmd.continue_on_error);
        assert_eq!(cmd.dry_run, Some(DryRunFormat::Json));
        assert_eq!(cmd.output_logs.map(OutputMode::from), Some(OutputMode::New));
        assert_eq!(cmd.pass_through_args, vec!["--watch"]);
    }

    #[test]
    fn test_bare_dry_run_defaults_to_text() {
        let cmd = parse(&["build", "--dry-run"]);
        assert_eq!(cmd.dry_run, Some(DryRunFormat::Text));
        assert!(parse(&["build"]).dry_run.is_none());
    }

    #[test]
    fn test_cache_opts_local_only() {
        let ctx = context(Config::default());
        let opts = parse(&["build"]).cache_opts(&ctx);
        assert_eq!(opts.dir, PathBuf::from("/repo/.gantry/cache"));
        assert!(!opts.disabled);
        assert!(!opts.skip_filesystem);
        assert!(opts.remote.is_none());

        assert!(parse(&["build", "--no-cache"]).cache_opts(&ctx).disabled);
    }

    #[test]
    fn test_cache_opts_remote_from_config_and_flags() {
        let config = Config {
            cache: CacheConfig {
                remote: RemoteCacheConfig {
                    enabled: true,
                    url: Some("https://cache.example.com".to_string()),
                    token: Some("config-token".to_string()),
                    team: None,
                    timeout_secs: 5,
                },
                ..CacheConfig::default()
            },
            ..Config::default()
        };
        let ctx = context(config);

        let opts = parse(&["build", "--token", "flag-token", "--remote-only"]).cache_opts(&ctx);
        let remote = opts.remote.unwrap();
        assert_eq!(remote.url, "https://cache.example.com");
        assert_eq!(remote.token.as_deref(), Some("flag-token"));
        assert_eq!(remote.timeout, Duration::from_secs(5));
        assert!(opts.skip_filesystem);
    }
}
