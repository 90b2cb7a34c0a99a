//! Graph command: show the execution plan

use clap::Args;

use crate::cli::context::RepoContext;
use crate::cli::output;
use crate::cli::{Cli, OutputFormat};
use crate::exit_codes;

/// Print the waves tasks would run in
#[derive(Debug, Args)]
pub struct GraphCommand {
    /// Tasks to plan (e.g., build test)
    #[arg(required = true)]
    pub tasks: Vec<String>,

    /// Only start from these packages (can be repeated)
    #[arg(long)]
    pub filter: Vec<String>,
}

impl GraphCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let cwd = std::env::current_dir()?;
        let ctx = RepoContext::load(&cwd)?;
        let graph = ctx.task_graph(&self.tasks, &self.filter)?;

        if cli.format == OutputFormat::Json {
            let plan: Vec<serde_json::Value> = graph
                .waves()
                .iter()
                .enumerate()
                .map(|(i, wave)| {
                    serde_json::json!({
                        "wave": i,
                        "tasks": wave.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&plan)?);
            return Ok(exit_codes::SUCCESS);
        }

        if graph.is_empty() {
            if !cli.quiet {
                output::info("No tasks to run.");
            }
            return Ok(exit_codes::SUCCESS);
        }

        if !cli.quiet {
            println!(
                "{}",
                output::header(&format!(
                    "{} across {}",
                    output::plural(graph.len(), "task"),
                    output::plural(RepoContext::packages_in_scope(&graph).len(), "package")
                ))
            );
            println!();
        }
        print!("{}", graph.execution_plan(&ctx.packages));
        Ok(exit_codes::SUCCESS)
    }
}
