//! Console reporter with live, prefixed task output

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use console::{style, Color, Style};

use gantry_tasks::{TaskEvent, TaskReporter};

const PREFIX_COLORS: [Color; 5] = [
    Color::Cyan,
    Color::Magenta,
    Color::Green,
    Color::Yellow,
    Color::Blue,
];

/// Prints task lifecycle and output lines to the terminal
pub struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

/// Stable color for a task prefix so interleaved output stays readable
fn prefix_style(prefix: &str) -> Style {
    let mut hasher = DefaultHasher::new();
    prefix.hash(&mut hasher);
    let color = PREFIX_COLORS[(hasher.finish() % PREFIX_COLORS.len() as u64) as usize];
    Style::new().fg(color)
}

impl TaskReporter for ConsoleReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Started {
                prefix, command, ..
            } => {
                println!(
                    "{} {}",
                    prefix_style(prefix).apply_to(format!("{}:", prefix)),
                    if self.verbose {
                        style(format!("cache miss, executing {}", command)).dim()
                    } else {
                        style("cache miss, executing".to_string()).dim()
                    }
                );
            }
            TaskEvent::Output {
                prefix,
                line,
                is_stderr,
                ..
            } => {
                let label = prefix_style(prefix).apply_to(format!("{}:", prefix));
                if *is_stderr {
                    eprintln!("{} {}", label, line);
                } else {
                    println!("{} {}", label, line);
                }
            }
            TaskEvent::CacheHit {
                prefix,
                hash,
                source,
                ..
            } => {
                let source = source.map(|s| format!(" ({})", s)).unwrap_or_default();
                println!(
                    "{} {}",
                    prefix_style(prefix).apply_to(format!("{}:", prefix)),
                    style(format!("cache hit{}, replaying logs {}", source, hash)).cyan()
                );
            }
            TaskEvent::Completed { id, duration, cached } => {
                if self.verbose && !cached {
                    println!(
                        "  {} {} {}",
                        style("✓").green(),
                        style(id).green(),
                        style(format!("{:.1}s", duration.as_secs_f64())).dim()
                    );
                }
            }
            TaskEvent::Failed {
                id,
                duration,
                error,
            } => {
                eprintln!(
                    "  {} {} {} {}",
                    style("✗").red(),
                    style(id).red(),
                    style(format!("{:.1}s", duration.as_secs_f64())).dim(),
                    style(error).red().dim()
                );
            }
            TaskEvent::Skipped { id, reason } => {
                if self.verbose {
                    println!(
                        "  {} {} {}",
                        style("○").yellow(),
                        style(id).yellow(),
                        style(format!("({})", reason)).dim()
                    );
                }
            }
            TaskEvent::AllCompleted {
                attempted,
                succeeded,
                failed,
                cached,
                duration,
            } => {
                println!();
                println!(
                    "  {} {:>6} {} successful, {} total",
                    if *failed == 0 {
                        style("✓").green().bold()
                    } else {
                        style("✗").red().bold()
                    },
                    style("Tasks:").bold(),
                    succeeded,
                    attempted
                );
                println!(
                    "    {:>6} {} cached, {} total",
                    style("Cached:").bold(),
                    cached,
                    attempted
                );
                println!(
                    "    {:>6} {:.3}s",
                    style("Time:").bold(),
                    duration.as_secs_f64()
                );
            }
        }
    }
}
