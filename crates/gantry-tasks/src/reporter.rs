//! Task execution reporting

use std::sync::{Arc, Mutex};
use std::time::Duration;

use gantry_cache::CacheSource;

use crate::task::TaskId;

/// Events emitted while tasks run
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task command is starting
    Started {
        id: TaskId,
        prefix: String,
        command: String,
    },
    /// A line of task output, live or replayed from the log
    Output {
        id: TaskId,
        prefix: String,
        line: String,
        is_stderr: bool,
    },
    /// Outputs were restored instead of running the command
    CacheHit {
        id: TaskId,
        prefix: String,
        hash: String,
        source: Option<CacheSource>,
        time_saved: Duration,
    },
    /// A task completed successfully
    Completed {
        id: TaskId,
        duration: Duration,
        cached: bool,
    },
    /// A task failed
    Failed {
        id: TaskId,
        duration: Duration,
        error: String,
    },
    /// Nothing to run (no script in this package)
    Skipped { id: TaskId, reason: String },
    /// The run finished
    AllCompleted {
        attempted: usize,
        succeeded: usize,
        failed: usize,
        cached: usize,
        duration: Duration,
    },
}

/// Trait for reporting task execution progress
pub trait TaskReporter: Send + Sync {
    /// Handle a task event
    fn report(&self, event: &TaskEvent);
}

/// Reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Started { id, command, .. } => {
                tracing::info!(task = %id, command = %command, "Task started");
            }
            TaskEvent::Output {
                id,
                line,
                is_stderr,
                ..
            } => {
                tracing::trace!(task = %id, stderr = is_stderr, "{}", line);
            }
            TaskEvent::CacheHit {
                id,
                hash,
                source,
                time_saved,
                ..
            } => {
                tracing::info!(
                    task = %id,
                    hash = %hash,
                    source = ?source,
                    saved_ms = time_saved.as_millis() as u64,
                    "Cache hit, replaying outputs"
                );
            }
            TaskEvent::Completed { id, duration, cached } => {
                tracing::info!(
                    task = %id,
                    cached,
                    "Task completed in {:.1}s",
                    duration.as_secs_f64()
                );
            }
            TaskEvent::Failed { id, duration, error } => {
                tracing::error!(
                    task = %id,
                    "Task failed after {:.1}s: {}",
                    duration.as_secs_f64(),
                    error
                );
            }
            TaskEvent::Skipped { id, reason } => {
                tracing::debug!(task = %id, "Task skipped: {}", reason);
            }
            TaskEvent::AllCompleted {
                attempted,
                succeeded,
                failed,
                cached,
                duration,
            } => {
                tracing::info!(
                    attempted,
                    succeeded,
                    failed,
                    cached,
                    "Run complete in {:.1}s",
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Output lines reported for one task
    pub fn lines(&self, id: &TaskId) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TaskEvent::Output { id: task, line, .. } if &task == id => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Fans events out to every registered reporter
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    pub fn register_shared(&mut self, reporter: Arc<dyn TaskReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn TaskReporter>] {
        &self.reporters
    }
}

impl TaskReporter for TaskReporterRegistry {
    fn report(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(id: &TaskId, line: &str) -> TaskEvent {
        TaskEvent::Output {
            id: id.clone(),
            prefix: id.to_string(),
            line: line.to_string(),
            is_stderr: false,
        }
    }

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::default();
        let id = TaskId::new("core", "build");
        let other = TaskId::new("web", "build");

        reporter.report(&TaskEvent::Started {
            id: id.clone(),
            prefix: "core:build".to_string(),
            command: "tsc".to_string(),
        });
        reporter.report(&output(&id, "compiled"));
        reporter.report(&output(&other, "elsewhere"));
        reporter.report(&TaskEvent::Completed {
            id: id.clone(),
            duration: Duration::from_secs(5),
            cached: false,
        });

        assert_eq!(reporter.events().len(), 4);
        assert_eq!(reporter.lines(&id), vec!["compiled"]);
    }

    #[test]
    fn test_tracing_reporter() {
        let reporter = TracingReporter;
        let id = TaskId::new("core", "build");

        // Just verify it doesn't panic
        reporter.report(&TaskEvent::CacheHit {
            id: id.clone(),
            prefix: "core:build".to_string(),
            hash: "abc".to_string(),
            source: Some(CacheSource::Fs),
            time_saved: Duration::from_millis(1200),
        });
        reporter.report(&TaskEvent::Completed {
            id,
            duration: Duration::from_secs(1),
            cached: true,
        });
    }

    #[test]
    fn test_registry_broadcasts() {
        let collecting = Arc::new(CollectingReporter::default());
        let mut registry = TaskReporterRegistry::empty();
        assert!(registry.all().is_empty());

        registry.register(TracingReporter);
        registry.register_shared(collecting.clone());
        assert_eq!(registry.all().len(), 2);

        registry.report(&TaskEvent::Skipped {
            id: TaskId::new("docs", "build"),
            reason: "no script".to_string(),
        });
        assert_eq!(collecting.events().len(), 1);
    }
}
