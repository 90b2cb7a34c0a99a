//! Dry runs: hash everything, run nothing

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use gantry_cache::Cache;

use crate::error::TaskError;
use crate::runner::TaskRunner;
use crate::summary::{CacheSummary, TaskSummary};
use crate::task::PackageTask;

/// Maximum concurrent cache probes while filling in summaries
pub const CACHE_PROBE_CONCURRENCY: usize = 8;

/// Collects task summaries instead of executing commands.
/// Meant to be driven with `ExecutionOptions::serial()`.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    summaries: Mutex<Vec<TaskSummary>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collected summaries in visit order
    pub fn into_summaries(self) -> Vec<TaskSummary> {
        self.summaries.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.summaries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl TaskRunner for DryRunRunner {
    async fn run(&self, task: PackageTask, summary: TaskSummary) -> Result<(), TaskError> {
        debug!(task = %task.id, hash = %task.hash, "Dry run");
        self.summaries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(summary);
        Ok(())
    }
}

/// Fill in each summary's cache state with at most
/// [`CACHE_PROBE_CONCURRENCY`] `exists` probes in flight.
pub async fn populate_cache_state(cache: Arc<dyn Cache>, summaries: &mut [TaskSummary]) {
    let mut probes: JoinSet<(usize, CacheSummary)> = JoinSet::new();
    let mut pending = summaries
        .iter()
        .enumerate()
        .filter(|(_, s)| s.resolved_task_definition.cache)
        .map(|(i, s)| (i, s.hash.clone()))
        .collect::<Vec<_>>()
        .into_iter();

    loop {
        while probes.len() < CACHE_PROBE_CONCURRENCY {
            let Some((index, hash)) = pending.next() else {
                break;
            };
            let cache = cache.clone();
            probes.spawn(async move {
                let state = match cache.exists(&hash).await {
                    Ok(status) => CacheSummary::from(status),
                    Err(e) => {
                        warn!(hash = %hash, error = %e, "Cache probe failed");
                        CacheSummary::miss()
                    }
                };
                (index, state)
            });
        }

        match probes.join_next().await {
            Some(Ok((index, state))) => summaries[index].cache = state,
            Some(Err(e)) => warn!(error = %e, "Cache probe panicked"),
            None => break,
        }
    }
}
