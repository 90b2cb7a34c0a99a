//! Cache usage events

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::CacheSource;

/// Whether a lookup found an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheEventKind {
    Hit,
    Miss,
}

/// One cache lookup outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub source: CacheSource,
    pub event: CacheEventKind,
    pub hash: String,
    /// Milliseconds saved by a hit, 0 for misses
    pub duration: u64,
}

impl CacheEvent {
    pub fn hit(source: CacheSource, hash: &str, duration: u64) -> Self {
        Self {
            source,
            event: CacheEventKind::Hit,
            hash: hash.to_string(),
            duration,
        }
    }

    pub fn miss(source: CacheSource, hash: &str) -> Self {
        Self {
            source,
            event: CacheEventKind::Miss,
            hash: hash.to_string(),
            duration: 0,
        }
    }
}

/// Sink for cache events
pub trait Recorder: Send + Sync {
    fn record(&self, event: CacheEvent);
}

/// Recorder that logs every event at debug level
#[derive(Debug, Default)]
pub struct TracingRecorder;

impl Recorder for TracingRecorder {
    fn record(&self, event: CacheEvent) {
        match event.event {
            CacheEventKind::Hit => tracing::debug!(
                source = %event.source,
                hash = %event.hash,
                saved_ms = event.duration,
                "Cache hit"
            ),
            CacheEventKind::Miss => {
                tracing::debug!(source = %event.source, hash = %event.hash, "Cache miss")
            }
        }
    }
}

/// Recorder that keeps events in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryRecorder {
    events: Arc<Mutex<Vec<CacheEvent>>>,
}

impl MemoryRecorder {
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Recorder for MemoryRecorder {
    fn record(&self, event: CacheEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
