//! Output change tracking
//!
//! A watcher remembers which outputs a hash produced so a later cache hit can
//! skip restoring files that are already on disk and unchanged. Without a
//! watcher the runner always restores.
//!
//! [`OutputTracker::open`] keeps the fingerprints in a JSON state file so the
//! next invocation can use them.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::hash::file::compile_glob;

/// Output state queries used before restoring a cache hit
#[async_trait]
pub trait OutputWatcher: Send + Sync {
    /// Record that `hash` just wrote `globs` (repo-relative)
    async fn notify_outputs_written(&self, hash: &str, globs: &[String], time_saved: u64);

    /// Globs whose files changed since `hash` wrote them, plus the time saved
    /// recorded for that hash. Unknown hashes report every glob as changed.
    async fn get_changed_outputs(&self, hash: &str, globs: &[String]) -> (Vec<String>, u64);
}

/// On-disk form of the tracker
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackedOutputs {
    fingerprints: HashMap<String, BTreeMap<String, String>>,
    times_saved: HashMap<String, u64>,
}

/// Watcher comparing output fingerprints.
///
/// Lock discipline: fingerprints are computed without holding either lock,
/// and each map lock is held only for a single lookup or insert.
pub struct OutputTracker {
    root: PathBuf,
    state_file: Option<PathBuf>,
    fingerprints: Mutex<HashMap<String, BTreeMap<String, String>>>,
    times_saved: Mutex<HashMap<String, u64>>,
}

impl OutputTracker {
    /// Tracker that forgets everything when dropped
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_state(root.into(), None, TrackedOutputs::default())
    }

    /// Tracker backed by `state_file`. A missing or unreadable file starts
    /// empty, which only costs a restore.
    pub fn open(root: impl Into<PathBuf>, state_file: impl Into<PathBuf>) -> Self {
        let state_file = state_file.into();
        let state = match fs::read(&state_file) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %state_file.display(), error = %e, "Discarding corrupt output state");
                TrackedOutputs::default()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => TrackedOutputs::default(),
            Err(e) => {
                warn!(path = %state_file.display(), error = %e, "Failed to read output state");
                TrackedOutputs::default()
            }
        };
        debug!(hashes = state.fingerprints.len(), "Loaded output state");
        Self::with_state(root.into(), Some(state_file), state)
    }

    fn with_state(root: PathBuf, state_file: Option<PathBuf>, state: TrackedOutputs) -> Self {
        Self {
            root,
            state_file,
            fingerprints: Mutex::new(state.fingerprints),
            times_saved: Mutex::new(state.times_saved),
        }
    }

    /// Write the state file, if there is one
    pub fn save(&self) -> io::Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let state = TrackedOutputs {
            fingerprints: self
                .fingerprints
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            times_saved: self
                .times_saved
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&state)?)?;
        fs::rename(&tmp, path)
    }

    async fn fingerprint_all(&self, globs: &[String]) -> BTreeMap<String, String> {
        let root = self.root.clone();
        let globs = globs.to_vec();
        let result = tokio::task::spawn_blocking(move || {
            globs
                .iter()
                .map(|glob| (glob.clone(), fingerprint(&root, glob)))
                .collect::<BTreeMap<_, _>>()
        })
        .await;
        match result {
            Ok(prints) => prints,
            Err(e) => {
                warn!(error = %e, "Failed to fingerprint outputs");
                BTreeMap::new()
            }
        }
    }
}

#[async_trait]
impl OutputWatcher for OutputTracker {
    async fn notify_outputs_written(&self, hash: &str, globs: &[String], time_saved: u64) {
        let prints = self.fingerprint_all(globs).await;
        self.fingerprints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hash.to_string(), prints);
        self.times_saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hash.to_string(), time_saved);
        debug!(hash, globs = globs.len(), "Tracking outputs");
    }

    async fn get_changed_outputs(&self, hash: &str, globs: &[String]) -> (Vec<String>, u64) {
        let known = self
            .fingerprints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
            .cloned();
        let Some(known) = known else {
            return (globs.to_vec(), 0);
        };

        let current = self.fingerprint_all(globs).await;
        let changed: Vec<String> = globs
            .iter()
            .filter(|glob| known.get(*glob) != current.get(*glob))
            .cloned()
            .collect();
        let time_saved = self
            .times_saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
            .copied()
            .unwrap_or(0);
        (changed, time_saved)
    }
}

/// Digest of the paths, sizes and mtimes of everything a glob matches.
/// An unmatchable glob fingerprints as empty.
fn fingerprint(root: &Path, glob: &str) -> String {
    let Ok(matcher) = compile_glob(glob).map(|g| g.compile_matcher()) else {
        return String::new();
    };
    let base: PathBuf = glob
        .split('/')
        .take_while(|part| !part.contains(['*', '?', '[', '{']))
        .collect();
    let walk_root = root.join(&base);

    let mut hasher = Sha256::new();
    for entry in WalkDir::new(&walk_root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        if !matcher.is_match(&rel) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());
        hasher.update(format!("{}\0{}\0{}\n", rel, meta.len(), mtime).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use tempfile::TempDir;

    fn globs() -> Vec<String> {
        vec!["web/dist/**".to_string(), "web/.gantry/gantry-build.log".to_string()]
    }

    fn fixture() -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("web/dist")).unwrap();
        fs::create_dir_all(temp.path().join("web/.gantry")).unwrap();
        fs::write(temp.path().join("web/dist/app.js"), "app").unwrap();
        fs::write(temp.path().join("web/.gantry/gantry-build.log"), "log").unwrap();
        temp
    }

    #[tokio::test]
    async fn test_unknown_hash_reports_everything() {
        let temp = fixture();
        let tracker = OutputTracker::new(temp.path());
        let (changed, saved) = tracker.get_changed_outputs("nope", &globs()).await;
        assert_eq!(changed, globs());
        assert_eq!(saved, 0);
    }

    #[tokio::test]
    async fn test_unchanged_outputs() {
        let temp = fixture();
        let tracker = OutputTracker::new(temp.path());
        tracker.notify_outputs_written("h1", &globs(), 1500).await;

        let (changed, saved) = tracker.get_changed_outputs("h1", &globs()).await;
        assert!(changed.is_empty());
        assert_eq!(saved, 1500);
    }

    #[tokio::test]
    async fn test_changed_outputs() {
        let temp = fixture();
        let tracker = OutputTracker::new(temp.path());
        tracker.notify_outputs_written("h2", &globs(), 10).await;

        fs::write(temp.path().join("web/dist/app.js"), "app, but longer").unwrap();
        let (changed, _) = tracker.get_changed_outputs("h2", &globs()).await;
        assert_eq!(changed, vec!["web/dist/**".to_string()]);

        fs::remove_file(temp.path().join("web/.gantry/gantry-build.log")).unwrap();
        let (changed, _) = tracker.get_changed_outputs("h2", &globs()).await;
        assert_eq!(changed.len(), 2);
    }

    #[tokio::test]
    async fn test_state_survives_reopening() {
        let temp = fixture();
        let state = temp.path().join(".gantry/outputs.json");

        let first = OutputTracker::open(temp.path(), &state);
        first.notify_outputs_written("h3", &globs(), 700).await;
        first.save().unwrap();

        let second = OutputTracker::open(temp.path(), &state);
        let (changed, saved) = second.get_changed_outputs("h3", &globs()).await;
        assert!(changed.is_empty());
        assert_eq!(saved, 700);
    }

    #[tokio::test]
    async fn test_corrupt_state_starts_empty() {
        let temp = fixture();
        let state = temp.path().join("outputs.json");
        fs::write(&state, "not json").unwrap();

        let tracker = OutputTracker::open(temp.path(), &state);
        let (changed, _) = tracker.get_changed_outputs("h1", &globs()).await;
        assert_eq!(changed, globs());
    }

    #[tokio::test]
    async fn test_star_fingerprint_stays_in_one_directory() {
        let temp = fixture();
        let shallow = vec!["web/dist/*.js".to_string()];
        let tracker = OutputTracker::new(temp.path());
        tracker.notify_outputs_written("h4", &shallow, 0).await;

        fs::create_dir_all(temp.path().join("web/dist/chunks")).unwrap();
        fs::write(temp.path().join("web/dist/chunks/a.js"), "chunk").unwrap();
        let (changed, _) = tracker.get_changed_outputs("h4", &shallow).await;
        assert!(changed.is_empty());
    }

    #[test]
    fn test_new_tracker_saves_nothing() {
        assert!(OutputTracker::new("/nowhere").save().is_ok());
    }
}
