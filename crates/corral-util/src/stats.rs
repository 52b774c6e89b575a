//! The stats sink: a process-wide counter map that is periodically
//! snapshotted to a "mule" file under a configured directory. Callers hold
//! an `Arc<Stats>` handed to them at construction time.

use anyhow::Result;
use chrono::Utc;
use slog::{debug, warn, Logger};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

pub struct Stats {
    prefix: String,
    counters: Mutex<HashMap<String, i64>>,
}

impl Stats {
    pub fn new(prefix: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.into(),
            counters: Mutex::new(HashMap::new()),
        })
    }

    pub fn inc(&self, key: impl Into<String>) {
        self.add(key, 1);
    }

    pub fn add(&self, key: impl Into<String>, n: i64) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry(key.into()).or_insert(0) += n;
    }

    pub fn set(&self, key: impl Into<String>, n: i64) {
        let mut counters = self.counters.lock().unwrap();
        counters.insert(key.into(), n);
    }

    pub fn del(&self, key: &str) {
        let mut counters = self.counters.lock().unwrap();
        counters.remove(key);
    }

    pub fn reset(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.clear();
    }

    /// Render the current counters as `key value unix_epoch` lines, keys
    /// prefixed when a prefix is configured.
    pub fn snapshot(&self) -> String {
        let counters = self.counters.lock().unwrap();
        self.render(&counters)
    }

    fn render(&self, counters: &HashMap<String, i64>) -> String {
        let now = Utc::now().timestamp();
        let mut out = String::new();
        for (key, value) in counters {
            if self.prefix.is_empty() {
                out.push_str(&format!("{key} {value} {now}\n"));
            } else {
                out.push_str(&format!("{}.{key} {value} {now}\n", self.prefix));
            }
        }
        out
    }

    fn snapshot_and_reset(&self) -> String {
        let mut counters = self.counters.lock().unwrap();
        let rendered = self.render(&counters);
        counters.clear();
        rendered
    }

    /// Snapshot-and-reset, then write the snapshot to a fresh mule file.
    /// Nothing is written when the snapshot is empty. File I/O happens
    /// outside the counter lock.
    pub fn flush(&self, mule_dir: &Path) -> Result<()> {
        let snapshot = self.snapshot_and_reset();
        if snapshot.is_empty() {
            return Ok(());
        }
        let exe = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "corral".to_string());
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let name = format!("{exe}.{stamp}.{}.mule", std::process::id());
        std::fs::write(mule_dir.join(name), snapshot)?;
        Ok(())
    }
}

/// Run the once-a-minute flusher. Spawned as a task of its own by binaries
/// configured with a mule directory; runs until the process exits.
pub async fn flusher(stats: Arc<Stats>, mule_dir: PathBuf, log: Logger) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        match stats.flush(&mule_dir) {
            Ok(()) => debug!(log, "flushed stats"; "dir" => mule_dir.display().to_string()),
            Err(err) => warn!(log, "error flushing stats"; "error" => %err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new("");
        stats.inc("a");
        stats.inc("a");
        stats.add("b", 40);
        stats.set("c", -2);
        let snapshot = stats.snapshot();
        assert!(snapshot.lines().any(|l| l.starts_with("a 2 ")));
        assert!(snapshot.lines().any(|l| l.starts_with("b 40 ")));
        assert!(snapshot.lines().any(|l| l.starts_with("c -2 ")));
    }

    #[test]
    fn prefix_is_applied_to_every_key() {
        let stats = Stats::new("box7");
        stats.inc("md5.job_started");
        let snapshot = stats.snapshot();
        assert!(snapshot.starts_with("box7.md5.job_started 1 "));
    }

    #[test]
    fn del_and_reset_clear_counters() {
        let stats = Stats::new("");
        stats.inc("a");
        stats.inc("b");
        stats.del("a");
        assert!(!stats.snapshot().contains("a 1"));
        stats.reset();
        assert_eq!(stats.snapshot(), "");
    }

    #[test]
    fn flush_writes_one_mule_file_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Stats::new("");
        stats.inc("jobs");
        stats.flush(dir.path()).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name();
        assert!(name.to_string_lossy().ends_with(".mule"));
        assert_eq!(stats.snapshot(), "");
    }

    #[test]
    fn empty_snapshot_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Stats::new("");
        stats.flush(dir.path()).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
