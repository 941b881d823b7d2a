//! Snapshot policy engine.
//!
//! Triggers snapshots by time (hourly through yearly), by operation
//! (before build, before surge up, before update), and by file-change
//! watching (path allow/deny lists, pattern include/exclude, minimum
//! change threshold, polling interval). Retention keeps the N most
//! recent snapshots per bucket, caps the total, and never deletes
//! snapshots marked keep-forever.

use crate::snapshot::{Snapshot, SnapshotManager};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// File-change watcher configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub watch_paths: Vec<PathBuf>,
    #[serde(default)]
    pub exclude_paths: Vec<PathBuf>,
    /// Include patterns (`*.rs`, `config/*`); empty means everything.
    #[serde(default)]
    pub file_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Which change kinds count: `created`, `modified`, `deleted`.
    #[serde(default)]
    pub change_types: Vec<String>,
}

/// Trigger configuration (the `snapshots.triggers` spec section).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotTriggers {
    #[serde(default)]
    pub hourly: bool,
    #[serde(default)]
    pub daily: bool,
    #[serde(default)]
    pub weekly: bool,
    #[serde(default)]
    pub monthly: bool,
    #[serde(default)]
    pub yearly: bool,
    #[serde(default)]
    pub before_build: bool,
    #[serde(default)]
    pub before_surge_up: bool,
    #[serde(default)]
    pub before_update: bool,
    /// Minimum changed bytes before a file-change snapshot fires.
    #[serde(default)]
    pub min_change_threshold: u64,
    /// Polling interval for change detection, seconds.
    #[serde(default = "default_detection_interval")]
    pub change_detection_interval: u64,
    #[serde(default)]
    pub on_file_changes: WatchConfig,
}

fn default_detection_interval() -> u64 {
    300
}

/// Operation hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationTrigger {
    BeforeBuild,
    BeforeSurgeUp,
    BeforeUpdate,
}

/// A named snapshot definition, optionally exempt from retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedSnapshotSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default)]
    pub auto_create: bool,
    #[serde(default)]
    pub keep_forever: bool,
}

/// Retention buckets (the `snapshots.retention` spec section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default = "default_keep_hourly")]
    pub keep_hourly: usize,
    #[serde(default = "default_keep_daily")]
    pub keep_daily: usize,
    #[serde(default = "default_keep_weekly")]
    pub keep_weekly: usize,
    #[serde(default = "default_keep_monthly")]
    pub keep_monthly: usize,
    #[serde(default = "default_keep_yearly")]
    pub keep_yearly: usize,
    #[serde(default = "default_max_total")]
    pub max_total: usize,
}

fn default_keep_hourly() -> usize {
    24
}
fn default_keep_daily() -> usize {
    7
}
fn default_keep_weekly() -> usize {
    4
}
fn default_keep_monthly() -> usize {
    6
}
fn default_keep_yearly() -> usize {
    2
}
fn default_max_total() -> usize {
    100
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_hourly: default_keep_hourly(),
            keep_daily: default_keep_daily(),
            keep_weekly: default_keep_weekly(),
            keep_monthly: default_keep_monthly(),
            keep_yearly: default_keep_yearly(),
            max_total: default_max_total(),
        }
    }
}

impl RetentionPolicy {
    /// Plans deletions: snapshots not covered by any bucket and not
    /// keep-forever, plus the oldest overflow past `max_total`.
    pub fn plan(&self, snapshots: &[Snapshot]) -> Vec<(String, DateTime<Utc>)> {
        let mut ordered: Vec<&Snapshot> = snapshots.iter().collect();
        ordered.sort_by_key(|s| std::cmp::Reverse(s.taken_at));

        let mut kept: HashSet<(String, DateTime<Utc>)> = HashSet::new();
        let buckets: [(usize, fn(&DateTime<Utc>) -> String); 5] = [
            (self.keep_hourly, |t| {
                format!("{}-{:03}-{:02}", t.year(), t.ordinal(), t.hour())
            }),
            (self.keep_daily, |t| format!("{}-{:03}", t.year(), t.ordinal())),
            (self.keep_weekly, |t| {
                format!("{}-w{:02}", t.iso_week().year(), t.iso_week().week())
            }),
            (self.keep_monthly, |t| format!("{}-{:02}", t.year(), t.month())),
            (self.keep_yearly, |t| t.year().to_string()),
        ];

        for (keep, key_of) in buckets {
            let mut periods_seen: Vec<String> = Vec::new();
            for snapshot in &ordered {
                let key = key_of(&snapshot.taken_at);
                if !periods_seen.contains(&key) {
                    if periods_seen.len() >= keep {
                        continue;
                    }
                    periods_seen.push(key);
                    // Newest snapshot of each period represents it.
                    kept.insert((snapshot.capsule_id.clone(), snapshot.taken_at));
                }
            }
        }

        let mut deletions: Vec<(String, DateTime<Utc>)> = Vec::new();
        for snapshot in &ordered {
            let id = (snapshot.capsule_id.clone(), snapshot.taken_at);
            if !kept.contains(&id) && !snapshot.keep_forever() {
                deletions.push(id);
            }
        }

        // Total cap applies to what survives, oldest evicted first.
        let surviving: Vec<&&Snapshot> = ordered
            .iter()
            .filter(|s| {
                let id = (s.capsule_id.clone(), s.taken_at);
                !deletions.contains(&id)
            })
            .collect();
        if surviving.len() > self.max_total {
            let excess = surviving.len() - self.max_total;
            let mut oldest: Vec<&&&Snapshot> = surviving.iter().collect();
            oldest.sort_by_key(|s| s.taken_at);
            for snapshot in oldest.into_iter().filter(|s| !s.keep_forever()).take(excess) {
                deletions.push((snapshot.capsule_id.clone(), snapshot.taken_at));
            }
        }

        deletions
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Evaluates triggers and applies retention.
pub struct PolicyEngine {
    triggers: SnapshotTriggers,
    retention: RetentionPolicy,
    named: Vec<NamedSnapshotSpec>,
    /// Timer bucket → last firing.
    last_fired: Mutex<HashMap<&'static str, DateTime<Utc>>>,
    /// Path → size at last change scan.
    watch_state: Mutex<HashMap<PathBuf, u64>>,
}

impl PolicyEngine {
    pub fn new(triggers: SnapshotTriggers, retention: RetentionPolicy, named: Vec<NamedSnapshotSpec>) -> Self {
        Self {
            triggers,
            retention,
            named,
            last_fired: Mutex::new(HashMap::new()),
            watch_state: Mutex::new(HashMap::new()),
        }
    }

    pub fn triggers(&self) -> &SnapshotTriggers {
        &self.triggers
    }

    pub fn named_specs(&self) -> &[NamedSnapshotSpec] {
        &self.named
    }

    /// Timer buckets due at `now`; firing is recorded.
    pub fn due_timer_triggers(&self, now: DateTime<Utc>) -> Vec<&'static str> {
        let periods: [(&'static str, bool, i64); 5] = [
            ("hourly", self.triggers.hourly, 3600),
            ("daily", self.triggers.daily, 86_400),
            ("weekly", self.triggers.weekly, 7 * 86_400),
            ("monthly", self.triggers.monthly, 30 * 86_400),
            ("yearly", self.triggers.yearly, 365 * 86_400),
        ];

        let mut last = self.last_fired.lock().expect("trigger state lock poisoned");
        let mut due = Vec::new();
        for (bucket, enabled, period_secs) in periods {
            if !enabled {
                continue;
            }
            let fire = match last.get(bucket) {
                Some(at) => (now - *at).num_seconds() >= period_secs,
                None => true,
            };
            if fire {
                last.insert(bucket, now);
                due.push(bucket);
            }
        }
        due
    }

    /// Whether an operation hook should snapshot first.
    pub fn operation_due(&self, operation: OperationTrigger) -> bool {
        match operation {
            OperationTrigger::BeforeBuild => self.triggers.before_build,
            OperationTrigger::BeforeSurgeUp => self.triggers.before_surge_up,
            OperationTrigger::BeforeUpdate => self.triggers.before_update,
        }
    }

    /// Polls the watched paths; true when accumulated changes cross
    /// the byte threshold.
    pub fn changes_due(&self) -> bool {
        let watch = &self.triggers.on_file_changes;
        if watch.watch_paths.is_empty() {
            return false;
        }

        let mut current: HashMap<PathBuf, u64> = HashMap::new();
        for root in &watch.watch_paths {
            collect_sizes(root, watch, &mut current);
        }

        let mut state = self.watch_state.lock().expect("watch state lock poisoned");
        if state.is_empty() {
            // First scan establishes the baseline.
            *state = current;
            return false;
        }

        let mut changed: u64 = 0;
        for (path, size) in &current {
            match state.get(path) {
                Some(old) if old == size => {}
                Some(old) => changed += size.abs_diff(*old),
                None => changed += size,
            }
        }
        for (path, size) in state.iter() {
            if !current.contains_key(path) {
                changed += size;
            }
        }
        *state = current;

        if changed >= self.triggers.min_change_threshold && changed > 0 {
            debug!(changed, threshold = self.triggers.min_change_threshold, "file changes due");
            true
        } else {
            false
        }
    }

    /// Applies retention to everything the manager tracks.
    pub fn apply_retention(&self, manager: &SnapshotManager) -> usize {
        let deletions = self.retention.plan(&manager.list_all());
        let mut deleted = 0;
        for (capsule_id, taken_at) in deletions {
            if manager.delete(&capsule_id, taken_at).is_ok() {
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(deleted, "retention pruned snapshots");
        }
        deleted
    }
}

fn collect_sizes(root: &Path, watch: &WatchConfig, out: &mut HashMap<PathBuf, u64>) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if watch.exclude_paths.iter().any(|e| path.starts_with(e)) {
            continue;
        }
        if path.is_dir() {
            collect_sizes(&path, watch, out);
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if !watch.file_patterns.is_empty() && !watch.file_patterns.iter().any(|p| glob_match(p, name)) {
            continue;
        }
        if watch.exclude_patterns.iter().any(|p| glob_match(p, name)) {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            out.insert(path, meta.len());
        }
    }
}

/// Minimal glob: `*` matches any run, `?` matches one character.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_match_basics() {
        assert!(glob_match("*.rs", "main.rs"));
        assert!(glob_match("config/*", "config/"));
        assert!(glob_match("?at", "cat"));
        assert!(!glob_match("*.rs", "main.go"));
        assert!(!glob_match("?at", "goat"));
    }

    #[test]
    fn timer_triggers_fire_once_per_period() {
        let triggers = SnapshotTriggers {
            hourly: true,
            ..Default::default()
        };
        let engine = PolicyEngine::new(triggers, RetentionPolicy::default(), Vec::new());

        let now = Utc::now();
        assert_eq!(engine.due_timer_triggers(now), vec!["hourly"]);
        // Immediately after firing, nothing is due.
        assert!(engine.due_timer_triggers(now).is_empty());
        // An hour later it fires again.
        let later = now + chrono::Duration::seconds(3601);
        assert_eq!(engine.due_timer_triggers(later), vec!["hourly"]);
    }

    #[test]
    fn operation_triggers_follow_config() {
        let triggers = SnapshotTriggers {
            before_build: true,
            before_surge_up: false,
            ..Default::default()
        };
        let engine = PolicyEngine::new(triggers, RetentionPolicy::default(), Vec::new());
        assert!(engine.operation_due(OperationTrigger::BeforeBuild));
        assert!(!engine.operation_due(OperationTrigger::BeforeSurgeUp));
    }
}
