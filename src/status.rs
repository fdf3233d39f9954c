//! Hierarchical progress and error tracking.
//!
//! Every stage, endpoint and in-flight item attempt owns a [`StatusTracker`].
//! Trackers hold named counters, flags and lazily computed probes, derive
//! percentages from pairs of those entries, and keep a list of recorded errors.
//! Errors recorded on a node are copied to every ancestor so that a
//! pipeline-level view sees all of them without walking the tree.
//!
//! Nothing is pushed to observers; a presentation layer polls
//! [`StatusTracker::snapshot`] whenever it wants a consistent picture.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// A value computed at snapshot time (queue depth, file position, ...).
pub type Probe = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Clone)]
enum Entry {
    Count(u64),
    Flag(bool),
    Probe(Probe),
}

/// Numerator or denominator of a percentage.
#[derive(Clone)]
pub enum Source {
    /// A named counter or probe of the same tracker.
    Entry(String),
    /// A standalone probe.
    Probe(Probe),
}

impl Source {
    pub fn probe<F>(f: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        Source::Probe(Arc::new(f))
    }
}

impl From<&str> for Source {
    fn from(name: &str) -> Self {
        Source::Entry(name.to_string())
    }
}

/// A recorded failure, kept for later reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Debug rendering of the item being processed, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.item {
            Some(item) => write!(f, "{} (item: {})", self.message, item),
            None => write!(f, "{}", self.message),
        }
    }
}

/// A resolved percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Percentage {
    /// 0-100
    pub percent: u8,
    /// (numerator, denominator)
    pub data: (u64, u64),
}

/// Snapshot value of a counter, flag or probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Count(u64),
    Flag(bool),
}

/// Point-in-time view of a tracker and its subtasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Non-zero counters, set flags and probe values.
    pub values: BTreeMap<String, StatValue>,
    /// Materialized percentages, keyed `percentage_<name>`.
    pub percentages: BTreeMap<String, Percentage>,
    pub subtasks: Vec<StatusSnapshot>,
    pub errors: Vec<ErrorRecord>,
}

impl StatusSnapshot {
    pub fn count(&self, name: &str) -> Option<u64> {
        match self.values.get(name) {
            Some(StatValue::Count(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(StatValue::Flag(true)))
    }

    /// Look up a percentage by its short name (`"done"` for `percentage_done`).
    pub fn percentage(&self, key: &str) -> Option<&Percentage> {
        self.percentages.get(&format!("percentage_{key}"))
    }
}

#[derive(Default)]
struct TrackerState {
    entries: BTreeMap<String, Entry>,
    percentages: BTreeMap<String, (Source, Source)>,
    errors: Vec<ErrorRecord>,
    subtasks: Vec<Arc<StatusTracker>>,
}

/// A node of the status tree.
#[derive(Default)]
pub struct StatusTracker {
    /// Only used to report errors upward; a child never keeps its parent's
    /// subtask list alive past its own detachment.
    parent: Option<Arc<StatusTracker>>,
    state: Mutex<TrackerState>,
}

impl fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StatusTracker")
            .field("entries", &state.entries.keys().collect::<Vec<_>>())
            .field("errors", &state.errors.len())
            .field("subtasks", &state.subtasks.len())
            .finish()
    }
}

impl StatusTracker {
    /// Create a detached root tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Declare a counter starting at zero.
    pub fn counter(&self, name: &str) -> &Self {
        self.state
            .lock()
            .entries
            .entry(name.to_string())
            .or_insert(Entry::Count(0));
        self
    }

    /// Declare a flag starting unset.
    pub fn flag(&self, name: &str) -> &Self {
        self.state
            .lock()
            .entries
            .entry(name.to_string())
            .or_insert(Entry::Flag(false));
        self
    }

    /// Register a value computed on every snapshot.
    pub fn probe<F>(&self, name: &str, f: F) -> &Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        self.state
            .lock()
            .entries
            .insert(name.to_string(), Entry::Probe(Arc::new(f)));
        self
    }

    /// Derive `percentage_<key>` from two sources. It only shows up in
    /// snapshots once both sources are non-zero.
    pub fn percentage(&self, key: &str, numerator: impl Into<Source>, denominator: impl Into<Source>) -> &Self {
        self.state
            .lock()
            .percentages
            .insert(key.to_string(), (numerator.into(), denominator.into()));
        self
    }

    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, n: u64) {
        let mut state = self.state.lock();
        match state.entries.get_mut(name) {
            Some(Entry::Count(value)) => *value += n,
            _ => {
                state.entries.insert(name.to_string(), Entry::Count(n));
            }
        }
    }

    pub fn set(&self, name: &str, value: u64) {
        self.state
            .lock()
            .entries
            .insert(name.to_string(), Entry::Count(value));
    }

    pub fn set_flag(&self, name: &str, value: bool) {
        self.state
            .lock()
            .entries
            .insert(name.to_string(), Entry::Flag(value));
    }

    /// Current value of a counter or probe.
    pub fn get(&self, name: &str) -> u64 {
        let entry = self.state.lock().entries.get(name).cloned();
        resolve(entry.as_ref())
    }

    /// Record an error on this node and all of its ancestors.
    pub fn error(&self, err: impl fmt::Display, item: Option<String>) {
        let record = ErrorRecord {
            message: err.to_string(),
            item,
        };
        tracing::warn!(error = %record.message, item = ?record.item, "recorded error");

        let mut node = Some(self);
        while let Some(tracker) = node {
            tracker.state.lock().errors.push(record.clone());
            node = tracker.parent.as_deref();
        }
    }

    pub fn error_count(&self) -> usize {
        self.state.lock().errors.len()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.state.lock().errors.clone()
    }

    /// Attach a child tracker for the lifetime of the returned guard.
    pub fn subtask(self: &Arc<Self>) -> SubtaskGuard {
        let task = Arc::new(StatusTracker {
            parent: Some(Arc::clone(self)),
            state: Mutex::new(TrackerState::default()),
        });
        self.state.lock().subtasks.push(Arc::clone(&task));
        SubtaskGuard {
            parent: Arc::clone(self),
            task,
        }
    }

    pub fn subtask_count(&self) -> usize {
        self.state.lock().subtasks.len()
    }

    /// Take a consistent snapshot of this node and its subtasks.
    pub fn snapshot(&self) -> StatusSnapshot {
        let (entries, percentages, errors, subtasks) = {
            let state = self.state.lock();
            (
                state.entries.clone(),
                state.percentages.clone(),
                state.errors.clone(),
                state.subtasks.clone(),
            )
        };

        let mut values = BTreeMap::new();
        for (name, entry) in &entries {
            match entry {
                Entry::Count(0) | Entry::Flag(false) => {}
                Entry::Count(n) => {
                    values.insert(name.clone(), StatValue::Count(*n));
                }
                Entry::Flag(true) => {
                    values.insert(name.clone(), StatValue::Flag(true));
                }
                Entry::Probe(probe) => {
                    let n = probe();
                    if n > 0 {
                        values.insert(name.clone(), StatValue::Count(n));
                    }
                }
            }
        }

        let mut resolved = BTreeMap::new();
        for (key, (numerator, denominator)) in &percentages {
            let first = resolve_source(numerator, &entries);
            let second = resolve_source(denominator, &entries);
            if first == 0 || second == 0 {
                continue;
            }
            let mut percent = first.saturating_mul(100) / second;
            if percent > 100 {
                tracing::debug!(key, first, second, "percentage above 100, clamping");
                percent = 100;
            }
            resolved.insert(
                format!("percentage_{key}"),
                Percentage {
                    percent: percent as u8,
                    data: (first, second),
                },
            );
        }

        StatusSnapshot {
            values,
            percentages: resolved,
            subtasks: subtasks.iter().map(|t| t.snapshot()).collect(),
            errors,
        }
    }
}

fn resolve(entry: Option<&Entry>) -> u64 {
    match entry {
        Some(Entry::Count(n)) => *n,
        Some(Entry::Flag(b)) => u64::from(*b),
        Some(Entry::Probe(p)) => p(),
        None => 0,
    }
}

fn resolve_source(source: &Source, entries: &BTreeMap<String, Entry>) -> u64 {
    match source {
        Source::Entry(name) => resolve(entries.get(name)),
        Source::Probe(probe) => probe(),
    }
}

/// A subtask attached to its parent until dropped.
pub struct SubtaskGuard {
    parent: Arc<StatusTracker>,
    task: Arc<StatusTracker>,
}

impl SubtaskGuard {
    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.task
    }
}

impl Deref for SubtaskGuard {
    type Target = StatusTracker;

    fn deref(&self) -> &StatusTracker {
        &self.task
    }
}

impl Drop for SubtaskGuard {
    fn drop(&mut self) {
        self.parent
            .state
            .lock()
            .subtasks
            .retain(|t| !Arc::ptr_eq(t, &self.task));
    }
}
