//! Position-ordered task queue and dependency resolver.
//!
//! Every task owns exactly one `QueueEntry`. Entries keep the order in which
//! they were inserted (`position`), and that order, not `priority`, decides
//! which ready tasks are scheduled first, so replaying the same queue always
//! schedules the same way.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::dag::DependencyGraph;
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};

/// Scheduling status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl EntryStatus {
    /// Valid moves:
    /// - Queued -> Running | Skipped
    /// - Running -> Completed | Failed | Queued (re-queue after a retryable failure)
    pub fn can_transition(self, to: EntryStatus) -> bool {
        matches!(
            (self, to),
            (EntryStatus::Queued, EntryStatus::Running)
                | (EntryStatus::Queued, EntryStatus::Skipped)
                | (EntryStatus::Running, EntryStatus::Completed)
                | (EntryStatus::Running, EntryStatus::Failed)
                | (EntryStatus::Running, EntryStatus::Queued)
        )
    }

    /// Queued or running entries still need work.
    pub fn is_pending(self) -> bool {
        matches!(self, EntryStatus::Queued | EntryStatus::Running)
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Queued => write!(f, "queued"),
            EntryStatus::Running => write!(f, "running"),
            EntryStatus::Completed => write!(f, "completed"),
            EntryStatus::Failed => write!(f, "failed"),
            EntryStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Scheduling state wrapped around one task for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub spec_id: String,
    pub status: EntryStatus,
    /// Insertion order. Assigned once, never reused.
    pub position: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of times the entry has been dispatched.
    #[serde(default)]
    pub attempts: u32,
}

/// Counts used for progress reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub completed: usize,
    pub ready: usize,
    /// Pending entries that are not ready.
    pub blocked: usize,
    pub running: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Why nothing can be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedReason {
    /// First queued entry in position order.
    pub task_id: TaskId,
    /// Its dependencies that have not completed.
    pub unmet: Vec<TaskId>,
}

impl std::fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unmet: Vec<&str> = self.unmet.iter().map(|id| id.as_str()).collect();
        write!(f, "{} waits on [{}]", self.task_id, unmet.join(", "))
    }
}

/// Monotonic counters persisted with the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounters {
    pub next_position: u64,
}

/// On-disk shape of a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDocument {
    pub queue: Vec<QueueEntry>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub counters: QueueCounters,
}

/// Ordered task entries plus the tasks they schedule.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    /// Entries sorted by position.
    entries: Vec<QueueEntry>,
    tasks: HashMap<TaskId, Task>,
    next_position: u64,
    project_name: Option<String>,
    branch_name: Option<String>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, project_name: &str, branch_name: &str) -> Self {
        self.project_name = Some(project_name.to_string());
        self.branch_name = Some(branch_name.to_string());
        self
    }

    pub fn project_name(&self) -> Option<&str> {
        self.project_name.as_deref()
    }

    pub fn branch_name(&self) -> Option<&str> {
        self.branch_name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append tasks at the tail in the given order.
    ///
    /// Tasks whose id already has an entry are skipped, so re-running a
    /// decomposition is idempotent. The batch is validated as a whole:
    /// every dependency must name a known task (existing or in the batch)
    /// and the combined graph must be acyclic. On error nothing is inserted.
    ///
    /// Returns the ids that were actually inserted.
    pub fn add_tasks(&mut self, tasks: Vec<Task>, spec_id: &str) -> Result<Vec<TaskId>> {
        let mut fresh: Vec<Task> = Vec::new();
        let mut seen: HashSet<TaskId> = HashSet::new();
        for task in tasks {
            if self.tasks.contains_key(&task.id) || !seen.insert(task.id.clone()) {
                debug!(task_id = %task.id, "add_tasks: skipping known task");
                continue;
            }
            fresh.push(task);
        }

        if fresh.is_empty() {
            return Ok(Vec::new());
        }

        DependencyGraph::from_tasks(self.tasks.values().chain(fresh.iter()))?.check_acyclic()?;

        let mut inserted = Vec::with_capacity(fresh.len());
        for task in fresh {
            let entry = QueueEntry {
                task_id: task.id.clone(),
                spec_id: spec_id.to_string(),
                status: if task.passes {
                    EntryStatus::Completed
                } else {
                    EntryStatus::Queued
                },
                position: self.next_position,
                started_at: None,
                completed_at: None,
                attempts: 0,
            };
            self.next_position += 1;
            inserted.push(task.id.clone());
            self.entries.push(entry);
            self.tasks.insert(task.id.clone(), task);
        }

        info!(spec_id, count = inserted.len(), "tasks added to queue");
        Ok(inserted)
    }

    /// Up to `max_count` ready tasks in position order.
    ///
    /// An entry is ready when it is queued and every dependency has completed.
    pub fn get_ready_tasks(&self, max_count: usize) -> Vec<Task> {
        let completed = self.completed_ids();
        self.entries
            .iter()
            .filter(|entry| self.is_ready(entry, &completed))
            .take(max_count)
            .filter_map(|entry| self.tasks.get(&entry.task_id).cloned())
            .collect()
    }

    fn is_ready(&self, entry: &QueueEntry, completed: &HashSet<TaskId>) -> bool {
        entry.status == EntryStatus::Queued
            && self
                .tasks
                .get(&entry.task_id)
                .map(|task| task.dependencies.iter().all(|dep| completed.contains(dep)))
                .unwrap_or(false)
    }

    pub fn mark_running(&mut self, id: &TaskId) -> Result<()> {
        self.transition(id, EntryStatus::Running)
    }

    pub fn mark_completed(&mut self, id: &TaskId) -> Result<()> {
        self.transition(id, EntryStatus::Completed)
    }

    pub fn mark_failed(&mut self, id: &TaskId) -> Result<()> {
        self.transition(id, EntryStatus::Failed)
    }

    pub fn mark_skipped(&mut self, id: &TaskId) -> Result<()> {
        self.transition(id, EntryStatus::Skipped)
    }

    /// Return a running entry to the queue so it can be selected again.
    pub fn requeue(&mut self, id: &TaskId) -> Result<()> {
        self.transition(id, EntryStatus::Queued)
    }

    /// Requeue a running entry whose execution was interrupted rather than
    /// failed. The attempt it was charged is refunded.
    pub fn release(&mut self, id: &TaskId) -> Result<()> {
        self.transition(id, EntryStatus::Queued)?;
        if let Some(entry) = self.entries.iter_mut().find(|e| &e.task_id == id) {
            entry.attempts = entry.attempts.saturating_sub(1);
        }
        Ok(())
    }

    fn transition(&mut self, id: &TaskId, to: EntryStatus) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| &e.task_id == id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;

        let from = entry.status;
        if !from.can_transition(to) {
            return Err(Error::InvalidTransition {
                task_id: id.clone(),
                from,
                to,
            });
        }

        entry.status = to;
        match to {
            EntryStatus::Running => {
                entry.started_at = Some(Utc::now());
                entry.attempts += 1;
            }
            EntryStatus::Queued => {
                entry.started_at = None;
            }
            EntryStatus::Completed | EntryStatus::Failed | EntryStatus::Skipped => {
                entry.completed_at = Some(Utc::now());
            }
        }
        if to == EntryStatus::Completed {
            if let Some(task) = self.tasks.get_mut(id) {
                task.passes = true;
            }
        }

        debug!(task_id = %id, %from, %to, "queue transition");
        Ok(())
    }

    /// Demote entries left `running` by a previous process back to `queued`.
    ///
    /// Attempt counts are kept. Returns the demoted ids.
    pub fn reconcile(&mut self) -> Vec<TaskId> {
        let mut demoted = Vec::new();
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.status == EntryStatus::Running)
        {
            entry.status = EntryStatus::Queued;
            entry.started_at = None;
            demoted.push(entry.task_id.clone());
        }
        if !demoted.is_empty() {
            info!(count = demoted.len(), "reconciled stale running entries");
        }
        demoted
    }

    pub fn stats(&self) -> QueueStats {
        let completed = self.completed_ids();
        let mut stats = QueueStats {
            total: self.entries.len(),
            ..QueueStats::default()
        };
        let mut pending = 0;
        for entry in &self.entries {
            match entry.status {
                EntryStatus::Completed => stats.completed += 1,
                EntryStatus::Running => stats.running += 1,
                EntryStatus::Failed => stats.failed += 1,
                EntryStatus::Skipped => stats.skipped += 1,
                EntryStatus::Queued => {}
            }
            if entry.status.is_pending() {
                pending += 1;
            }
            if self.is_ready(entry, &completed) {
                stats.ready += 1;
            }
        }
        stats.blocked = pending - stats.ready;
        stats
    }

    /// Diagnostic for an empty ready set: the first queued entry and the
    /// dependencies it still waits on.
    ///
    /// Only one entry is reported even when several are independently blocked.
    pub fn blocking_reason(&self) -> Option<BlockedReason> {
        let completed = self.completed_ids();
        let entry = self
            .entries
            .iter()
            .find(|e| e.status == EntryStatus::Queued)?;
        let unmet = self
            .tasks
            .get(&entry.task_id)
            .map(|task| {
                task.dependencies
                    .iter()
                    .filter(|dep| !completed.contains(*dep))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Some(BlockedReason {
            task_id: entry.task_id.clone(),
            unmet,
        })
    }

    /// Entries that are queued or running.
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.status.is_pending()).count()
    }

    pub fn completed_ids(&self) -> HashSet<TaskId> {
        self.ids_with_status(EntryStatus::Completed).into_iter().collect()
    }

    pub fn failed_ids(&self) -> Vec<TaskId> {
        self.ids_with_status(EntryStatus::Failed)
    }

    pub fn running_ids(&self) -> Vec<TaskId> {
        self.ids_with_status(EntryStatus::Running)
    }

    fn ids_with_status(&self, status: EntryStatus) -> Vec<TaskId> {
        self.entries
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.task_id.clone())
            .collect()
    }

    /// True when every entry has completed.
    pub fn all_completed(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.status == EntryStatus::Completed)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn entry(&self, id: &TaskId) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| &e.task_id == id)
    }

    /// Entries in position order.
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    /// Tasks in position order.
    pub fn tasks(&self) -> Vec<&Task> {
        self.entries
            .iter()
            .filter_map(|e| self.tasks.get(&e.task_id))
            .collect()
    }

    /// Owned copy of the entries for reporting.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.clone()
    }

    /// Remove a task before a run starts.
    ///
    /// Only queued tasks that nothing else depends on may be removed.
    pub fn remove_task(&mut self, id: &TaskId) -> Result<Task> {
        let index = self
            .entries
            .iter()
            .position(|e| &e.task_id == id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;

        if self.entries[index].status != EntryStatus::Queued {
            return Err(Error::Validation(format!(
                "cannot remove task {} while {}",
                id, self.entries[index].status
            )));
        }
        if let Some(dependent) = self.tasks.values().find(|t| t.depends_on(id)) {
            return Err(Error::Validation(format!(
                "cannot remove task {}: {} depends on it",
                id, dependent.id
            )));
        }

        self.entries.remove(index);
        self.tasks
            .remove(id)
            .ok_or_else(|| Error::QueueCorrupted(format!("entry {} had no task", id)))
    }

    /// Drop every entry that belongs to `spec_id`.
    ///
    /// Positions are not reused afterwards. Fails if a task from another
    /// spec depends on one being dropped.
    pub fn reset_spec(&mut self, spec_id: &str) -> Result<usize> {
        let doomed: HashSet<TaskId> = self
            .entries
            .iter()
            .filter(|e| e.spec_id == spec_id)
            .map(|e| e.task_id.clone())
            .collect();

        for task in self.tasks.values().filter(|t| !doomed.contains(&t.id)) {
            if let Some(dep) = task.dependencies.iter().find(|d| doomed.contains(*d)) {
                return Err(Error::Validation(format!(
                    "cannot reset spec {}: {} depends on {}",
                    spec_id, task.id, dep
                )));
            }
        }

        self.entries.retain(|e| !doomed.contains(&e.task_id));
        self.tasks.retain(|id, _| !doomed.contains(id));
        info!(spec_id, removed = doomed.len(), "spec reset");
        Ok(doomed.len())
    }

    /// Validate the whole dependency graph (unknown ids and cycles).
    pub fn check_dependencies(&self) -> Result<()> {
        DependencyGraph::from_tasks(self.tasks.values())?.check_acyclic()
    }

    pub fn to_document(&self) -> QueueDocument {
        QueueDocument {
            queue: self.entries.clone(),
            tasks: self.tasks().into_iter().cloned().collect(),
            project_name: self.project_name.clone(),
            branch_name: self.branch_name.clone(),
            counters: QueueCounters {
                next_position: self.next_position,
            },
        }
    }

    /// Rebuild a queue from its persisted form.
    ///
    /// Structural damage (duplicate ids or positions, entries without tasks,
    /// tasks without entries, positions at or past the counter) is reported
    /// as `QueueCorrupted`. Dependency problems are left to
    /// [`check_dependencies`](Self::check_dependencies) and the runner's
    /// blocked detection.
    pub fn from_document(doc: QueueDocument) -> Result<Self> {
        let mut tasks: HashMap<TaskId, Task> = HashMap::new();
        for task in doc.tasks {
            let id = task.id.clone();
            if tasks.insert(id.clone(), task).is_some() {
                return Err(Error::QueueCorrupted(format!("duplicate task {}", id)));
            }
        }

        let mut entries = doc.queue;
        entries.sort_by_key(|e| e.position);

        let mut ids: HashSet<&TaskId> = HashSet::new();
        let mut positions: HashSet<u64> = HashSet::new();
        for entry in &entries {
            if !ids.insert(&entry.task_id) {
                return Err(Error::QueueCorrupted(format!(
                    "duplicate entry for task {}",
                    entry.task_id
                )));
            }
            if !positions.insert(entry.position) {
                return Err(Error::QueueCorrupted(format!(
                    "duplicate position {}",
                    entry.position
                )));
            }
            if entry.position >= doc.counters.next_position {
                return Err(Error::QueueCorrupted(format!(
                    "position {} is not below counter {}",
                    entry.position, doc.counters.next_position
                )));
            }
            if !tasks.contains_key(&entry.task_id) {
                return Err(Error::QueueCorrupted(format!(
                    "entry {} has no task",
                    entry.task_id
                )));
            }
        }
        if let Some(orphan) = tasks.keys().find(|id| !ids.contains(id)) {
            return Err(Error::QueueCorrupted(format!(
                "task {} has no queue entry",
                orphan
            )));
        }

        Ok(Self {
            entries,
            tasks,
            next_position: doc.counters.next_position,
            project_name: doc.project_name,
            branch_name: doc.branch_name,
        })
    }
}
