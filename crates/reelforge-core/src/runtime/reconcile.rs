//! Restoring a persisted session after a restart.
//!
//! A loaded snapshot can carry duplicates (two writers raced on the same
//! record), records that claim to be in flight without a provider id, and
//! runs whose in-memory stage context is gone. [`reconcile`] repairs all of
//! that in place and returns a [`ResumePlan`]: which tasks to poll again
//! and which to re-admit. Nothing that already has a provider id is ever
//! resubmitted.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::runtime::persist::SessionStore;
use crate::runtime::state::SessionSnapshot;
use crate::runtime::types::{
    ErrorKind, RunId, RunStatus, RuntimeError, TaskError, TaskKey, TaskRecord, TaskStatus,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumePlan {
    /// In-flight tasks with a provider id; poll them to completion.
    pub repoll: Vec<TaskKey>,
    /// Standalone tasks that never reached the provider; admit them again.
    pub readmit: Vec<TaskKey>,
    /// Runs that were `Running` and have been marked failed.
    pub interrupted_runs: Vec<RunId>,
    /// Records dropped in favour of a more advanced copy.
    pub dropped_duplicates: usize,
    /// Records that claimed to be in flight without a provider id.
    pub orphaned: Vec<TaskKey>,
}

impl ResumePlan {
    pub fn is_empty(&self) -> bool {
        self.repoll.is_empty() && self.readmit.is_empty()
    }
}

/// `true` if `candidate` should replace `current` as the surviving copy.
fn supersedes(candidate: &TaskRecord, current: &TaskRecord) -> bool {
    (candidate.status.rank(), candidate.updated_at) > (current.status.rank(), current.updated_at)
}

fn dedupe_by<K, F>(tasks: Vec<TaskRecord>, key_of: F) -> (Vec<TaskRecord>, usize)
where
    K: std::hash::Hash + Eq,
    F: Fn(&TaskRecord) -> Option<K>,
{
    let mut kept: Vec<TaskRecord> = Vec::with_capacity(tasks.len());
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut dropped = 0;
    for task in tasks {
        let Some(k) = key_of(&task) else {
            kept.push(task);
            continue;
        };
        match index.get(&k) {
            Some(&at) => {
                dropped += 1;
                if supersedes(&task, &kept[at]) {
                    kept[at] = task;
                }
            }
            None => {
                index.insert(k, kept.len());
                kept.push(task);
            }
        }
    }
    (kept, dropped)
}

/// Repair `snapshot` in place and plan its resumption.
pub fn reconcile(snapshot: &mut SessionSnapshot) -> ResumePlan {
    let mut plan = ResumePlan::default();

    let tasks = std::mem::take(&mut snapshot.tasks);
    let (tasks, by_key) = dedupe_by(tasks, |t| Some(t.key));
    // Provider ids are only unique within one provider.
    let (tasks, by_provider) = dedupe_by(tasks, |t| t.id.clone().map(|id| (t.kind, id)));
    snapshot.tasks = tasks;
    plan.dropped_duplicates = by_key + by_provider;

    for run in snapshot.runs.iter_mut() {
        if run.status == RunStatus::Running {
            run.status = RunStatus::Failed;
            run.error = Some(TaskError::new(
                ErrorKind::Interrupted,
                "run interrupted by a restart; its tasks are still tracked",
            ));
            plan.interrupted_runs.push(run.run_id);
        }
    }
    let live_runs: HashSet<RunId> = snapshot
        .runs
        .iter()
        .filter(|r| !r.status.is_terminal())
        .map(|r| r.run_id)
        .collect();

    for task in snapshot.tasks.iter_mut() {
        match task.status {
            TaskStatus::Submitted | TaskStatus::Processing if task.id.is_none() => {
                task.error = Some(TaskError::new(
                    ErrorKind::Interrupted,
                    "submission state lost before a provider id was recorded",
                ));
                task.status = TaskStatus::Failed;
                task.touch();
                plan.orphaned.push(task.key);
            }
            TaskStatus::Submitted | TaskStatus::Processing => plan.repoll.push(task.key),
            TaskStatus::Queued => match task.run_id {
                Some(run_id) if !live_runs.contains(&run_id) => {
                    task.error = Some(TaskError::new(
                        ErrorKind::Interrupted,
                        "run ended before the task was dispatched",
                    ));
                    task.status = TaskStatus::Cancelled;
                    task.touch();
                }
                _ => plan.readmit.push(task.key),
            },
            _ => {}
        }
    }
    snapshot.refresh_flags();
    plan
}

/// Load `session_id` from `store` (or start empty) and reconcile it.
pub async fn restore(
    session_id: &str,
    store: &dyn SessionStore,
) -> Result<(SessionSnapshot, ResumePlan), RuntimeError> {
    let Some(mut snapshot) = store.load_snapshot(session_id).await? else {
        info!(session = %session_id, "no stored snapshot; starting fresh");
        return Ok((SessionSnapshot::new(session_id), ResumePlan::default()));
    };
    let plan = reconcile(&mut snapshot);
    if plan.dropped_duplicates > 0 || !plan.orphaned.is_empty() {
        warn!(
            session = %session_id,
            duplicates = plan.dropped_duplicates,
            orphaned = plan.orphaned.len(),
            "repaired inconsistent snapshot"
        );
    }
    info!(
        session = %session_id,
        tasks = snapshot.tasks.len(),
        repoll = plan.repoll.len(),
        readmit = plan.readmit.len(),
        interrupted_runs = plan.interrupted_runs.len(),
        "snapshot restored"
    );
    Ok((snapshot, plan))
}
