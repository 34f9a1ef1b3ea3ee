//! Session-scoped orchestrator state.
//!
//! [`SessionState`] is a cheap-to-clone handle to the one shared
//! [`SessionSnapshot`]. Every mutation is a read-modify-write against the
//! latest snapshot under the write lock, so two polls finishing in
//! overlapping ticks can never lose each other's updates. After each
//! mutation the revision is bumped, derived flags are recomputed,
//! subscribers are notified and the debounced persister is marked dirty.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

use crate::runtime::persist::PersistHandle;
use crate::runtime::poller::TickOutcome;
use crate::runtime::provider::{RemoteStatus, StatusReport};
use crate::runtime::types::{
    PipelineRun, RunId, RuntimeError, TaskError, TaskKey, TaskKind, TaskRecord, TaskResult,
    TaskStatus,
};

/// Coarse UI affordance flags, always derived from the task set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingFlags {
    pub is_generating_video: bool,
    pub is_adding_motion: bool,
    pub is_uploading: bool,
}

impl ProcessingFlags {
    pub fn derive<'a>(tasks: impl IntoIterator<Item = &'a TaskRecord>) -> Self {
        let mut flags = Self::default();
        for task in tasks {
            if !task.status.is_open() {
                continue;
            }
            match task.kind {
                TaskKind::Video => flags.is_generating_video = true,
                TaskKind::Motion => flags.is_adding_motion = true,
                TaskKind::Image if task.input.has_local_assets() => flags.is_uploading = true,
                _ => {}
            }
        }
        flags
    }
}

/// Everything the orchestrator owns for one session, in serialisable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub runs: Vec<PipelineRun>,
    #[serde(default)]
    pub flags: ProcessingFlags,
    #[serde(default)]
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            tasks: Vec::new(),
            runs: Vec::new(),
            flags: ProcessingFlags::default(),
            revision: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn task(&self, key: TaskKey) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.key == key)
    }

    pub fn task_mut(&mut self, key: TaskKey) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.key == key)
    }

    pub fn run(&self, run_id: RunId) -> Option<&PipelineRun> {
        self.runs.iter().find(|r| r.run_id == run_id)
    }

    pub fn run_mut(&mut self, run_id: RunId) -> Option<&mut PipelineRun> {
        self.runs.iter_mut().find(|r| r.run_id == run_id)
    }

    /// Number of tasks currently occupying provider capacity.
    pub fn in_flight(&self, kind: TaskKind) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.kind == kind && t.status.is_in_flight())
            .count()
    }

    pub fn refresh_flags(&mut self) {
        self.flags = ProcessingFlags::derive(&self.tasks);
    }
}

/// Shared handle to the latest [`SessionSnapshot`].
#[derive(Clone, Debug)]
pub struct SessionState {
    inner: Arc<RwLock<SessionSnapshot>>,
    changes: Arc<watch::Sender<u64>>,
    persist: Option<PersistHandle>,
}

impl SessionState {
    /// In-memory state without persistence.
    pub fn new(mut snapshot: SessionSnapshot) -> Self {
        snapshot.refresh_flags();
        let (tx, _rx) = watch::channel(snapshot.revision);
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
            changes: Arc::new(tx),
            persist: None,
        }
    }

    pub(crate) fn shared(&self) -> Arc<RwLock<SessionSnapshot>> {
        Arc::clone(&self.inner)
    }

    pub(crate) fn attach_persister(&mut self, handle: PersistHandle) {
        self.persist = Some(handle);
    }

    /// Revision counter that ticks on every committed mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub async fn session_id(&self) -> String {
        self.inner.read().await.session_id.clone()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.read().await.clone()
    }

    pub async fn flags(&self) -> ProcessingFlags {
        self.inner.read().await.flags
    }

    pub async fn task(&self, key: TaskKey) -> Option<TaskRecord> {
        self.inner.read().await.task(key).cloned()
    }

    pub async fn run(&self, run_id: RunId) -> Option<PipelineRun> {
        self.inner.read().await.run(run_id).cloned()
    }

    /// Current status of each key that still exists, in input order.
    pub async fn statuses(&self, keys: &[TaskKey]) -> Vec<(TaskKey, TaskStatus)> {
        let guard = self.inner.read().await;
        keys.iter()
            .filter_map(|key| guard.task(*key).map(|t| (*key, t.status)))
            .collect()
    }

    /// Persist the latest snapshot immediately, bypassing the debounce.
    pub async fn flush(&self) -> Result<(), RuntimeError> {
        match &self.persist {
            Some(handle) => handle.flush().await,
            None => Ok(()),
        }
    }

    /// Run `f` against the latest snapshot and commit the result.
    ///
    /// The closure's error aborts the commit but any partial writes it made
    /// are kept, so closures validate before mutating.
    pub async fn mutate<F, R>(&self, f: F) -> Result<R, RuntimeError>
    where
        F: FnOnce(&mut SessionSnapshot) -> Result<R, RuntimeError>,
    {
        let (revision, out) = {
            let mut guard = self.inner.write().await;
            let out = f(&mut *guard)?;
            guard.revision += 1;
            guard.updated_at = Utc::now();
            guard.refresh_flags();
            (guard.revision, out)
        };
        self.changes.send_replace(revision);
        if let Some(handle) = &self.persist {
            handle.mark_dirty();
        }
        Ok(out)
    }

    /// Read-modify-write a single task.
    pub async fn update_task<F, R>(&self, key: TaskKey, f: F) -> Result<R, RuntimeError>
    where
        F: FnOnce(&mut TaskRecord) -> Result<R, RuntimeError>,
    {
        self.mutate(|snap| {
            let task = snap
                .task_mut(key)
                .ok_or(RuntimeError::TaskNotFound { key })?;
            f(task)
        })
        .await
    }

    /// Read-modify-write a single run.
    pub async fn update_run<F, R>(&self, run_id: RunId, f: F) -> Result<R, RuntimeError>
    where
        F: FnOnce(&mut PipelineRun) -> Result<R, RuntimeError>,
    {
        self.mutate(|snap| {
            let run = snap
                .run_mut(run_id)
                .ok_or(RuntimeError::RunNotFound { run_id })?;
            let out = f(&mut *run)?;
            run.updated_at = Utc::now();
            Ok(out)
        })
        .await
    }

    pub async fn insert_tasks(&self, records: Vec<TaskRecord>) -> Result<(), RuntimeError> {
        self.mutate(|snap| {
            for record in records {
                if snap.task(record.key).is_none() {
                    snap.tasks.push(record);
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn insert_run(&self, run: PipelineRun) -> Result<(), RuntimeError> {
        self.mutate(|snap| {
            if snap.run(run.run_id).is_none() {
                snap.runs.push(run);
            }
            Ok(())
        })
        .await
    }

    /// Record a provider acceptance.
    ///
    /// Returns `false` when the task left `Queued` while the submit request
    /// was in flight (it was cancelled); the provider id is still recorded
    /// so the caller can withdraw the remote job.
    pub async fn mark_submitted(
        &self,
        key: TaskKey,
        provider_id: String,
    ) -> Result<bool, RuntimeError> {
        self.update_task(key, |task| {
            if task.status != TaskStatus::Queued {
                if task.id.is_none() {
                    task.id = Some(provider_id);
                    task.touch();
                }
                return Ok(false);
            }
            task.id = Some(provider_id);
            task.transition(TaskStatus::Submitted)?;
            Ok(true)
        })
        .await
    }

    /// Fold one status check into the record.
    ///
    /// Terminal records are never touched again, so repeated checks after
    /// completion are no-ops. Non-terminal answers count one attempt and
    /// only ever move the status forward.
    pub async fn apply_report(
        &self,
        key: TaskKey,
        report: StatusReport,
    ) -> Result<TickOutcome, RuntimeError> {
        let outcome = self
            .update_task(key, |task| {
                if task.status.is_terminal() {
                    return Ok(TickOutcome::AlreadyTerminal(task.status));
                }
                if let Some(partial) = report.result {
                    task.result.get_or_insert_with(TaskResult::default).merge(partial);
                }
                match report.status {
                    RemoteStatus::Pending | RemoteStatus::Processing => {
                        if report.status == RemoteStatus::Processing
                            && task.status == TaskStatus::Submitted
                        {
                            task.transition(TaskStatus::Processing)?;
                        }
                        task.attempts += 1;
                        task.touch();
                        Ok(TickOutcome::Pending {
                            attempts: task.attempts,
                        })
                    }
                    RemoteStatus::Completed => {
                        task.transition(TaskStatus::Completed)?;
                        Ok(TickOutcome::Terminal(TaskStatus::Completed))
                    }
                    RemoteStatus::Failed => {
                        let message = report
                            .error
                            .unwrap_or_else(|| "provider reported failure".to_owned());
                        task.error = Some(TaskError::rejection(message));
                        task.transition(TaskStatus::Failed)?;
                        Ok(TickOutcome::Terminal(TaskStatus::Failed))
                    }
                }
            })
            .await?;
        if let TickOutcome::Terminal(status) = outcome {
            info!(task = %key, %status, "task reached terminal status");
        }
        Ok(outcome)
    }

    /// Fail a non-terminal task. Returns `false` if it had already finished.
    pub async fn fail(&self, key: TaskKey, error: TaskError) -> Result<bool, RuntimeError> {
        self.update_task(key, |task| {
            if task.status.is_terminal() {
                return Ok(false);
            }
            info!(task = %key, kind = %error.kind, message = %error.message, "task failed");
            task.error = Some(error);
            task.transition(TaskStatus::Failed)?;
            Ok(true)
        })
        .await
    }

    /// Fail a task whose poll budget ran out, keeping any partial result.
    pub async fn time_out(&self, key: TaskKey) -> Result<bool, RuntimeError> {
        self.update_task(key, |task| {
            if task.status.is_terminal() {
                return Ok(false);
            }
            info!(task = %key, attempts = task.attempts, "task timed out");
            task.error = Some(TaskError::timeout(task.attempts));
            task.transition(TaskStatus::Failed)?;
            Ok(true)
        })
        .await
    }

    /// Mark a task cancelled, returning the record as it was before.
    ///
    /// `None` means it was already terminal and nothing changed.
    pub async fn cancel_task(&self, key: TaskKey) -> Result<Option<TaskRecord>, RuntimeError> {
        self.update_task(key, |task| {
            if task.status.is_terminal() {
                return Ok(None);
            }
            let before = task.clone();
            task.error = Some(TaskError::cancelled());
            task.transition(TaskStatus::Cancelled)?;
            Ok(Some(before))
        })
        .await
    }

    /// `Completed → Downloaded` for video artifacts that have been fetched.
    pub async fn mark_downloaded(
        &self,
        key: TaskKey,
        relocated_url: Option<String>,
    ) -> Result<(), RuntimeError> {
        self.update_task(key, |task| {
            if task.kind != TaskKind::Video {
                return Err(RuntimeError::InvalidRequest(format!(
                    "task {key} is a {} task; only video tasks can be downloaded",
                    task.kind
                )));
            }
            task.transition(TaskStatus::Downloaded)?;
            if let Some(url) = relocated_url {
                task.result.get_or_insert_with(TaskResult::default).url = Some(url);
            }
            debug!(task = %key, "video marked downloaded");
            Ok(())
        })
        .await
    }
}
