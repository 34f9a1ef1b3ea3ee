//! Submission plumbing shared by standalone batches and pipeline stages.
//!
//! A batch runs its own event loop around a [`ConcurrencyLimiter`]: tasks
//! are dispatched as slots allow, and each terminal event (from the poller,
//! a failed submission or a cancellation) releases a slot and promotes the
//! next queued task. Local assets are relocated only when a task is
//! actually dispatched.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::runtime::cancel::CancelToken;
use crate::runtime::limiter::{Admission, ConcurrencyLimiter};
use crate::runtime::poller::{StatusPoller, TaskEvent};
use crate::runtime::provider::ProviderRegistry;
use crate::runtime::state::SessionState;
use crate::runtime::types::{
    AssetRef, RunId, RuntimeError, TaskError, TaskInput, TaskKey, TaskKind, TaskRecord, TaskStatus,
};

/// Split of a fan-out by final status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    pub succeeded: Vec<TaskKey>,
    pub failed: Vec<TaskKey>,
}

impl FanOut {
    pub fn is_partial(&self) -> bool {
        !self.succeeded.is_empty() && !self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// How a single submission ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The provider accepted the task; it is now `Submitted`.
    Accepted,
    /// The task was cancelled while the request was in flight; the remote
    /// job has been withdrawn.
    Withdrawn,
    /// Relocation or submission failed; the task is `Failed`.
    Failed,
    /// The task was no longer `Queued`; nothing was sent.
    Skipped,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

type Routes = HashMap<TaskKey, mpsc::UnboundedSender<TaskEvent>>;

struct DispatcherInner {
    state: SessionState,
    providers: ProviderRegistry,
    poller: StatusPoller,
    config: OrchestratorConfig,
    /// Event sender of the batch currently responsible for each task.
    routes: Mutex<Routes>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("providers", &self.inner.providers)
            .field("poller", &self.inner.poller)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        state: SessionState,
        providers: ProviderRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        let poller = StatusPoller::new(state.clone());
        Self {
            inner: Arc::new(DispatcherInner {
                state,
                providers,
                poller,
                config,
                routes: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.inner.state
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.inner.providers
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn poller(&self) -> &StatusPoller {
        &self.inner.poller
    }

    /// Record one `Queued` task per input.
    pub async fn create_tasks(
        &self,
        kind: TaskKind,
        inputs: Vec<TaskInput>,
        run_id: Option<RunId>,
    ) -> Result<Vec<TaskKey>, RuntimeError> {
        let records: Vec<TaskRecord> = inputs
            .into_iter()
            .map(|input| {
                let record = TaskRecord::new(kind, input);
                match run_id {
                    Some(run_id) => record.for_run(run_id),
                    None => record,
                }
            })
            .collect();
        let keys = records.iter().map(|r| r.key).collect();
        self.inner.state.insert_tasks(records).await?;
        Ok(keys)
    }

    /// Drive `keys` to terminal status with at most `capacity` in flight.
    ///
    /// Queued tasks are submitted when they get a slot; tasks that already
    /// carry a provider id are only polled, never resubmitted. If `cancel`
    /// trips, every open task of the batch is cancelled and
    /// [`RuntimeError::Cancelled`] is returned.
    pub async fn run_batch(
        &self,
        keys: &[TaskKey],
        capacity: usize,
        cancel: &CancelToken,
    ) -> Result<FanOut, RuntimeError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut limiter = ConcurrencyLimiter::new(capacity);
        let mut pending: HashSet<TaskKey> = HashSet::new();

        let current: HashMap<TaskKey, TaskStatus> =
            self.inner.state.statuses(keys).await.into_iter().collect();
        {
            let mut routes = self.lock_routes()?;
            for key in keys {
                if current.get(key).is_some_and(|s| s.is_open()) && pending.insert(*key) {
                    routes.insert(*key, tx.clone());
                }
            }
        }
        info!(
            tasks = keys.len(),
            open = pending.len(),
            capacity = limiter.capacity(),
            "batch started"
        );

        for key in keys {
            if pending.contains(key) && limiter.admit(*key) == Admission::Dispatch {
                self.launch(*key, tx.clone());
            }
        }

        while !pending.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(open = pending.len(), "batch cancelled");
                    for key in &pending {
                        if let Err(e) = self.cancel_task(*key).await {
                            warn!(task = %key, error = %e, "failed to cancel batch task");
                        }
                    }
                    self.unroute(keys);
                    return Err(RuntimeError::Cancelled);
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if !pending.remove(&event.key) {
                        continue;
                    }
                    debug!(
                        task = %event.key,
                        status = %event.status,
                        remaining = pending.len(),
                        "batch task finished"
                    );
                    if let Some(next) = limiter.release(event.key) {
                        self.launch(next, tx.clone());
                    }
                }
            }
        }
        self.unroute(keys);

        let mut outcome = FanOut::default();
        for (key, status) in self.inner.state.statuses(keys).await {
            if status.is_succeeded() {
                outcome.succeeded.push(key);
            } else {
                outcome.failed.push(key);
            }
        }
        info!(succeeded = outcome.succeeded.len(), failed = outcome.failed.len(), "batch finished");
        Ok(outcome)
    }

    /// Submit every task without waiting for any of them to finish.
    pub async fn submit_all(&self, keys: &[TaskKey]) -> FanOut {
        let results = join_all(keys.iter().map(|key| self.submit(*key))).await;
        let mut outcome = FanOut::default();
        for (key, res) in keys.iter().zip(results) {
            match res {
                Ok(Submission::Accepted) => outcome.succeeded.push(*key),
                Ok(_) => outcome.failed.push(*key),
                Err(e) => {
                    warn!(task = %key, error = %e, "submission bookkeeping failed");
                    outcome.failed.push(*key);
                }
            }
        }
        outcome
    }

    /// Relocate and submit one `Queued` task.
    pub async fn submit(&self, key: TaskKey) -> Result<Submission, RuntimeError> {
        let state = &self.inner.state;
        let record = state
            .task(key)
            .await
            .ok_or(RuntimeError::TaskNotFound { key })?;
        if record.status != TaskStatus::Queued {
            return Ok(Submission::Skipped);
        }

        let client = match self.inner.providers.client(record.kind) {
            Ok(client) => client,
            Err(e) => {
                state.fail(key, e.to_task_error()).await?;
                return Ok(Submission::Failed);
            }
        };
        let input = match self.relocate(&record.input).await {
            Ok(input) => input,
            Err(error) => {
                state.fail(key, error).await?;
                return Ok(Submission::Failed);
            }
        };

        match client.submit(&input).await {
            Ok(provider_id) => {
                if state.mark_submitted(key, provider_id.clone()).await? {
                    info!(
                        task = %key,
                        kind = %record.kind,
                        provider_id = %provider_id,
                        "task submitted"
                    );
                    Ok(Submission::Accepted)
                } else {
                    info!(
                        task = %key,
                        provider_id = %provider_id,
                        "task cancelled during submission; withdrawing"
                    );
                    tokio::spawn(async move {
                        if let Err(e) = client.cancel(&provider_id).await {
                            warn!(
                                provider_id = %provider_id,
                                error = %e,
                                "best-effort cancel failed"
                            );
                        }
                    });
                    Ok(Submission::Withdrawn)
                }
            }
            Err(e) => {
                state.fail(key, e.into()).await?;
                Ok(Submission::Failed)
            }
        }
    }

    /// Cancel one task wherever it is in its lifecycle.
    ///
    /// Stops its poll, marks it `Cancelled`, fires a best-effort provider
    /// cancel and notifies the owning batch so the slot is released.
    /// Returns `false` if the task had already finished.
    pub async fn cancel_task(&self, key: TaskKey) -> Result<bool, RuntimeError> {
        self.inner.poller.stop(key);
        let Some(before) = self.inner.state.cancel_task(key).await? else {
            return Ok(false);
        };
        info!(task = %key, from = %before.status, "task cancelled");

        if let Some(provider_id) = before.id {
            let client = self.inner.providers.client(before.kind)?;
            tokio::spawn(async move {
                if let Err(e) = client.cancel(&provider_id).await {
                    warn!(provider_id = %provider_id, error = %e, "best-effort cancel failed");
                }
            });
        }

        let route = self.lock_routes()?.get(&key).cloned();
        if let Some(tx) = route {
            let _ = tx.send(TaskEvent {
                key,
                status: TaskStatus::Cancelled,
            });
        }
        Ok(true)
    }

    fn launch(&self, key: TaskKey, events: mpsc::UnboundedSender<TaskEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Some(status) = this.dispatch(key, events.clone()).await {
                let _ = events.send(TaskEvent { key, status });
            }
        });
    }

    /// Start work on a task that just got a slot.
    ///
    /// Returns the status to report when nothing will report it later.
    async fn dispatch(
        &self,
        key: TaskKey,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) -> Option<TaskStatus> {
        let state = &self.inner.state;
        let record = state.task(key).await?;

        if record.status == TaskStatus::Queued {
            match self.submit(key).await {
                Ok(Submission::Accepted) => {}
                // The cancel path already notified the batch.
                Ok(Submission::Withdrawn) => return None,
                Ok(Submission::Failed) => return Some(TaskStatus::Failed),
                Ok(Submission::Skipped) => {
                    let status = state.task(key).await?.status;
                    if status.is_terminal() {
                        return Some(status);
                    }
                }
                Err(e) => {
                    warn!(task = %key, error = %e, "dispatch failed");
                    let _ = state.fail(key, e.to_task_error()).await;
                    return Some(TaskStatus::Failed);
                }
            }
        } else if record.status.is_terminal() {
            return Some(record.status);
        }

        let client = match self.inner.providers.client(record.kind) {
            Ok(client) => client,
            Err(e) => {
                let _ = state.fail(key, e.to_task_error()).await;
                return Some(TaskStatus::Failed);
            }
        };
        let config = self.inner.config.poll_config(record.kind);
        if !self.inner.poller.start(key, client, config, events) {
            debug!(task = %key, "task already being polled");
        }
        None
    }

    /// Copy of `input` with every local asset made publicly reachable.
    async fn relocate(&self, input: &TaskInput) -> Result<TaskInput, TaskError> {
        if !input.has_local_assets() {
            return Ok(input.clone());
        }
        let relocator = self.inner.providers.relocator();
        let mut relocated = input.clone();
        for asset in relocated.assets.iter_mut() {
            if let AssetRef::Local(local) = asset {
                let url = relocator.ensure_publicly_reachable(local).await?;
                debug!(local = %local, url = %url, "asset relocated");
                *asset = AssetRef::Reachable(url);
            }
        }
        Ok(relocated)
    }

    fn lock_routes(&self) -> Result<MutexGuard<'_, Routes>, RuntimeError> {
        self.inner
            .routes
            .lock()
            .map_err(|_| RuntimeError::Store("dispatch routes poisoned".into()))
    }

    fn unroute(&self, keys: &[TaskKey]) {
        if let Ok(mut routes) = self.inner.routes.lock() {
            for key in keys {
                routes.remove(key);
            }
        }
    }
}
