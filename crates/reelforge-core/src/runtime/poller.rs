//! Generic per-task status polling.
//!
//! [`poll_once`] is the single tick shared by every poller: it asks the
//! provider for the task's status and folds the answer into the latest
//! snapshot. [`StatusPoller`] schedules those ticks on an interval, one
//! poll per task key, and reports terminal statuses on an event channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::runtime::provider::{ProviderClient, ProviderError};
use crate::runtime::state::SessionState;
use crate::runtime::types::{RuntimeError, TaskError, TaskKey, TaskStatus};

/// Interval and attempt budget of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// Non-terminal answers tolerated before the task is timed out.
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 60,
        }
    }
}

/// A task reached a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskEvent {
    pub key: TaskKey,
    pub status: TaskStatus,
}

/// What a single status check did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The record was already terminal; nothing changed.
    AlreadyTerminal(TaskStatus),
    /// The check itself failed transiently; retried next tick.
    Transient,
    /// Still running after `attempts` successful checks.
    Pending { attempts: u32 },
    /// This check moved the record to a terminal status.
    Terminal(TaskStatus),
}

/// Check `key` once and apply the answer.
///
/// Safe to call at any point of the task's life: terminal records are
/// detected before the provider is contacted.
pub async fn poll_once(
    state: &SessionState,
    client: &dyn ProviderClient,
    key: TaskKey,
) -> Result<TickOutcome, RuntimeError> {
    let record = state
        .task(key)
        .await
        .ok_or(RuntimeError::TaskNotFound { key })?;
    if record.status.is_terminal() {
        return Ok(TickOutcome::AlreadyTerminal(record.status));
    }
    let provider_id = record.id.ok_or(RuntimeError::NotSubmitted { key })?;

    match client.check_status(&provider_id).await {
        Ok(report) => {
            debug!(
                task = %key,
                provider_id = %provider_id,
                status = ?report.status,
                "status checked"
            );
            state.apply_report(key, report).await
        }
        Err(ProviderError::Transient(message)) => {
            warn!(
                task = %key,
                provider_id = %provider_id,
                %message,
                "transient error while checking status"
            );
            Ok(TickOutcome::Transient)
        }
        Err(ProviderError::Rejected(message)) => {
            let failed = state.fail(key, TaskError::rejection(message)).await?;
            Ok(if failed {
                TickOutcome::Terminal(TaskStatus::Failed)
            } else {
                TickOutcome::AlreadyTerminal(TaskStatus::Failed)
            })
        }
    }
}

struct ActivePoll {
    generation: u64,
    abort: AbortHandle,
}

/// Interval scheduler running at most one poll per task key.
#[derive(Clone)]
pub struct StatusPoller {
    state: SessionState,
    active: Arc<Mutex<HashMap<TaskKey, ActivePoll>>>,
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for StatusPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPoller")
            .field("active", &self.active_count())
            .finish()
    }
}

impl StatusPoller {
    pub fn new(state: SessionState) -> Self {
        Self {
            state,
            active: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start polling `key`. Returns `false` if a poll is already running.
    ///
    /// The first check happens one interval after the call. Terminal
    /// statuses reached by this poll (including a timeout) are sent on
    /// `events`; a poll that finds the record already terminal stops
    /// silently, since whoever finished it reports that.
    pub fn start(
        &self,
        key: TaskKey,
        client: Arc<dyn ProviderClient>,
        config: PollConfig,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) -> bool {
        let Ok(mut active) = self.active.lock() else {
            return false;
        };
        if active.contains_key(&key) {
            debug!(task = %key, "poll already running");
            return false;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let poller = self.clone();
        let handle = tokio::spawn(async move {
            poller.drive(key, client, config, events).await;
            poller.forget(key, generation);
        });
        active.insert(
            key,
            ActivePoll {
                generation,
                abort: handle.abort_handle(),
            },
        );
        debug!(
            task = %key,
            interval_ms = config.interval.as_millis() as u64,
            max_attempts = config.max_attempts,
            "poll started"
        );
        true
    }

    /// Stop the poll for `key`, if any. No further tick fires.
    pub fn stop(&self, key: TaskKey) -> bool {
        let removed = self
            .active
            .lock()
            .ok()
            .and_then(|mut active| active.remove(&key));
        match removed {
            Some(poll) => {
                poll.abort.abort();
                debug!(task = %key, "poll stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        if let Ok(mut active) = self.active.lock() {
            for (_, poll) in active.drain() {
                poll.abort.abort();
            }
        }
    }

    pub fn is_polling(&self, key: TaskKey) -> bool {
        self.active
            .lock()
            .map(|active| active.contains_key(&key))
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or(0)
    }

    fn forget(&self, key: TaskKey, generation: u64) {
        if let Ok(mut active) = self.active.lock() {
            if active.get(&key).is_some_and(|p| p.generation == generation) {
                active.remove(&key);
            }
        }
    }

    async fn drive(
        &self,
        key: TaskKey,
        client: Arc<dyn ProviderClient>,
        config: PollConfig,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) {
        let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let status = match poll_once(&self.state, client.as_ref(), key).await {
                Ok(TickOutcome::Pending { attempts }) if attempts >= config.max_attempts => {
                    match self.state.time_out(key).await {
                        Ok(true) => TaskStatus::Failed,
                        Ok(false) => return,
                        Err(e) => {
                            warn!(task = %key, error = %e, "failed to record timeout");
                            return;
                        }
                    }
                }
                Ok(TickOutcome::Pending { .. }) | Ok(TickOutcome::Transient) => continue,
                Ok(TickOutcome::Terminal(status)) => status,
                Ok(TickOutcome::AlreadyTerminal(_)) => return,
                Err(e) => {
                    // Nothing left to poll; make sure waiters are not stranded.
                    warn!(task = %key, error = %e, "poll aborted");
                    let _ = self.state.fail(key, e.to_task_error()).await;
                    TaskStatus::Failed
                }
            };
            info!(task = %key, %status, "poll finished");
            let _ = events.send(TaskEvent { key, status });
            return;
        }
    }
}
