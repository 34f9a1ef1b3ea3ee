use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::runtime::cancel::{CancelToken, CancellationController};
use crate::runtime::dispatch::{Dispatcher, FanOut};
use crate::runtime::persist::{SessionStore, spawn_persister};
use crate::runtime::pipeline::PipelineCoordinator;
use crate::runtime::provider::ProviderRegistry;
use crate::runtime::reconcile::{ResumePlan, restore};
use crate::runtime::stage::{RunContext, RunRequest, StageEnv};
use crate::runtime::state::{SessionSnapshot, SessionState};
use crate::runtime::types::{
    PipelineRun, RunId, RuntimeError, TaskInput, TaskKey, TaskKind, TaskStatus,
};

/// Commands handled by the orchestrator's run-control loop.
#[derive(Debug)]
enum OrchestratorCommand {
    /// Launch a pipeline run that has already been recorded.
    StartRun {
        run_id: RunId,
        request: RunRequest,
        reply_tx: oneshot::Sender<JoinHandle<Result<PipelineRun, RuntimeError>>>,
    },
    /// Trip a run's cancellation token. Replies `false` if it is not live.
    CancelRun {
        run_id: RunId,
        reply_tx: oneshot::Sender<bool>,
    },
    /// Sent by a run's own task when it ends.
    RunFinished { run_id: RunId },
}

/// Handle to a launched pipeline run.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: RunId,
    join: JoinHandle<Result<PipelineRun, RuntimeError>>,
}

impl RunHandle {
    /// Wait for the run to reach a terminal status.
    pub async fn wait(self) -> Result<PipelineRun, RuntimeError> {
        self.join.await.map_err(|_| RuntimeError::Shutdown)?
    }
}

/// Handle to a standalone admission-controlled batch.
#[derive(Debug)]
pub struct BatchHandle {
    pub keys: Vec<TaskKey>,
    join: JoinHandle<Result<FanOut, RuntimeError>>,
}

impl BatchHandle {
    pub async fn wait(self) -> Result<FanOut, RuntimeError> {
        self.join.await.map_err(|_| RuntimeError::Shutdown)?
    }
}

/// Session-scoped orchestration facade.
///
/// Owns the session state, the dispatcher (admission, submission, polling)
/// and the pipeline coordinator. Live runs and their cancellation
/// controllers are owned by a single command loop, so starting, cancelling
/// and finishing runs never race.
///
/// # Usage
///
/// ```rust,ignore
/// let orchestrator = Orchestrator::open("session-1", store, providers, config).await?;
/// let run = orchestrator.start_run(request).await?;
/// let finished = run.wait().await?;
/// ```
#[derive(Clone, Debug)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    dispatcher: Dispatcher,
    commands: mpsc::UnboundedSender<OrchestratorCommand>,
}

impl Orchestrator {
    /// Restore `session_id` from `store`, attach the debounced persister and
    /// resume whatever was in flight.
    ///
    /// Fails with [`RuntimeError::Configuration`] before touching any task
    /// if a provider is missing.
    pub async fn open(
        session_id: &str,
        store: Arc<dyn SessionStore>,
        providers: ProviderRegistry,
        config: OrchestratorConfig,
    ) -> Result<(Self, Vec<BatchHandle>), RuntimeError> {
        providers.validate()?;
        let (snapshot, plan) = restore(session_id, store.as_ref()).await?;

        let mut state = SessionState::new(snapshot);
        let persister =
            spawn_persister(session_id.to_owned(), state.shared(), store, config.persist);
        state.attach_persister(persister);
        state.flush().await?;

        let orchestrator = Self::new(state, providers, config);
        let resumed = orchestrator.resume(plan).await;
        Ok((orchestrator, resumed))
    }

    /// Orchestrator over an existing state handle.
    pub fn new(
        state: SessionState,
        providers: ProviderRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(state.clone(), providers, config);
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(PipelineCoordinator::avatar_video());

        let loop_dispatcher = dispatcher.clone();
        let loop_tx = tx.downgrade();
        tokio::spawn(async move {
            Self::run_loop(rx, loop_tx, loop_dispatcher, pipeline).await;
        });

        Self {
            inner: Arc::new(Inner {
                state,
                dispatcher,
                commands: tx,
            }),
        }
    }

    /// Run-control loop: owns every live run's cancellation controller.
    async fn run_loop(
        mut rx: mpsc::UnboundedReceiver<OrchestratorCommand>,
        tx: mpsc::WeakUnboundedSender<OrchestratorCommand>,
        dispatcher: Dispatcher,
        pipeline: Arc<PipelineCoordinator>,
    ) {
        let mut live: HashMap<RunId, CancellationController> = HashMap::new();

        while let Some(cmd) = rx.recv().await {
            match cmd {
                OrchestratorCommand::StartRun {
                    run_id,
                    request,
                    reply_tx,
                } => {
                    let controller = CancellationController::new();
                    let env = StageEnv {
                        run_id,
                        dispatcher: dispatcher.clone(),
                        cancel: controller.token(),
                    };
                    live.insert(run_id, controller);

                    let pipeline = Arc::clone(&pipeline);
                    let done_tx = tx.clone();
                    let join = tokio::spawn(async move {
                        let res = pipeline.execute(&env, RunContext::new(request)).await;
                        if let Err(e) = &res {
                            warn!(run_id = %run_id, error = %e, "run aborted by bookkeeping error");
                        }
                        let _ = env.state().flush().await;
                        if let Some(done_tx) = done_tx.upgrade() {
                            let _ = done_tx.send(OrchestratorCommand::RunFinished { run_id });
                        }
                        res
                    });
                    let _ = reply_tx.send(join);
                }

                OrchestratorCommand::CancelRun { run_id, reply_tx } => {
                    let found = match live.get(&run_id) {
                        Some(controller) => {
                            controller.cancel();
                            info!(run_id = %run_id, "run cancellation requested");
                            true
                        }
                        None => false,
                    };
                    let _ = reply_tx.send(found);
                }

                OrchestratorCommand::RunFinished { run_id } => {
                    live.remove(&run_id);
                }
            }
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.inner.state
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.snapshot().await
    }

    /// Revision counter for change notification.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.state.subscribe()
    }

    /// Record and launch an admission-controlled batch outside any run.
    pub async fn submit_tasks(
        &self,
        kind: TaskKind,
        inputs: Vec<TaskInput>,
    ) -> Result<BatchHandle, RuntimeError> {
        if inputs.is_empty() {
            return Err(RuntimeError::InvalidRequest("batch must not be empty".into()));
        }
        let dispatcher = &self.inner.dispatcher;
        let keys = dispatcher.create_tasks(kind, inputs, None).await?;
        self.inner.state.flush().await?;

        let capacity = dispatcher.config().batch_concurrency;
        info!(%kind, tasks = keys.len(), capacity, "batch submitted");
        Ok(self.spawn_batch(keys, capacity))
    }

    /// Record a new run and launch the pipeline for it.
    pub async fn start_run(&self, request: RunRequest) -> Result<RunHandle, RuntimeError> {
        request.validate()?;
        let run = PipelineRun::new();
        let run_id = run.run_id;
        self.inner.state.insert_run(run).await?;
        self.inner.state.flush().await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .commands
            .send(OrchestratorCommand::StartRun {
                run_id,
                request,
                reply_tx,
            })
            .map_err(|_| RuntimeError::Shutdown)?;
        let join = reply_rx.await.map_err(|_| RuntimeError::Shutdown)?;
        info!(run_id = %run_id, "run started");
        Ok(RunHandle { run_id, join })
    }

    /// Cancel one task. Returns `false` if it had already finished.
    pub async fn cancel_task(&self, key: TaskKey) -> Result<bool, RuntimeError> {
        let cancelled = self.inner.dispatcher.cancel_task(key).await?;
        self.inner.state.flush().await?;
        Ok(cancelled)
    }

    /// Cancel a run and every open task it created.
    ///
    /// Returns `false` if the run had already finished and none of its
    /// tasks were still open.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<bool, RuntimeError> {
        if self.inner.state.run(run_id).await.is_none() {
            return Err(RuntimeError::RunNotFound { run_id });
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .commands
            .send(OrchestratorCommand::CancelRun { run_id, reply_tx })
            .map_err(|_| RuntimeError::Shutdown)?;
        let tripped = reply_rx.await.map_err(|_| RuntimeError::Shutdown)?;

        let snapshot = self.inner.state.snapshot().await;
        let open: Vec<TaskKey> = snapshot
            .tasks
            .iter()
            .filter(|t| t.run_id == Some(run_id) && t.status.is_open())
            .map(|t| t.key)
            .collect();
        let mut cancelled_any = false;
        for key in open {
            cancelled_any |= self.inner.dispatcher.cancel_task(key).await?;
        }
        self.inner.state.flush().await?;
        Ok(tripped || cancelled_any)
    }

    /// Execute a restore plan.
    ///
    /// In-flight tasks are polled (never resubmitted) with no admission
    /// cap, since the provider already accepted them; re-admitted tasks go
    /// through one capped batch per kind.
    pub async fn resume(&self, plan: ResumePlan) -> Vec<BatchHandle> {
        let mut handles = Vec::new();
        if plan.is_empty() {
            return handles;
        }
        if !plan.repoll.is_empty() {
            handles.push(self.spawn_batch(plan.repoll.clone(), usize::MAX));
        }

        let snapshot = self.inner.state.snapshot().await;
        let mut by_kind: HashMap<TaskKind, Vec<TaskKey>> = HashMap::new();
        let readmit: HashSet<TaskKey> = plan.readmit.iter().copied().collect();
        for task in &snapshot.tasks {
            if readmit.contains(&task.key) && task.status == TaskStatus::Queued {
                by_kind.entry(task.kind).or_default().push(task.key);
            }
        }
        let capacity = self.inner.dispatcher.config().batch_concurrency;
        for (_, keys) in by_kind {
            handles.push(self.spawn_batch(keys, capacity));
        }
        info!(repoll = plan.repoll.len(), readmit = plan.readmit.len(), "session resumed");
        handles
    }

    /// `Completed → Downloaded` for a video whose artifact was fetched.
    pub async fn mark_downloaded(
        &self,
        key: TaskKey,
        relocated_url: Option<String>,
    ) -> Result<(), RuntimeError> {
        self.inner.state.mark_downloaded(key, relocated_url).await?;
        self.inner.state.flush().await
    }

    /// Stop every poll and persist the latest snapshot.
    ///
    /// Records stay as they are; the next [`Self::open`] resumes them.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.inner.dispatcher.poller().stop_all();
        self.inner.state.flush().await
    }

    fn spawn_batch(&self, keys: Vec<TaskKey>, capacity: usize) -> BatchHandle {
        let dispatcher = self.inner.dispatcher.clone();
        let batch_keys = keys.clone();
        let join = tokio::spawn(async move {
            let res = dispatcher
                .run_batch(&batch_keys, capacity, &CancelToken::never())
                .await;
            let _ = dispatcher.state().flush().await;
            res
        });
        BatchHandle { keys, join }
    }
}
