use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

/// Local identifier of a [`TaskRecord`].
///
/// Assigned when the record is created, long before the provider hands out
/// its own id, so a task can be tracked (and cancelled) while still queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(pub Uuid);

impl TaskKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a [`PipelineRun`].
pub type RunId = Uuid;

/// The kind of external work a task represents.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskKind {
    Image,
    Audio,
    Motion,
    Video,
}

/// Lifecycle state of a [`TaskRecord`].
///
/// Transitions are forward-only:
/// `Queued → Submitted → Processing → {Completed | Failed | Cancelled}`,
/// plus the single post-terminal step `Completed → Downloaded` for videos.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Submitted,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Downloaded,
}

impl TaskStatus {
    /// Progress rank used to resolve competing writes for the same task.
    pub fn rank(self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Submitted => 1,
            TaskStatus::Processing => 2,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => 3,
            TaskStatus::Downloaded => 4,
        }
    }

    /// No further automatic transition happens from a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::Downloaded
        )
    }

    /// The provider has accepted the task and it has not finished yet.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Submitted | TaskStatus::Processing)
    }

    /// Still waiting on something: queued locally or in flight at the provider.
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }

    pub fn is_succeeded(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Downloaded)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Submitted | Failed | Cancelled)
                | (Submitted, Processing | Completed | Failed | Cancelled)
                | (Processing, Completed | Failed | Cancelled)
                | (Completed, Downloaded)
        )
    }
}

/// Reference to a source asset used as submission input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "ref", rename_all = "snake_case")]
pub enum AssetRef {
    /// Local or opaque reference that providers cannot fetch by themselves.
    Local(String),
    /// Reference a provider can resolve directly (public URL or provider id).
    Reachable(String),
}

impl AssetRef {
    pub fn as_str(&self) -> &str {
        match self {
            AssetRef::Local(r) | AssetRef::Reachable(r) => r,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, AssetRef::Local(_))
    }
}

/// Immutable submission payload of a task.
///
/// The recorded input is never rewritten; relocation of local assets
/// produces a separate copy at dispatch time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<AssetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl TaskInput {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    pub fn asset(asset: AssetRef) -> Self {
        Self {
            assets: vec![asset],
            ..Default::default()
        }
    }

    pub fn with_asset(mut self, asset: AssetRef) -> Self {
        self.assets.push(asset);
        self
    }

    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = Some(voice_id.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn has_local_assets(&self) -> bool {
        self.assets.iter().any(AssetRef::is_local)
    }
}

/// Artifact produced by a task.
///
/// Fields may be filled in piecemeal while the task is still processing
/// (a thumbnail often shows up before the final URL); [`Self::merge`] never
/// drops a field that is already known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl TaskResult {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn merge(&mut self, newer: TaskResult) {
        if newer.url.is_some() {
            self.url = newer.url;
        }
        if newer.duration_secs.is_some() {
            self.duration_secs = newer.duration_secs;
        }
        if newer.thumbnail_url.is_some() {
            self.thumbnail_url = newer.thumbnail_url;
        }
    }
}

/// Error taxonomy shared by task records, runs and the HTTP surface.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Retried on the next poll tick; only surfaced once attempts run out.
    TransientNetwork,
    /// Permanent provider-side refusal (moderation, quota, invalid input).
    ProviderRejection,
    /// Poll attempts exhausted; the provider may still finish the job.
    Timeout,
    /// Missing credentials or configuration.
    Configuration,
    /// A fan-out stage ended without a single success.
    NoQuorum,
    /// A fan-out stage lost some siblings but the run continued.
    PartialFailure,
    /// The run was cut short by a process restart.
    Interrupted,
    /// Attached to cancelled records; never reported as a run error.
    Cancelled,
}

/// Error attached to a [`TaskRecord`] or [`PipelineRun`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rejection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderRejection, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientNetwork, message)
    }

    pub fn timeout(attempts: u32) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!(
                "no terminal status after {attempts} polls; the provider may still be \
                 processing, check manually"
            ),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by user")
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One external unit of work tracked through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub key: TaskKey,
    /// Provider-side id; `None` until the submission is accepted.
    pub id: Option<String>,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub input: TaskInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Successful non-terminal poll ticks; drives the timeout cutoff.
    #[serde(default)]
    pub attempts: u32,
    /// Owning pipeline run, if the task was created by one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(kind: TaskKind, input: TaskInput) -> Self {
        let now = Utc::now();
        Self {
            key: TaskKey::new(),
            id: None,
            kind,
            status: TaskStatus::Queued,
            input,
            result: None,
            error: None,
            attempts: 0,
            run_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn for_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Move to `next`, enforcing the forward-only lifecycle.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), RuntimeError> {
        if !self.status.can_transition_to(next) {
            return Err(RuntimeError::InvalidTransition {
                key: self.key,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// URL of the finished artifact; only meaningful once succeeded.
    pub fn artifact_url(&self) -> Option<&str> {
        if !self.status.is_succeeded() {
            return None;
        }
        self.result.as_ref().and_then(|r| r.url.as_deref())
    }
}

/// Status of a [`PipelineRun`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Running,
    PartiallySucceeded,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Outcome of one executed stage, by task key.
///
/// Single-result stages leave both lists empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    #[serde(default)]
    pub succeeded: Vec<TaskKey>,
    #[serde(default)]
    pub failed: Vec<TaskKey>,
}

/// One user-initiated multi-stage job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    /// Stage names in execution order, including the one that stopped the run.
    #[serde(default)]
    pub stages: Vec<String>,
    #[serde(default)]
    pub stage_results: BTreeMap<String, StageResult>,
    pub status: RunStatus,
    /// Terminal failure surfaced verbatim; `None` for cancelled runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Partial failures that did not stop the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            stages: Vec::new(),
            stage_results: BTreeMap::new(),
            status: RunStatus::Running,
            error: None,
            warnings: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors produced by the orchestration core.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// Network hiccup talking to a collaborator; retried by the caller.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// A provider refused the request permanently.
    #[error("{0}")]
    ProviderRejection(String),

    /// A poll ran out of attempts.
    #[error("task {key} timed out after {attempts} polls; it may still be processing, check manually")]
    Timeout { key: TaskKey, attempts: u32 },

    /// Missing credentials or configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A fan-out stage produced zero successes.
    #[error("stage '{stage}' finished without a single successful task")]
    NoQuorum { stage: String },

    /// A non-fan-out stage failed; `message` is the provider's text, verbatim.
    #[error("{message}")]
    StageFailed {
        stage: String,
        kind: ErrorKind,
        message: String,
    },

    /// The caller asked for something malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The referenced task does not exist.
    #[error("task not found: {key}")]
    TaskNotFound { key: TaskKey },

    /// The referenced run does not exist.
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: RunId },

    /// A status change would move a task backwards.
    #[error("invalid transition for task {key}: {from} -> {to}")]
    InvalidTransition {
        key: TaskKey,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A task without a provider id cannot be polled.
    #[error("task {key} has not been submitted")]
    NotSubmitted { key: TaskKey },

    /// The session store failed to load or save.
    #[error("session store error: {0}")]
    Store(String),

    /// Cooperative cancellation was observed.
    #[error("cancelled")]
    Cancelled,

    /// A background worker went away.
    #[error("orchestrator shut down")]
    Shutdown,
}

impl RuntimeError {
    /// Map to the reporting taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::TransientNetwork(_) | RuntimeError::Store(_) | RuntimeError::Shutdown => {
                ErrorKind::TransientNetwork
            }
            RuntimeError::Timeout { .. } => ErrorKind::Timeout,
            RuntimeError::Configuration(_) => ErrorKind::Configuration,
            RuntimeError::NoQuorum { .. } => ErrorKind::NoQuorum,
            RuntimeError::Cancelled => ErrorKind::Cancelled,
            RuntimeError::StageFailed { kind, .. } => *kind,
            RuntimeError::ProviderRejection(_)
            | RuntimeError::InvalidRequest(_)
            | RuntimeError::TaskNotFound { .. }
            | RuntimeError::RunNotFound { .. }
            | RuntimeError::InvalidTransition { .. }
            | RuntimeError::NotSubmitted { .. } => ErrorKind::ProviderRejection,
        }
    }

    /// Stage-level failure carrying a task's own error verbatim.
    pub fn stage_failed(stage: &str, error: &TaskError) -> Self {
        RuntimeError::StageFailed {
            stage: stage.to_owned(),
            kind: error.kind,
            message: error.message.clone(),
        }
    }

    pub fn to_task_error(&self) -> TaskError {
        TaskError::new(self.kind(), self.to_string())
    }
}
