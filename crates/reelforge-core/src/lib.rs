//! Orchestration core for multi-stage generation jobs against asynchronous
//! external providers: admission control, status polling, quorum waiting,
//! the avatar-video pipeline and crash-resilient session state.

pub mod config;
pub mod runtime;

pub use config::OrchestratorConfig;
pub use runtime::cancel::{CancelToken, CancellationController};
pub use runtime::dispatch::FanOut;
pub use runtime::orchestrator::{BatchHandle, Orchestrator, RunHandle};
pub use runtime::persist::{MemoryStore, SessionStore};
pub use runtime::provider::{
    AssetRelocator, AvatarGroup, AvatarGroups, ProviderClient, ProviderError, ProviderRegistry,
    RemoteStatus, StatusReport,
};
pub use runtime::stage::RunRequest;
pub use runtime::state::{ProcessingFlags, SessionSnapshot, SessionState};
pub use runtime::types::{
    AssetRef, ErrorKind, PipelineRun, RunId, RunStatus, RuntimeError, StageResult, TaskError,
    TaskInput, TaskKey, TaskKind, TaskRecord, TaskResult, TaskStatus,
};
