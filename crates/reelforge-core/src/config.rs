//! Orchestrator tuning.
//!
//! Defaults are the values observed against the production providers; the
//! server binary overrides them from `REELFORGE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::types::TaskKind;

pub use crate::runtime::persist::PersistConfig;
pub use crate::runtime::poller::PollConfig;
pub use crate::runtime::quorum::QuorumConfig;

/// Poll attempt budget per task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxAttempts {
    pub image: u32,
    pub audio: u32,
    pub motion: u32,
    pub video: u32,
}

impl Default for MaxAttempts {
    fn default() -> Self {
        Self {
            image: 60,
            audio: 60,
            motion: 100,
            video: 100,
        }
    }
}

impl MaxAttempts {
    pub fn for_kind(&self, kind: TaskKind) -> u32 {
        match kind {
            TaskKind::Image => self.image,
            TaskKind::Audio => self.audio,
            TaskKind::Motion => self.motion,
            TaskKind::Video => self.video,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrent asset uploads inside a pipeline run.
    pub upload_concurrency: usize,
    /// Concurrent submissions of a standalone batch.
    pub batch_concurrency: usize,
    pub poll_interval: Duration,
    pub max_attempts: MaxAttempts,
    pub quorum: QuorumConfig,
    pub persist: PersistConfig,
    /// Calls made to a single-shot collaborator (group creation, looks,
    /// audio relocation) before a transient failure is surfaced. Retries
    /// are spaced by `poll_interval`.
    pub collaborator_attempts: u32,
    /// Voice used when a run request does not name one.
    pub default_voice_id: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: 2,
            batch_concurrency: 2,
            poll_interval: Duration::from_secs(5),
            max_attempts: MaxAttempts::default(),
            quorum: QuorumConfig::default(),
            persist: PersistConfig::default(),
            collaborator_attempts: 5,
            default_voice_id: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_config(&self, kind: TaskKind) -> PollConfig {
        PollConfig {
            interval: self.poll_interval,
            max_attempts: self.max_attempts.for_kind(kind),
        }
    }
}
