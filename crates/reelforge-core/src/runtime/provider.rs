//! Collaborator contracts consumed by the orchestrator.
//!
//! Concrete HTTP clients live outside the core; everything here is a narrow
//! trait so tests can script provider behaviour and the binary can plug in
//! real adapters.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::types::{
    ErrorKind, RuntimeError, TaskError, TaskInput, TaskKind, TaskResult,
};

/// Failure reported by a provider-facing collaborator.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Connection reset, 5xx, malformed body: worth another try.
    #[error("{0}")]
    Transient(String),
    /// Moderation, quota, invalid input: retrying will not help.
    #[error("{0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<ProviderError> for TaskError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(m) => TaskError::new(ErrorKind::TransientNetwork, m),
            ProviderError::Rejected(m) => TaskError::new(ErrorKind::ProviderRejection, m),
        }
    }
}

impl From<ProviderError> for RuntimeError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(m) => RuntimeError::TransientNetwork(m),
            ProviderError::Rejected(m) => RuntimeError::ProviderRejection(m),
        }
    }
}

/// Provider-side view of a task's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One answer to a status check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: RemoteStatus,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusReport {
    pub fn pending() -> Self {
        Self {
            status: RemoteStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn processing() -> Self {
        Self {
            status: RemoteStatus::Processing,
            result: None,
            error: None,
        }
    }

    pub fn completed(result: TaskResult) -> Self {
        Self {
            status: RemoteStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: RemoteStatus::Failed,
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn with_result(mut self, result: TaskResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RemoteStatus::Completed | RemoteStatus::Failed)
    }
}

/// Submit/poll/cancel contract of one generation provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Submit `input` and return the provider's task id.
    async fn submit(&self, input: &TaskInput) -> Result<String, ProviderError>;

    /// Check a previously submitted task.
    ///
    /// Must be safe to call after the task is already finished.
    async fn check_status(&self, provider_task_id: &str) -> Result<StatusReport, ProviderError>;

    /// Best-effort cancel; callers never wait on the outcome.
    async fn cancel(&self, provider_task_id: &str) -> Result<(), ProviderError>;
}

/// Makes local asset references fetchable by providers.
#[async_trait]
pub trait AssetRelocator: Send + Sync {
    async fn ensure_publicly_reachable(&self, local_ref: &str) -> Result<String, ProviderError>;
}

/// Newly created avatar group and the look derived from its first asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarGroup {
    pub group_id: String,
    pub look_id: String,
}

/// Avatar group management on the avatar provider.
#[async_trait]
pub trait AvatarGroups: Send + Sync {
    async fn create_group(&self, name: &str, first_asset: &str)
    -> Result<AvatarGroup, ProviderError>;

    /// Add one look per asset; returns look ids in asset order.
    async fn add_looks(&self, group_id: &str, assets: &[String])
    -> Result<Vec<String>, ProviderError>;
}

/// All collaborators the orchestrator talks to, keyed by task kind.
///
/// Clients must be registered via [`Self::register`] before the registry is
/// handed to an orchestrator; [`Self::validate`] turns a missing client into
/// a configuration error up front.
#[derive(Clone)]
pub struct ProviderRegistry {
    clients: HashMap<TaskKind, Arc<dyn ProviderClient>>,
    relocator: Arc<dyn AssetRelocator>,
    groups: Arc<dyn AvatarGroups>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.clients.keys().map(|k| k.as_ref()).collect();
        kinds.sort_unstable();
        f.debug_struct("ProviderRegistry")
            .field("clients", &kinds)
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new(relocator: Arc<dyn AssetRelocator>, groups: Arc<dyn AvatarGroups>) -> Self {
        Self {
            clients: HashMap::new(),
            relocator,
            groups,
        }
    }

    /// Register (or replace) the client serving `kind`.
    pub fn register(mut self, kind: TaskKind, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.insert(kind, client);
        self
    }

    pub fn client(&self, kind: TaskKind) -> Result<Arc<dyn ProviderClient>, RuntimeError> {
        self.clients
            .get(&kind)
            .cloned()
            .ok_or_else(|| {
                RuntimeError::Configuration(format!("no provider registered for {kind}"))
            })
    }

    pub fn relocator(&self) -> &Arc<dyn AssetRelocator> {
        &self.relocator
    }

    pub fn groups(&self) -> &Arc<dyn AvatarGroups> {
        &self.groups
    }

    /// Fail fast when any task kind lacks a client.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        for kind in [TaskKind::Image, TaskKind::Audio, TaskKind::Motion, TaskKind::Video] {
            self.client(kind)?;
        }
        Ok(())
    }
}
