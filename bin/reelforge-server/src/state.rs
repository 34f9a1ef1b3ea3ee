//! Shared application state injected into every Axum handler.

use std::collections::HashMap;
use std::sync::Arc;

use reelforge_core::{
    BatchHandle, Orchestrator, OrchestratorConfig, ProviderRegistry, SessionStore,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ServerError;

/// Open orchestrators keyed by session id.
///
/// Stored sessions are opened at startup by [`SessionManager::resume_all`];
/// any other session is created the first time a request names it. Open
/// sessions stay open until shutdown.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    providers: ProviderRegistry,
    config: OrchestratorConfig,
    open: Mutex<HashMap<String, Orchestrator>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.open.try_lock().map(|m| m.len()).unwrap_or(0);
        write!(f, "SessionManager({count} open)")
    }
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        providers: ProviderRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            providers,
            config,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// The orchestrator for `session_id`, restoring it on first use.
    pub async fn get(&self, session_id: &str) -> Result<Orchestrator, ServerError> {
        if session_id.trim().is_empty() {
            return Err(ServerError::BadRequest("session id must not be empty".into()));
        }
        let mut open = self.open.lock().await;
        if let Some(orchestrator) = open.get(session_id) {
            return Ok(orchestrator.clone());
        }
        let (orchestrator, resumed) = Orchestrator::open(
            session_id,
            Arc::clone(&self.store),
            self.providers.clone(),
            self.config.clone(),
        )
        .await?;
        info!(session = %session_id, resumed = resumed.len(), "session opened");
        watch_resumed(session_id, resumed);
        open.insert(session_id.to_owned(), orchestrator.clone());
        Ok(orchestrator)
    }

    /// Open every listed session so its unfinished tasks resume polling
    /// without waiting for a request. Returns how many were opened.
    pub async fn resume_all(&self, session_ids: impl IntoIterator<Item = String>) -> usize {
        let mut opened = 0;
        for session_id in session_ids {
            match self.get(&session_id).await {
                Ok(_) => opened += 1,
                Err(e) => {
                    warn!(session = %session_id, error = %e, "failed to resume stored session")
                }
            }
        }
        opened
    }

    /// Stop polling in every open session and persist its latest snapshot.
    pub async fn shutdown(&self) {
        let open = self.open.lock().await;
        for (session_id, orchestrator) in open.iter() {
            if let Err(e) = orchestrator.shutdown().await {
                warn!(session = %session_id, error = %e, "failed to persist session on shutdown");
            }
        }
    }
}

fn watch_resumed(session_id: &str, handles: Vec<BatchHandle>) {
    for handle in handles {
        let session_id = session_id.to_owned();
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(fan_out) => info!(
                    session = %session_id,
                    succeeded = fan_out.succeeded.len(),
                    failed = fan_out.failed.len(),
                    "resumed batch settled"
                ),
                Err(e) => warn!(session = %session_id, error = %e, "resumed batch aborted"),
            }
        });
    }
}

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
}

// ── Tests ──────────────────────────────────────────────────────────────────────
