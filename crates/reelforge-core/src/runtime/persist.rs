//! Debounced write-through of the session snapshot.
//!
//! Poll ticks mutate the snapshot far more often than it is worth saving.
//! The persister coalesces dirty marks for [`PersistConfig::coalesce`] after
//! the first one and never writes more often than
//! [`PersistConfig::min_interval`]. User-initiated commands call
//! [`PersistHandle::flush`] to write immediately.
//!
//! The writer always reads the latest snapshot at write time; nothing is
//! captured when the dirty mark is sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::runtime::state::SessionSnapshot;
use crate::runtime::types::RuntimeError;

/// Key/value persistence for session snapshots.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_snapshot(&self, session_id: &str)
    -> Result<Option<SessionSnapshot>, RuntimeError>;

    /// Write-through save; last write wins.
    async fn save_snapshot(
        &self,
        session_id: &str,
        snapshot: &SessionSnapshot,
    ) -> Result<(), RuntimeError>;
}

/// Debounce tuning.
#[derive(Debug, Clone, Copy)]
pub struct PersistConfig {
    /// Window after the first dirty mark in which further marks coalesce.
    pub coalesce: Duration,
    /// Minimum spacing between two debounced writes.
    pub min_interval: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            coalesce: Duration::from_secs(1),
            min_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
enum PersistCommand {
    Dirty,
    Flush(oneshot::Sender<Result<(), RuntimeError>>),
}

/// Sender side of a running persister.
///
/// The persister exits (after a final write if dirty) once every handle is
/// dropped.
#[derive(Debug, Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistHandle {
    pub fn mark_dirty(&self) {
        let _ = self.tx.send(PersistCommand::Dirty);
    }

    pub async fn flush(&self) -> Result<(), RuntimeError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(PersistCommand::Flush(ack_tx))
            .map_err(|_| RuntimeError::Shutdown)?;
        ack_rx.await.map_err(|_| RuntimeError::Shutdown)?
    }
}

/// Spawn the writer task for `session_id`.
pub(crate) fn spawn_persister(
    session_id: String,
    shared: Arc<RwLock<SessionSnapshot>>,
    store: Arc<dyn SessionStore>,
    config: PersistConfig,
) -> PersistHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        Persister {
            session_id,
            shared,
            store,
            config,
        }
        .run(rx)
        .await;
    });
    PersistHandle { tx }
}

struct Persister {
    session_id: String,
    shared: Arc<RwLock<SessionSnapshot>>,
    store: Arc<dyn SessionStore>,
    config: PersistConfig,
}

impl Persister {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
        let mut dirty_since: Option<Instant> = None;
        let mut last_write: Option<Instant> = None;

        loop {
            let deadline = dirty_since.map(|since| {
                let coalesced = since + self.config.coalesce;
                match last_write {
                    Some(last) => coalesced.max(last + self.config.min_interval),
                    None => coalesced,
                }
            });

            let cmd = match deadline {
                Some(at) => tokio::select! {
                    cmd = rx.recv() => cmd,
                    _ = tokio::time::sleep_until(at) => {
                        match self.write().await {
                            Ok(()) => dirty_since = None,
                            // Retry after another coalesce window.
                            Err(_) => dirty_since = Some(Instant::now()),
                        }
                        last_write = Some(Instant::now());
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            match cmd {
                Some(PersistCommand::Dirty) => {
                    dirty_since.get_or_insert_with(Instant::now);
                }
                Some(PersistCommand::Flush(ack)) => {
                    let res = self.write().await;
                    if res.is_ok() {
                        dirty_since = None;
                    }
                    last_write = Some(Instant::now());
                    let _ = ack.send(res);
                }
                None => {
                    if dirty_since.is_some() {
                        let _ = self.write().await;
                    }
                    debug!(session = %self.session_id, "persister stopped");
                    return;
                }
            }
        }
    }

    async fn write(&self) -> Result<(), RuntimeError> {
        let snapshot = self.shared.read().await.clone();
        match self.store.save_snapshot(&self.session_id, &snapshot).await {
            Ok(()) => {
                debug!(session = %self.session_id, revision = snapshot.revision, "snapshot saved");
                Ok(())
            }
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "failed to save snapshot");
                Err(e)
            }
        }
    }
}

/// Process-local [`SessionStore`] that keeps snapshots as JSON text.
///
/// Storing the serialised form means every save/load goes through the same
/// serde path a real store would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, String>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_snapshot(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionSnapshot>, RuntimeError> {
        let raw = self
            .snapshots
            .lock()
            .map_err(|_| RuntimeError::Store("memory store poisoned".into()))?
            .get(session_id)
            .cloned();
        raw.map(|text| {
            serde_json::from_str(&text).map_err(|e| RuntimeError::Store(e.to_string()))
        })
        .transpose()
    }

    async fn save_snapshot(
        &self,
        session_id: &str,
        snapshot: &SessionSnapshot,
    ) -> Result<(), RuntimeError> {
        let text =
            serde_json::to_string(snapshot).map_err(|e| RuntimeError::Store(e.to_string()))?;
        self.snapshots
            .lock()
            .map_err(|_| RuntimeError::Store("memory store poisoned".into()))?
            .insert(session_id.to_owned(), text);
        self.saves.fetch_add(1, Ordering::SeqCst);
        info!(session = %session_id, revision = snapshot.revision, "memory snapshot stored");
        Ok(())
    }
}
