//! Terminal List
//!
//! Creates sessions and keeps them until they are freed. Sessions are shared as
//! `Arc<tokio::sync::Mutex<Session>>` so a UI task and a background idle task
//! can both drive them, one at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Session, SessionCallbacks, SessionStatus};
use crate::backend::BackendFactory;
use crate::config::{EngineConfig, SessionData};

/// Default maximum number of sessions in one list
const DEFAULT_MAX_TERMINALS: usize = 20;

pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session limit reached ({current}/{max})")]
    LimitReached { current: usize, max: usize },
}

impl serde::Serialize for RegistryError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// All sessions created with one engine configuration
pub struct TerminalList {
    config: Arc<EngineConfig>,
    factory: Arc<dyn BackendFactory>,
    terminals: DashMap<String, SharedSession>,
    /// Creation order, for listing
    order: parking_lot::Mutex<Vec<String>>,
    max_terminals: AtomicUsize,
    /// Serializes the limit check with the insert
    create_lock: parking_lot::Mutex<()>,
}

impl TerminalList {
    pub fn new(config: Arc<EngineConfig>, factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            config,
            factory,
            terminals: DashMap::new(),
            order: parking_lot::Mutex::new(Vec::new()),
            max_terminals: AtomicUsize::new(DEFAULT_MAX_TERMINALS),
            create_lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn with_max_terminals(self, max: usize) -> Self {
        self.max_terminals.store(max, Ordering::SeqCst);
        self
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Create a closed session for `data` and keep it in the list
    pub fn new_terminal(
        &self,
        data: SessionData,
        callbacks: Arc<dyn SessionCallbacks>,
    ) -> Result<(String, SharedSession), RegistryError> {
        let _guard = self.create_lock.lock();

        let current = self.terminals.len();
        let max = self.max_terminals.load(Ordering::SeqCst);
        if current >= max {
            return Err(RegistryError::LimitReached { current, max });
        }

        let session = Session::new(data, self.config.clone(), callbacks, self.factory.clone());
        let id = session.id().to_string();
        info!("Creating session {} ({})", id, session.session_name());

        let shared = Arc::new(Mutex::new(session));
        self.terminals.insert(id.clone(), shared.clone());
        self.order.lock().push(id.clone());
        Ok((id, shared))
    }

    pub fn get(&self, id: &str) -> Option<SharedSession> {
        self.terminals.get(id).map(|entry| entry.value().clone())
    }

    /// Sessions in creation order
    pub fn terminals(&self) -> Vec<SharedSession> {
        self.order
            .lock()
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.terminals.len()
    }

    /// Number of connected sessions
    pub async fn active_count(&self) -> usize {
        let mut active = 0;
        for terminal in self.terminals() {
            if terminal.lock().await.is_active() {
                active += 1;
            }
        }
        active
    }

    /// Close the session when still connected and drop it from the list
    pub async fn free_terminal(&self, id: &str) -> Result<(), RegistryError> {
        let terminal = self
            .terminals
            .remove(id)
            .map(|(_, terminal)| terminal)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        self.order.lock().retain(|other| other != id);

        let mut session = terminal.lock().await;
        if session.is_active() {
            if let Err(e) = session.close().await {
                warn!("Error closing session {}: {}", id, e);
            }
        }
        info!("Freed session {}, remaining: {}", id, self.count());
        Ok(())
    }

    /// Keep every opened session alive
    pub async fn idle(&self) {
        for terminal in self.terminals() {
            let mut session = terminal.lock().await;
            if session.status() != SessionStatus::Opened {
                continue;
            }
            if let Err(e) = session.idle().await {
                // fatal errors have already closed the session
                debug!("Idle failed for session {}: {}", session.id(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{test_config, test_session_data, ScriptedCallbacks, HOME};
    use super::*;
    use crate::backend::{FaultKind, MemoryBackendFactory, MemoryFs};

    fn terminal_list(fs: &Arc<parking_lot::Mutex<MemoryFs>>) -> TerminalList {
        let factory = Arc::new(MemoryBackendFactory::new(fs.clone(), HOME));
        TerminalList::new(Arc::new(test_config()), factory)
    }

    #[tokio::test]
    async fn test_counts_follow_open_and_free() {
        let fs = MemoryFs::new().shared();
        let list = terminal_list(&fs);
        let (first, session) = list
            .new_terminal(test_session_data(), ScriptedCallbacks::new())
            .unwrap();
        let (second, _) = list
            .new_terminal(test_session_data(), ScriptedCallbacks::new())
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(list.count(), 2);
        assert_eq!(list.active_count().await, 0);

        session.lock().await.open().await.unwrap();
        assert_eq!(list.active_count().await, 1);

        list.free_terminal(&first).await.unwrap();
        assert!(!session.lock().await.is_active());
        assert_eq!(list.count(), 1);
        assert_eq!(list.active_count().await, 0);
        assert!(list.get(&first).is_none());
        assert!(matches!(
            list.free_terminal(&first).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_limit() {
        let fs = MemoryFs::new().shared();
        let list = terminal_list(&fs).with_max_terminals(1);
        list.new_terminal(test_session_data(), ScriptedCallbacks::new())
            .unwrap();
        let err = list
            .new_terminal(test_session_data(), ScriptedCallbacks::new())
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::LimitReached { current: 1, max: 1 }));
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            "\"Session limit reached (1/1)\""
        );
    }

    #[tokio::test]
    async fn test_idle_skips_closed_sessions() {
        let fs = MemoryFs::new().shared();
        let list = terminal_list(&fs);
        let (_, opened) = list
            .new_terminal(test_session_data(), ScriptedCallbacks::new())
            .unwrap();
        list.new_terminal(test_session_data(), ScriptedCallbacks::new())
            .unwrap();
        opened.lock().await.open().await.unwrap();
        fs.lock().inject_fault("idle", None, FaultKind::ConnectionLost, 1);

        list.idle().await;
        assert!(!opened.lock().await.is_active());
        assert_eq!(list.terminals().len(), 2);
    }
}
