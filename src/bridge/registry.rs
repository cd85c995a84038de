//! Process-wide session registry
//!
//! Holds a handle (event sender) per live session, never the session
//! itself. Anything that needs to touch another session sends it an event
//! and lets that session's own loop do the work.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;

use super::SessionEvent;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Maximum sessions exceeded (limit: {0})")]
    Full(usize),

    #[error("Session already registered: id={0}")]
    Duplicate(u64),
}

/// Sender side of a session's event queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub display_name: String,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn new(id: u64, display_name: String, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { id, display_name, tx }
    }

    /// Queue `event` for the session's loop. False if the loop is gone.
    pub fn execute(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, SessionHandle>>,
    /// Emote pieces seen from any online player
    emotes: RwLock<HashSet<String>>,
    limit: usize,
}

impl SessionRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            emotes: RwLock::new(HashSet::new()),
            limit,
        }
    }

    pub fn insert(&self, handle: SessionHandle) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.len() >= self.limit {
            return Err(RegistryError::Full(self.limit));
        }
        if sessions.contains_key(&handle.id) {
            return Err(RegistryError::Duplicate(handle.id));
        }
        sessions.insert(handle.id, handle);
        Ok(())
    }

    /// Returns true if the session was present
    pub fn remove(&self, id: u64) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(&id).is_some()
    }

    pub fn get(&self, id: u64) -> Option<SessionHandle> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.limit
    }

    /// Snapshot of all handles; the lock is not held while events are sent
    pub fn handles(&self) -> Vec<SessionHandle> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.values().cloned().collect()
    }

    /// Merge `pieces` into the shared set and tell every other session.
    ///
    /// Each target decides for itself which pieces are new to it.
    pub fn broadcast_emotes(&self, from: u64, pieces: &[String]) -> usize {
        {
            let mut emotes = self.emotes.write().unwrap_or_else(PoisonError::into_inner);
            emotes.extend(pieces.iter().cloned());
        }

        let mut notified = 0;
        for handle in self.handles() {
            if handle.id == from {
                continue;
            }
            if handle.execute(SessionEvent::Emotes(pieces.to_vec())) {
                notified += 1;
            }
        }
        notified
    }

    /// Every emote piece seen so far
    pub fn known_emotes(&self) -> Vec<String> {
        let emotes = self.emotes.read().unwrap_or_else(PoisonError::into_inner);
        emotes.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: u64) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionHandle::new(id, format!("player{}", id), tx), rx)
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = SessionRegistry::new(4);
        let (h, _rx) = handle(1);
        registry.insert(h).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(1).is_some());
        assert!(registry.remove(1));
        assert!(!registry.remove(1));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_limit_enforced() {
        let registry = SessionRegistry::new(1);
        let (a, _ra) = handle(1);
        let (b, _rb) = handle(2);
        registry.insert(a).unwrap();
        assert!(matches!(registry.insert(b), Err(RegistryError::Full(1))));
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = SessionRegistry::new(4);
        let (a, _ra) = handle(1);
        let (b, _rb) = handle(1);
        registry.insert(a).unwrap();
        assert!(matches!(registry.insert(b), Err(RegistryError::Duplicate(1))));
    }

    #[test]
    fn test_emote_broadcast_skips_sender() {
        let registry = SessionRegistry::new(4);
        let (a, mut ra) = handle(1);
        let (b, mut rb) = handle(2);
        registry.insert(a).unwrap();
        registry.insert(b).unwrap();

        let notified = registry.broadcast_emotes(1, &["wave".to_string()]);
        assert_eq!(notified, 1);
        assert!(ra.try_recv().is_err());
        match rb.try_recv().unwrap() {
            SessionEvent::Emotes(pieces) => assert_eq!(pieces, vec!["wave".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(registry.known_emotes(), vec!["wave".to_string()]);
    }
}
