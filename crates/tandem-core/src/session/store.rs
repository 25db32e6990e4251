use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::state::{ChatMessage, MessageRole, Session, SessionId};

/// Durable form of the whole store: the de-duplicated session list plus the
/// current-session pointer, written as one unit by the persistence manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub sessions: Vec<Session>,
    pub current: SessionId,
}

/// Owns the session collection, the current-session pointer, and the
/// per-session live message buffers.
///
/// The live buffer is the authoritative copy of a session's content between
/// debounced saves; the durable record trails it. `live_base` tracks where
/// each live buffer starts inside the durable message list so that syncing
/// never loses older history that was not eagerly rehydrated.
pub struct SessionStore {
    sessions: Vec<Session>,
    current: SessionId,
    live: HashMap<SessionId, Vec<ChatMessage>>,
    live_base: HashMap<SessionId, usize>,
    rehydrate_window: usize,
    live_cap: usize,
}

/// Result of a delete: whether a record was removed, and the replacement
/// current session if the visible one was deleted.
pub struct DeleteOutcome {
    pub removed: bool,
    pub new_current: Option<SessionId>,
}

impl SessionStore {
    pub fn new(rehydrate_window: usize, live_cap: usize) -> Self {
        let session = Session::new();
        let current = session.id;
        let mut store = Self {
            sessions: vec![session],
            current,
            live: HashMap::new(),
            live_base: HashMap::new(),
            rehydrate_window,
            live_cap,
        };
        store.live.insert(current, Vec::new());
        store.live_base.insert(current, 0);
        store
    }

    /// Restore from a durable snapshot, falling back to a fresh session when
    /// the snapshot is empty or its current pointer is stale.
    pub fn from_snapshot(
        snapshot: StoreSnapshot,
        rehydrate_window: usize,
        live_cap: usize,
    ) -> Self {
        let mut store = Self {
            sessions: snapshot.sessions,
            current: snapshot.current,
            live: HashMap::new(),
            live_base: HashMap::new(),
            rehydrate_window,
            live_cap,
        };
        store.dedup();

        if !store.sessions.iter().any(|s| s.id == store.current) {
            match store.sessions.first() {
                Some(first) => store.current = first.id,
                None => {
                    let session = Session::new();
                    store.current = session.id;
                    store.sessions.push(session);
                }
            }
        }
        store.rehydrate(store.current);
        store
    }

    pub fn current_id(&self) -> SessionId {
        self.current
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.id).collect()
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.get(id).is_some()
    }

    /// Insert-or-update keyed by id. De-duplication keeps the first
    /// occurrence, protecting against interleaved debounced and direct
    /// saves racing each other.
    pub fn upsert(&mut self, session: Session) {
        match self.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => self.sessions.push(session),
        }
        self.dedup();
    }

    fn dedup(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.sessions.retain(|s| seen.insert(s.id));
    }

    /// Insert an empty placeholder record so the session appears in any
    /// listing before the first agent token arrives. Idempotent on id.
    pub fn ensure_session(&mut self, id: SessionId) {
        if !self.contains(id) {
            let mut session = Session::new();
            session.id = id;
            self.sessions.push(session);
        }
    }

    /// Create a fresh session and make it current. The outgoing session is
    /// synced first so no unsaved state is lost.
    pub fn create(&mut self, linked_task_id: Option<String>) -> SessionId {
        self.sync_live(self.current);
        let session = match linked_task_id {
            Some(task) => Session::for_task(task),
            None => Session::new(),
        };
        let id = session.id;
        self.sessions.push(session);
        self.live.insert(id, Vec::new());
        self.live_base.insert(id, 0);
        self.current = id;
        id
    }

    /// Live view of a session's messages: the buffer if present, otherwise
    /// the durable record.
    pub fn live_messages(&self, id: SessionId) -> Vec<ChatMessage> {
        match self.live.get(&id) {
            Some(buffer) => buffer.clone(),
            None => self.get(id).map(|s| s.messages.clone()).unwrap_or_default(),
        }
    }

    /// Complete history: durable prefix plus the live suffix.
    pub fn full_history(&self, id: SessionId) -> Option<Vec<ChatMessage>> {
        let session = self.get(id)?;
        match (self.live.get(&id), self.live_base.get(&id)) {
            (Some(buffer), Some(&base)) => {
                let mut all: Vec<ChatMessage> =
                    session.messages.iter().take(base).cloned().collect();
                all.extend(buffer.iter().cloned());
                Some(all)
            }
            _ => Some(session.messages.clone()),
        }
    }

    /// Append to the live buffer, rehydrating it on demand. Enforces the
    /// live cap: overflowing entries are synced into the durable record
    /// before the oldest live entries are dropped.
    pub fn append_live(&mut self, id: SessionId, message: ChatMessage) {
        self.ensure_session(id);
        self.ensure_live(id);

        let derive = matches!(message.role, MessageRole::User);
        if let Some(buffer) = self.live.get_mut(&id) {
            buffer.push(message);
        }

        if derive && self.get(id).is_some_and(|s| s.title.is_empty()) {
            let first_user = self
                .live
                .get(&id)
                .and_then(|b| b.iter().find(|m| m.role == MessageRole::User))
                .map(|m| m.content.clone());
            if let (Some(text), Some(session)) = (first_user, self.get_mut(id)) {
                session.title = Session::derive_title(&text);
            }
        }

        self.enforce_live_cap(id);
    }

    fn enforce_live_cap(&mut self, id: SessionId) {
        let over = self
            .live
            .get(&id)
            .map(|b| b.len().saturating_sub(self.live_cap))
            .unwrap_or(0);
        if over == 0 {
            return;
        }

        self.sync_live(id);
        if let (Some(buffer), Some(base)) = (self.live.get_mut(&id), self.live_base.get_mut(&id)) {
            buffer.drain(..over);
            *base += over;
        }
    }

    /// Materialize a live buffer from the durable record, eagerly loading
    /// only the most recent window; older history stays on the record and
    /// is served by `full_history`.
    fn ensure_live(&mut self, id: SessionId) {
        if self.live.contains_key(&id) {
            return;
        }
        self.rehydrate(id);
    }

    fn rehydrate(&mut self, id: SessionId) {
        let Some(session) = self.get(id) else {
            return;
        };
        let base = session.messages.len().saturating_sub(self.rehydrate_window);
        let window: Vec<ChatMessage> = session.messages[base..].to_vec();
        debug!(session_id = %id, window = window.len(), base, "rehydrated session buffer");
        self.live.insert(id, window);
        self.live_base.insert(id, base);
    }

    /// Fold the live buffer back into the durable record.
    pub fn sync_live(&mut self, id: SessionId) {
        let (Some(buffer), Some(&base)) = (self.live.get(&id), self.live_base.get(&id)) else {
            return;
        };
        let buffer = buffer.clone();
        let Some(session) = self.get_mut(id) else {
            return;
        };
        session.messages.truncate(base);
        session.messages.extend(buffer);
    }

    /// Drop the in-RAM buffer for a session (eviction). The durable record
    /// is synced first, so rehydration on next access loses nothing.
    pub fn drop_live(&mut self, id: SessionId) {
        self.sync_live(id);
        self.live.remove(&id);
        self.live_base.remove(&id);
    }

    pub fn has_live(&self, id: SessionId) -> bool {
        self.live.contains_key(&id)
    }

    /// Switch the current pointer: the outgoing session is synced before
    /// the incoming one is loaded, so a switch never loses writes.
    pub fn switch_to(&mut self, id: SessionId) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.sync_live(self.current);
        self.current = id;
        self.ensure_live(id);
        if let Some(session) = self.get_mut(id) {
            session.unread = false;
        }
        true
    }

    pub fn delete(&mut self, id: SessionId) -> DeleteOutcome {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != id);
        self.live.remove(&id);
        self.live_base.remove(&id);
        let removed = self.sessions.len() != before;

        let new_current = if id == self.current {
            let fresh = Session::new();
            let fresh_id = fresh.id;
            self.sessions.push(fresh);
            self.live.insert(fresh_id, Vec::new());
            self.live_base.insert(fresh_id, 0);
            self.current = fresh_id;
            Some(fresh_id)
        } else {
            None
        };

        DeleteOutcome {
            removed,
            new_current,
        }
    }

    /// Sync every live buffer and return the durable snapshot.
    pub fn snapshot(&mut self) -> StoreSnapshot {
        let ids: Vec<SessionId> = self.live.keys().copied().collect();
        for id in ids {
            self.sync_live(id);
        }
        self.dedup();
        StoreSnapshot {
            sessions: self.sessions.clone(),
            current: self.current,
        }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(50, 200)
    }

    #[test]
    fn test_new_store_has_one_current_session() {
        let store = store();
        assert_eq!(store.sessions().len(), 1);
        assert!(store.contains(store.current_id()));
    }

    #[test]
    fn test_upsert_never_duplicates_id() {
        let mut store = store();
        let id = store.current_id();
        let mut record = store.get(id).cloned().unwrap();
        record.title = "updated".to_string();
        store.upsert(record.clone());
        store.upsert(record);
        assert_eq!(store.sessions().len(), 1);
        assert_eq!(store.get(id).unwrap().title, "updated");
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let mut store = store();
        let id = store.current_id();
        let mut stale = store.get(id).cloned().unwrap();
        stale.title = "stale".to_string();
        // Simulate a race where a second record with the same id slipped in
        // behind the store's back.
        store.sessions.push(stale);
        store.dedup();
        assert_eq!(store.sessions().len(), 1);
        assert_ne!(store.get(id).unwrap().title, "stale");
    }

    #[test]
    fn test_switch_preserves_unsaved_messages() {
        let mut store = store();
        let a = store.current_id();
        store.append_live(a, ChatMessage::user("first"));
        store.append_live(a, ChatMessage::user("second"));

        let b = store.create(None);
        assert_eq!(store.current_id(), b);

        assert!(store.switch_to(a));
        let messages = store.live_messages(a);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].content, "second");
    }

    #[test]
    fn test_switch_to_unknown_session_is_rejected() {
        let mut store = store();
        assert!(!store.switch_to(SessionId::new()));
    }

    #[test]
    fn test_title_derived_from_first_user_message() {
        let mut store = store();
        let id = store.current_id();
        store.append_live(id, ChatMessage::user("what is the weather in antwerp today?"));
        store.append_live(id, ChatMessage::user("second message"));
        assert_eq!(
            store.get(id).unwrap().title,
            "what is the weather in antwerp today?"
        );
    }

    #[test]
    fn test_live_cap_retains_most_recent_in_order() {
        let mut store = SessionStore::new(50, 100);
        let id = store.current_id();
        for i in 0..200 {
            store.append_live(id, ChatMessage::user(format!("msg {i}")));
        }

        let live = store.live_messages(id);
        assert_eq!(live.len(), 100);
        assert_eq!(live[0].content, "msg 100");
        assert_eq!(live[99].content, "msg 199");

        // Overflowed entries stay in the durable history.
        let full = store.full_history(id).unwrap();
        assert_eq!(full.len(), 200);
        assert_eq!(full[0].content, "msg 0");
    }

    #[test]
    fn test_rehydration_is_bounded() {
        let mut store = SessionStore::new(10, 200);
        let a = store.current_id();
        for i in 0..50 {
            store.append_live(a, ChatMessage::user(format!("msg {i}")));
        }
        let b = store.create(None);

        // Drop A's buffer as eviction would, then switch back.
        store.drop_live(a);
        assert!(!store.has_live(a));
        assert!(store.switch_to(a));

        let live = store.live_messages(a);
        assert_eq!(live.len(), 10);
        assert_eq!(live[0].content, "msg 40");

        let full = store.full_history(a).unwrap();
        assert_eq!(full.len(), 50);
        assert_eq!(store.current_id(), a);
        let _ = b;
    }

    #[test]
    fn test_delete_current_creates_fresh_session() {
        let mut store = store();
        let doomed = store.current_id();
        let outcome = store.delete(doomed);
        assert!(outcome.removed);
        let fresh = outcome.new_current.unwrap();
        assert_eq!(store.current_id(), fresh);
        assert!(store.contains(fresh));
        assert!(!store.contains(doomed));
    }

    #[test]
    fn test_delete_background_session_keeps_current() {
        let mut store = store();
        let a = store.current_id();
        let b = store.create(None);
        assert!(store.switch_to(a));
        let outcome = store.delete(b);
        assert!(outcome.removed);
        assert!(outcome.new_current.is_none());
        assert_eq!(store.current_id(), a);
    }

    #[test]
    fn test_snapshot_round_trip_restores_messages() {
        let mut store = store();
        let id = store.current_id();
        store.append_live(id, ChatMessage::user("persist me"));
        let snapshot = store.snapshot();

        let restored = SessionStore::from_snapshot(snapshot, 50, 200);
        assert_eq!(restored.current_id(), id);
        let messages = restored.live_messages(id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "persist me");
    }

    #[test]
    fn test_snapshot_with_stale_current_falls_back() {
        let mut store = store();
        let id = store.current_id();
        store.append_live(id, ChatMessage::user("hold"));
        let mut snapshot = store.snapshot();
        snapshot.current = SessionId::new();

        let restored = SessionStore::from_snapshot(snapshot, 50, 200);
        assert_eq!(restored.current_id(), id);
    }

    #[test]
    fn test_ensure_session_inserts_placeholder_once() {
        let mut store = store();
        let id = SessionId::new();
        store.ensure_session(id);
        store.ensure_session(id);
        assert_eq!(store.sessions().len(), 2);
        assert!(store.get(id).unwrap().messages.is_empty());
    }
}
