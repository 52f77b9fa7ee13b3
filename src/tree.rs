//! Session tree bookkeeping
//!
//! An arena of session records keyed by id. Parent/child relationships are
//! stored as id references, never owning pointers, which keeps cancellation
//! sweeps simple and the tree acyclic by construction.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::protocol::{SessionId, SessionState, SessionTreeView};
use crate::session::SessionHandle;

/// Arena of live session records
pub struct SessionTree {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    root: RwLock<Option<SessionId>>,
}

impl SessionTree {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            root: RwLock::new(None),
        }
    }

    /// Register a session record
    pub fn insert(&self, handle: SessionHandle) {
        if handle.parent_id.is_none() {
            *self.root.write() = Some(handle.id);
        }
        self.sessions.write().insert(handle.id, handle);
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.read().get(id).cloned()
    }

    pub fn root(&self) -> Option<SessionId> {
        *self.root.read()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Direct children of a session, in spawn order
    pub fn children_of(&self, id: &SessionId) -> Vec<SessionId> {
        self.get(id).map(|s| s.children()).unwrap_or_default()
    }

    /// All descendants of a session, preorder, excluding the session itself
    pub fn descendants(&self, id: &SessionId) -> Vec<SessionId> {
        let mut collected = Vec::new();
        let mut stack = self.children_of(id);
        stack.reverse();
        while let Some(next) = stack.pop() {
            collected.push(next);
            let mut grandchildren = self.children_of(&next);
            grandchildren.reverse();
            stack.extend(grandchildren);
        }
        collected
    }

    /// Request cancellation of a session and its whole subtree
    ///
    /// Best-effort and idempotent. Running sessions unwind cooperatively
    /// through their cancellation tokens; sessions that never started are
    /// marked `Cancelled` immediately.
    pub fn cancel_subtree(&self, id: &SessionId) {
        let Some(session) = self.get(id) else {
            return;
        };

        debug!(session_id = %id, "Cancelling subtree");
        session.request_cancel();
        if session.state() == SessionState::Created {
            session.try_transition(SessionState::Cancelled);
        }

        for descendant_id in self.descendants(id) {
            if let Some(descendant) = self.get(&descendant_id) {
                descendant.request_cancel();
                if descendant.state() == SessionState::Created {
                    descendant.try_transition(SessionState::Cancelled);
                }
            }
        }
    }

    /// Remove a session and its descendants from the arena
    ///
    /// Called once a subtree is terminal and its result has been consumed;
    /// the records become eligible for reclamation.
    pub fn remove_subtree(&self, id: &SessionId) {
        let descendants = self.descendants(id);
        let removed = {
            let mut sessions = self.sessions.write();
            for descendant_id in &descendants {
                sessions.remove(descendant_id);
            }
            sessions.remove(id)
        };

        if let Some(session) = removed {
            if let Some(parent_id) = session.parent_id {
                if let Some(parent) = self.get(&parent_id) {
                    parent.remove_child(id);
                }
            }
        }

        if self.root() == Some(*id) {
            *self.root.write() = None;
        }
    }

    /// Serializable snapshot of the live tree, rooted at the root session
    pub fn snapshot(&self) -> Option<SessionTreeView> {
        self.root().and_then(|id| self.view_of(&id))
    }

    /// Serializable snapshot of one subtree
    pub fn view_of(&self, id: &SessionId) -> Option<SessionTreeView> {
        let session = self.get(id)?;
        let children = session
            .children()
            .iter()
            .filter_map(|child_id| self.view_of(child_id))
            .collect();
        Some(SessionTreeView {
            session_id: session.id,
            category: session.category,
            depth: session.depth,
            state: session.state(),
            children,
        })
    }
}

impl Default for SessionTree {
    fn default() -> Self {
        Self::new()
    }
}
