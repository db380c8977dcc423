// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! User-identity capability consumed by the engine
//!
//! Credential storage and login handshakes live in the connection layer; the
//! engine only asks "who is acting on this session". [`SessionUsers`] is the
//! plain in-memory implementation that layer registers identities with.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{FsError, FsResult};
use crate::types::{SessionId, User};

/// Source of the acting user identity for a session
#[cfg_attr(test, mockall::automock)]
pub trait UserSource: Send + Sync {
    /// The user currently bound to `session`, or `None` if nobody is logged in
    fn current_user(&self, session: SessionId) -> Option<User>;
}

/// Resolve the acting user or fail the operation
pub(crate) fn require_user(source: &dyn UserSource, session: SessionId) -> FsResult<User> {
    source.current_user(session).ok_or(FsError::NotLoggedIn)
}

/// Session-keyed identity registry
pub struct SessionUsers {
    sessions: RwLock<HashMap<SessionId, User>>,
    next_session_id: AtomicU64,
}

impl SessionUsers {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Bind `user` to a fresh session
    pub fn login(&self, user: User) -> SessionId {
        let session = SessionId::new(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.write().insert(session, user);
        session
    }

    /// Drop the identity bound to `session`
    pub fn logout(&self, session: SessionId) {
        self.sessions.write().remove(&session);
    }
}

impl Default for SessionUsers {
    fn default() -> Self {
        Self::new()
    }
}

impl UserSource for SessionUsers {
    fn current_user(&self, session: SessionId) -> Option<User> {
        self.sessions.read().get(&session).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn login_binds_user_to_session() {
        let users = SessionUsers::new();
        let session = users.login(User::new("cpark", Role::User));
        let user = users.current_user(session).expect("user should be logged in");
        assert_eq!(user.id.as_str(), "cpark");
        assert_eq!(user.role, Role::User);
    }

    #[test]
    fn logout_clears_session() {
        let users = SessionUsers::new();
        let session = users.login(User::new("cpark", Role::User));
        users.logout(session);
        assert!(users.current_user(session).is_none());
    }

    #[test]
    fn sessions_are_independent() {
        let users = SessionUsers::new();
        let a = users.login(User::new("alice", Role::Admin));
        let b = users.login(User::new("bob", Role::Guest));
        assert_ne!(a, b);
        assert_eq!(users.current_user(a).unwrap().id.as_str(), "alice");
        assert_eq!(users.current_user(b).unwrap().id.as_str(), "bob");
    }
}
