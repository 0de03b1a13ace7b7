//! Shared registry of joined sessions.
//!
//! Provides a thread-safe table with:
//! - One entry per joined session, keyed by `SessionId`
//! - Insertion (join) order preserved for listing and fan-out
//! - Snapshots that callers iterate without holding the lock
//!
//! The lock is only ever held for the in-memory operation itself. Nothing in
//! this module awaits, so a `std::sync::Mutex` is enough.

use crate::session::{Peer, SessionId};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// A joined session as seen by the registry
#[derive(Debug, Clone)]
pub struct Member {
    pub nickname: String,
    pub peer: Peer,
}

impl Member {
    pub fn id(&self) -> SessionId {
        self.peer.id()
    }
}

/// Registry errors reported back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Nickname was empty after trimming
    EmptyNickname,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::EmptyNickname => write!(f, "nickname required"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Thread-safe table of joined sessions
#[derive(Default)]
pub struct Registry {
    members: Mutex<Vec<Member>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Member>> {
        // A panic elsewhere must not take the whole chat down with it
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `peer` under `nickname`.
    ///
    /// Re-registering an already joined session replaces its nickname and
    /// keeps its position. Duplicate nicknames across sessions are allowed.
    /// Returns the stored, trimmed nickname.
    pub fn register(&self, peer: &Peer, nickname: &str) -> Result<String, RegistryError> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            return Err(RegistryError::EmptyNickname);
        }

        let mut members = self.lock();
        match members.iter_mut().find(|m| m.id() == peer.id()) {
            Some(existing) => {
                debug!(
                    session = %peer.id(),
                    old = %existing.nickname,
                    new = %nickname,
                    "Nickname changed"
                );
                existing.nickname = nickname.to_string();
            }
            None => {
                members.push(Member {
                    nickname: nickname.to_string(),
                    peer: peer.clone(),
                });
                info!(session = %peer.id(), nickname, online = members.len(), "User joined");
            }
        }

        Ok(nickname.to_string())
    }

    /// Remove a session. Returns its nickname if it was registered.
    pub fn unregister(&self, id: SessionId) -> Option<String> {
        let mut members = self.lock();
        let pos = members.iter().position(|m| m.id() == id)?;
        let removed = members.remove(pos);
        info!(session = %id, nickname = %removed.nickname, online = members.len(), "User left");
        Some(removed.nickname)
    }

    /// Copy of every entry in join order
    pub fn snapshot_all(&self) -> Vec<Member> {
        self.lock().clone()
    }

    /// Nickname of a session, or `None` if it is not registered
    pub fn nickname_of(&self, id: SessionId) -> Option<String> {
        self.lock()
            .iter()
            .find(|m| m.id() == id)
            .map(|m| m.nickname.clone())
    }

    /// Nicknames in join order
    pub fn nicknames(&self) -> Vec<String> {
        self.lock().iter().map(|m| m.nickname.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
