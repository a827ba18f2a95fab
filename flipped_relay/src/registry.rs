// Shared, lock-guarded state of the relay: the session registry and the
// frame log.
//
// - `Registry`: every currently connected session, logged in or not. Adding,
//   removing and iterating for a broadcast all happen under its lock.
// - `FrameLog`: append-only, ordered list of encoded `Frame` messages from
//   the player. Entries are never removed or reordered.
//
// Lock order: Registry before FrameLog, everywhere both are held. The order
// is enforced by the types: the only operation needing both locks,
// `FrameLog::replay_to`, takes a `&RegistryGuard` and so can only be called
// by code already holding the registry lock. `FrameLog::append` takes the log
// lock alone and holds nothing while doing so.
//
// Poisoned locks are recovered rather than propagated; neither structure can
// be left half-updated by a panic between statements.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flipped_protocol::{CodecError, SessionId};

use crate::session::Session;

/// Set of all connected sessions.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<Vec<Arc<Session>>>,
}

/// Proof that the registry lock is held, with access to its sessions.
pub struct RegistryGuard<'a> {
    sessions: MutexGuard<'a, Vec<Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the registry lock.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            sessions: self.sessions.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn add(&self, session: Arc<Session>) {
        self.lock().add(session);
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        std::mem::take(&mut *self.lock().sessions)
    }
}

impl RegistryGuard<'_> {
    pub fn add(&mut self, session: Arc<Session>) {
        debug_assert!(
            self.find(session.id()).is_none(),
            "session ids must be unique"
        );
        self.sessions.push(session);
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Arc<Session>> {
        let index = self.sessions.iter().position(|s| s.id() == id)?;
        Some(self.sessions.remove(index))
    }

    pub fn find(&self, id: SessionId) -> Option<&Arc<Session>> {
        self.sessions.iter().find(|s| s.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.sessions.iter()
    }

    /// Sessions that take part in broadcasts.
    pub fn logged_in(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.sessions.iter().filter(|s| s.logged_in())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Ordered, append-only log of encoded frame messages.
#[derive(Default)]
pub struct FrameLog {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl FrameLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one encoded frame. Returns the new log length.
    pub fn append(&self, frame: Vec<u8>) -> usize {
        let mut frames = self.lock();
        frames.push(frame);
        frames.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `session` every entry after its cursor, in log order, advancing
    /// the cursor after each successful send. Returns how many entries were
    /// sent. On a send failure the cursor stays on the last delivered entry
    /// and the error is returned; nothing after the failed entry is sent.
    pub fn replay_to(
        &self,
        _registry: &RegistryGuard<'_>,
        session: &Session,
    ) -> Result<usize, CodecError> {
        let frames = self.lock();
        let start = usize::try_from(session.position() + 1).unwrap_or(0);
        let mut sent = 0;
        for (index, frame) in frames.iter().enumerate().skip(start) {
            log::debug!(
                "updating session {} with frame #{}",
                session.id(),
                index + 1
            );
            session.send_encoded(frame)?;
            session.record_delivery(index);
            sent += 1;
        }
        Ok(sent)
    }
}
