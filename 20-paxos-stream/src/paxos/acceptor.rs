//! Acceptor state for the phase 1 and phase 2 handlers.

use std::sync::{Mutex, PoisonError};

use tracing::debug;

use super::{AcceptMessage, Promise};

#[derive(Debug, Default)]
struct AcceptorState {
    promised: Option<u64>,
    accepted: Option<AcceptMessage>,
}

/// Promised number and last accepted message, shared by all connections.
///
/// The promised number only ever grows over the acceptor's lifetime, across
/// every slot. The accepted message is cleared once its slot is learned.
#[derive(Debug, Default)]
pub struct Acceptor {
    state: Mutex<AcceptorState>,
}

impl Acceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase 1: promise to ignore proposals numbered below `n`.
    ///
    /// Refuses when `n` does not exceed the current promise, naming that
    /// promise. The highest accepted message is returned either way so a
    /// proposer can adopt it.
    pub fn prepare(&self, n: u64) -> Promise {
        let mut state = self.lock();
        let accepted = state.accepted.clone();
        match state.promised {
            Some(current) if n <= current => {
                debug!(n, current, "prepare refused");
                Promise::refused(current, accepted)
            }
            _ => {
                state.promised = Some(n);
                debug!(n, "promised");
                Promise::granted(accepted)
            }
        }
    }

    /// Phase 2: accept `(n, id, v)` unless a higher number was promised.
    ///
    /// A refused accept leaves the state untouched.
    pub fn accept(&self, n: u64, v: &str, id: &str) -> bool {
        let mut state = self.lock();
        if state.promised.is_some_and(|current| n < current) {
            debug!(n, id, "accept refused");
            return false;
        }
        state.promised = Some(n);
        state.accepted = Some(AcceptMessage::new(n, id, v));
        debug!(n, id, "accepted");
        true
    }

    /// Forgets the accepted message with identity `id` after its slot has
    /// been learned.
    pub fn set(&self, id: &str) {
        self.forget(|accepted| accepted.id == id);
    }

    /// Clears the accepted message if `obsolete` says so.
    pub fn forget(&self, obsolete: impl FnOnce(&AcceptMessage) -> bool) {
        let mut state = self.lock();
        if state.accepted.as_ref().is_some_and(obsolete) {
            state.accepted = None;
        }
    }

    pub fn promised(&self) -> Option<u64> {
        self.lock().promised
    }

    pub fn accepted(&self) -> Option<AcceptMessage> {
        self.lock().accepted.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AcceptorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
