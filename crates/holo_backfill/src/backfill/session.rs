//! Session state machines and the progress registry.
//!
//! Both roles register every session under the caller-supplied id so a
//! progress query can be answered without talking to the session task.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use super::error::BackfillError;
use super::types::{Region, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackfilleeState {
    Init,
    Negotiating,
    Streaming,
    Finalized,
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackfillerState {
    AwaitingRequest,
    Diffing,
    Streaming,
    Finished,
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Backfillee,
    Backfiller,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Backfillee(BackfilleeState),
    Backfiller(BackfillerState),
}

impl SessionState {
    pub fn role(&self) -> Role {
        match self {
            SessionState::Backfillee(_) => Role::Backfillee,
            SessionState::Backfiller(_) => Role::Backfiller,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Backfillee(BackfilleeState::Finalized | BackfilleeState::Aborted)
                | SessionState::Backfiller(BackfillerState::Finished | BackfillerState::Aborted)
        )
    }

    /// Whether moving to `next` follows the state machine of this role.
    pub fn can_transition(&self, next: SessionState) -> bool {
        use BackfilleeState as E;
        use BackfillerState as R;
        match (*self, next) {
            (SessionState::Backfillee(from), SessionState::Backfillee(to)) => matches!(
                (from, to),
                (E::Init, E::Negotiating)
                    | (E::Negotiating, E::Streaming)
                    | (E::Streaming, E::Finalized)
                    | (E::Init | E::Negotiating | E::Streaming, E::Aborted)
            ),
            (SessionState::Backfiller(from), SessionState::Backfiller(to)) => matches!(
                (from, to),
                (R::AwaitingRequest, R::Diffing)
                    | (R::Diffing, R::Streaming)
                    | (R::Streaming, R::Finished)
                    | (R::AwaitingRequest | R::Diffing | R::Streaming, R::Aborted)
            ),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Backfillee(state) => write!(f, "backfillee:{state:?}"),
            SessionState::Backfiller(state) => write!(f, "backfiller:{state:?}"),
        }
    }
}

/// Answer to a progress query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionProgress {
    pub state: SessionState,
    pub sub_regions_done: u64,
    /// Known once the backfiller finished diffing, or at end of stream.
    pub sub_regions_total: Option<u64>,
}

#[derive(Clone, Debug)]
struct SessionEntry<R> {
    region: R,
    state: SessionState,
    done: u64,
    total: Option<u64>,
}

/// Process-wide table of sessions keyed by `(session id, role)`.
///
/// A replica may serve and request the same session id (loopback tests do),
/// so the role is part of the key.
pub struct SessionRegistry<R: Region> {
    sessions: RwLock<HashMap<(SessionId, Role), SessionEntry<R>>>,
}

impl<R: Region> SessionRegistry<R> {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new session. A live session with the same id and role is
    /// rejected; a terminal one is replaced.
    pub fn begin(
        &self,
        id: SessionId,
        region: R,
        initial: SessionState,
    ) -> Result<(), BackfillError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| BackfillError::DuplicateSession(id))?;
        let key = (id, initial.role());
        if let Some(existing) = sessions.get(&key) {
            if !existing.state.is_terminal() {
                return Err(BackfillError::DuplicateSession(id));
            }
        }
        sessions.insert(
            key,
            SessionEntry {
                region,
                state: initial,
                done: 0,
                total: None,
            },
        );
        Ok(())
    }

    /// Move a session to `next`. Illegal moves are logged and ignored so a
    /// late abort can never resurrect a finished session.
    pub fn transition(&self, id: SessionId, next: SessionState) {
        let Ok(mut sessions) = self.sessions.write() else {
            return;
        };
        let Some(entry) = sessions.get_mut(&(id, next.role())) else {
            tracing::warn!(session_id = %id, state = %next, "transition for unknown session");
            return;
        };
        if !entry.state.can_transition(next) {
            tracing::warn!(
                session_id = %id,
                from = %entry.state,
                to = %next,
                "ignoring illegal session transition"
            );
            return;
        }
        tracing::debug!(session_id = %id, region = %entry.region, state = %next, "session state");
        entry.state = next;
    }

    pub fn set_total(&self, id: SessionId, role: Role, total: u64) {
        if let Ok(mut sessions) = self.sessions.write() {
            if let Some(entry) = sessions.get_mut(&(id, role)) {
                entry.total = Some(total);
            }
        }
    }

    pub fn record_done(&self, id: SessionId, role: Role) {
        if let Ok(mut sessions) = self.sessions.write() {
            if let Some(entry) = sessions.get_mut(&(id, role)) {
                entry.done += 1;
            }
        }
    }

    pub fn state(&self, id: SessionId, role: Role) -> Option<SessionState> {
        let sessions = self.sessions.read().ok()?;
        sessions.get(&(id, role)).map(|entry| entry.state)
    }

    /// Progress of `id`. A local backfiller entry wins because it knows the
    /// planned piece count up front; a backfillee alone counts applied
    /// sub-pieces and learns its total at end of stream.
    pub fn progress(&self, id: SessionId) -> Option<SessionProgress> {
        let sessions = self.sessions.read().ok()?;
        let entry = sessions
            .get(&(id, Role::Backfiller))
            .or_else(|| sessions.get(&(id, Role::Backfillee)))?;
        Some(SessionProgress {
            state: entry.state,
            sub_regions_done: entry.done,
            sub_regions_total: entry.total,
        })
    }

    /// Forget terminal sessions. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let Ok(mut sessions) = self.sessions.write() else {
            return 0;
        };
        let before = sessions.len();
        sessions.retain(|_, entry| !entry.state.is_terminal());
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Region> Default for SessionRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::types::KeyRange;

    #[test]
    fn duplicate_live_session_is_rejected() {
        let registry = SessionRegistry::new();
        let id = SessionId::generate();
        let init = SessionState::Backfillee(BackfilleeState::Init);
        registry.begin(id, KeyRange::full(), init).expect("begin");
        assert!(matches!(
            registry.begin(id, KeyRange::full(), init),
            Err(BackfillError::DuplicateSession(got)) if got == id
        ));

        registry.transition(id, SessionState::Backfillee(BackfilleeState::Aborted));
        registry.begin(id, KeyRange::full(), init).expect("reuse after abort");
    }

    #[test]
    fn terminal_states_are_sticky() {
        let registry = SessionRegistry::new();
        let id = SessionId::generate();
        registry
            .begin(id, KeyRange::full(), SessionState::Backfiller(BackfillerState::AwaitingRequest))
            .expect("begin");
        for next in [
            BackfillerState::Diffing,
            BackfillerState::Streaming,
            BackfillerState::Finished,
            BackfillerState::Aborted,
        ] {
            registry.transition(id, SessionState::Backfiller(next));
        }
        assert_eq!(
            registry.state(id, Role::Backfiller),
            Some(SessionState::Backfiller(BackfillerState::Finished))
        );
    }

    #[test]
    fn progress_prefers_backfiller_entry() {
        let registry = SessionRegistry::new();
        let id = SessionId::generate();
        registry
            .begin(id, KeyRange::full(), SessionState::Backfiller(BackfillerState::AwaitingRequest))
            .expect("backfiller");
        registry
            .begin(id, KeyRange::full(), SessionState::Backfillee(BackfilleeState::Init))
            .expect("backfillee");
        registry.set_total(id, Role::Backfiller, 3);
        registry.record_done(id, Role::Backfiller);
        registry.record_done(id, Role::Backfillee);
        registry.record_done(id, Role::Backfillee);

        let progress = registry.progress(id).expect("progress");
        assert_eq!(progress.sub_regions_done, 1);
        assert_eq!(progress.sub_regions_total, Some(3));
        assert_eq!(
            progress.state,
            SessionState::Backfiller(BackfillerState::AwaitingRequest)
        );

        assert_eq!(registry.prune(), 0);
        registry.transition(id, SessionState::Backfillee(BackfilleeState::Aborted));
        assert_eq!(registry.prune(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.progress(id).map(|p| p.sub_regions_done), Some(1));
    }
}
