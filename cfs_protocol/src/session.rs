//! Replication session state machine.
//!
//! A session walks a fixed graph of states; a transition is legal only
//! if the current state appears in the target's declared predecessor
//! set and the target appears in the current state's declared successor
//! set. Illegal transitions fail without mutating the session, and a
//! history of transitions supports reverting the most recent one.

use crate::error::{ProtocolError, ProtocolResult};

/// Session states. The numeric codes are part of the wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Null,
    Unknown,
    Intermediate,
    Close,
    Connect,
    ConnectAck,
    ConnectError,
    Auth,
    AuthDeny,
    AuthAccept,
    StreamProbe,
    StreamAck,
    StreamPull,
    StreamAcq,
    StreamNew,
    StreamDel,
    EInternal,
    EUnknown,
    EConnect,
    EStream,
    EAuth,
}

use SessionState::*;

impl SessionState {
    pub const fn code(self) -> u8 {
        match self {
            Null => 0x00,
            Unknown => 0x01,
            Intermediate => 0x03,
            Close => 0x04,
            Connect => 0xA0,
            ConnectAck => 0xA2,
            ConnectError => 0xA3,
            Auth => 0xB0,
            AuthDeny => 0xB1,
            AuthAccept => 0xB2,
            StreamProbe => 0xC0,
            StreamAck => 0xC1,
            StreamPull => 0xC2,
            StreamAcq => 0xC3,
            StreamNew => 0xC4,
            StreamDel => 0xC5,
            EInternal => 0xE0,
            EUnknown => 0xE1,
            EConnect => 0xE2,
            EStream => 0xE3,
            EAuth => 0xE4,
        }
    }

    /// Decodes a wire state code; anything unrecognized is `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Null,
            0x03 => Intermediate,
            0x04 => Close,
            0xA0 => Connect,
            0xA2 => ConnectAck,
            0xA3 => ConnectError,
            0xB0 => Auth,
            0xB1 => AuthDeny,
            0xB2 => AuthAccept,
            0xC0 => StreamProbe,
            0xC1 => StreamAck,
            0xC2 => StreamPull,
            0xC3 => StreamAcq,
            0xC4 => StreamNew,
            0xC5 => StreamDel,
            0xE0 => EInternal,
            0xE1 => EUnknown,
            0xE2 => EConnect,
            0xE3 => EStream,
            0xE4 => EAuth,
            _ => Unknown,
        }
    }

    /// Declared `(predecessors, successors)` of a state. A set of
    /// exactly `[Unknown]` is a wildcard matched by any state.
    fn edges(self) -> (&'static [SessionState], &'static [SessionState]) {
        match self {
            Intermediate => (&[Unknown], &[Connect]),
            Connect => (&[Intermediate], &[ConnectAck, Close, EConnect]),
            ConnectAck => (&[Connect], &[Auth, Close, EConnect]),
            Auth => (&[ConnectAck], &[AuthAccept, AuthDeny, Close, EAuth]),
            AuthDeny => (&[Auth], &[EAuth, Close]),
            AuthAccept => (&[Auth], &[EAuth, Close, StreamProbe]),
            Close => (&[Unknown], &[Null, Intermediate]),
            StreamProbe => (&[AuthAccept], &[StreamAck, Close]),
            StreamAck => (&[StreamProbe], &[StreamPull, Close]),
            StreamPull => (&[StreamAck], &[StreamAcq, Close]),
            StreamAcq => (&[StreamPull], &[Close]),
            StreamNew => (&[AuthAccept], &[Close]),
            StreamDel => (&[AuthAccept], &[Close]),
            EInternal | EUnknown | EConnect | EStream | EAuth => (&[Unknown], &[Null]),
            Null | Unknown | ConnectError => (&[Unknown], &[Unknown]),
        }
    }
}

/// A set of exactly `[Unknown]` is a wildcard: `Close` and the error
/// states accept any predecessor.
fn allows(set: &[SessionState], state: SessionState) -> bool {
    set == [Unknown] || set.contains(&state)
}

/// One recorded transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub previous: SessionState,
    pub current: SessionState,
    pub version: u64,
}

/// State, monotonic version counter, and transition history of one
/// protocol session.
#[derive(Clone, Debug)]
pub struct Session {
    state: SessionState,
    version: u64,
    history: Vec<HistoryEntry>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A fresh session on an established connection.
    pub fn new() -> Self {
        Self {
            state: Intermediate,
            version: 1,
            history: vec![HistoryEntry {
                previous: Unknown,
                current: Intermediate,
                version: 1,
            }],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Transitions to `target`, validating the edge in both directions.
    /// On failure the state, version, and history are untouched.
    pub fn set_state(&mut self, target: SessionState) -> ProtocolResult<()> {
        let current = self.state;
        let (target_prev, _) = target.edges();
        let (_, current_next) = current.edges();
        if !allows(target_prev, current) || !allows(current_next, target) {
            return Err(ProtocolError::InvalidState { current, target });
        }
        self.version += 1;
        self.history.push(HistoryEntry {
            previous: current,
            current: target,
            version: self.version,
        });
        self.state = target;
        Ok(())
    }

    /// Undoes the most recent transition, restoring the previous state.
    /// The initial entry is never popped.
    pub fn revert(&mut self) -> SessionState {
        if self.history.len() > 1
            && let Some(entry) = self.history.pop()
        {
            self.state = entry.previous;
            self.version -= 1;
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_client_chain_is_legal() {
        let mut session = Session::new();
        for state in [
            Connect, ConnectAck, Auth, AuthAccept, StreamProbe, StreamAck, StreamPull, StreamAcq,
        ] {
            session.set_state(state).unwrap();
        }
        assert_eq!(session.state(), StreamAcq);
        assert_eq!(session.version(), 9);
        assert_eq!(session.history().len(), 9);
    }

    #[test]
    fn illegal_edge_leaves_session_unchanged() {
        let mut session = Session::new();
        session.set_state(Connect).unwrap();

        let before_version = session.version();
        let before_history = session.history().len();
        let err = session.set_state(Auth).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidState {
                current: Connect,
                target: Auth
            }
        ));
        assert_eq!(session.state(), Connect);
        assert_eq!(session.version(), before_version);
        assert_eq!(session.history().len(), before_history);

        // Skipping the stream probe is also illegal.
        session.set_state(ConnectAck).unwrap();
        session.set_state(Auth).unwrap();
        session.set_state(AuthAccept).unwrap();
        assert!(session.set_state(StreamPull).is_err());
        assert_eq!(session.state(), AuthAccept);
    }

    #[test]
    fn fresh_session_only_admits_connect() {
        let mut session = Session::new();
        for target in [ConnectAck, Auth, AuthAccept, StreamProbe, StreamPull, StreamAcq] {
            let err = session.set_state(target).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidState { .. }), "{target:?}");
            assert_eq!(session.state(), Intermediate);
            assert_eq!(session.version(), 1);
        }
        session.set_state(Connect).unwrap();
    }

    #[test]
    fn deny_after_expected_accept_via_revert() {
        let mut session = Session::new();
        session.set_state(Connect).unwrap();
        session.set_state(ConnectAck).unwrap();
        session.set_state(Auth).unwrap();
        // Client optimistically moved to ACCEPT but the wire said DENY.
        session.set_state(AuthAccept).unwrap();
        assert_eq!(session.revert(), Auth);
        session.set_state(AuthDeny).unwrap();
        assert_eq!(session.state(), AuthDeny);
    }

    #[test]
    fn close_is_reachable_from_graph_states() {
        let mut session = Session::new();
        session.set_state(Connect).unwrap();
        session.set_state(Close).unwrap();
        assert_eq!(session.state(), Close);
    }

    #[test]
    fn state_codes_roundtrip() {
        for state in [
            Null,
            Intermediate,
            Close,
            Connect,
            ConnectAck,
            ConnectError,
            Auth,
            AuthDeny,
            AuthAccept,
            StreamProbe,
            StreamAck,
            StreamPull,
            StreamAcq,
            StreamNew,
            StreamDel,
            EInternal,
            EUnknown,
            EConnect,
            EStream,
            EAuth,
        ] {
            assert_eq!(SessionState::from_code(state.code()), state);
        }
        assert_eq!(SessionState::from_code(0x7f), Unknown);
    }
}
