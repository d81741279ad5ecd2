//! Session lifecycle state machine.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NoSession,
    SessionReady,
    CommandInFlight,
    CommandStuck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Started,
    Dispatched,
    Completed,
    BoundElapsed,
    InputWritten,
    Terminated,
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: SessionState,
    pub event: SessionEvent,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal session transition: {:?} on {:?}", self.event, self.from)
    }
}

impl std::error::Error for IllegalTransition {}

/// Next state for `event` in state `from`.
pub fn transition(
    from: SessionState,
    event: SessionEvent,
) -> Result<SessionState, IllegalTransition> {
    use SessionEvent as E;
    use SessionState as S;

    let next = match (from, event) {
        (_, E::Lost) => S::NoSession,
        (S::NoSession, E::Started) => S::SessionReady,
        (S::SessionReady, E::Dispatched) => S::CommandInFlight,
        (S::CommandInFlight, E::Completed) => S::SessionReady,
        (S::CommandInFlight, E::BoundElapsed) => S::CommandStuck,
        (S::CommandStuck, E::Completed) => S::SessionReady,
        (S::CommandStuck, E::BoundElapsed) => S::CommandStuck,
        (S::CommandStuck, E::InputWritten) => S::CommandStuck,
        (S::CommandStuck, E::Terminated) => S::SessionReady,
        _ => return Err(IllegalTransition { from, event }),
    };
    Ok(next)
}
