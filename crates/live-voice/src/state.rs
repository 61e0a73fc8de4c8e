//! Session lifecycle state machine
//!
//! ```text
//!  Disconnected ──▶ Connecting ──▶ AwaitingSetupAck ──▶ Active
//!       ▲               ▲  │              │                │
//!       │               │  ▼              ▼                ▼
//!       │           Reconnecting ◀────────┴────────────────┤
//!       │               │                                  │
//!       │               ▼                                  ▼
//!       └──────── Terminating ◀──────── Failed ◀───── (any live state)
//! ```
//!
//! State is published on a `watch` channel so observers always see the latest
//! value without polling.

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{LiveError, LiveResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingSetupAck,
    Active,
    Terminating,
    Reconnecting,
    Failed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, AwaitingSetupAck)
                | (AwaitingSetupAck, Active)
                | (Connecting | AwaitingSetupAck | Active, Reconnecting)
                | (Reconnecting, Connecting)
                | (
                    Connecting | AwaitingSetupAck | Active | Reconnecting | Failed,
                    Terminating
                )
                | (Connecting | AwaitingSetupAck | Active | Reconnecting, Failed)
                | (Terminating, Disconnected)
                | (Failed, Connecting)
        )
    }

    /// Captured audio may only be transmitted here.
    pub fn accepts_audio(self) -> bool {
        self == SessionState::Active
    }
}

/// Owner of the current state. Clones of the receiver observe changes.
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<SessionState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Disconnected);
        Self { tx }
    }

    pub fn current(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move to `next`, rejecting illegal transitions. Returns the previous state.
    pub fn transition(&self, next: SessionState) -> LiveResult<SessionState> {
        let mut result = Err(LiveError::InvalidTransition {
            from: self.current(),
            to: next,
        });
        self.tx.send_if_modified(|state| {
            let from = *state;
            if from.can_transition_to(next) {
                debug!(?from, to = ?next, "session state transition");
                *state = next;
                result = Ok(from);
                true
            } else {
                result = Err(LiveError::InvalidTransition { from, to: next });
                false
            }
        });
        result
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_happy_path() {
        let machine = StateMachine::new();
        for next in [Connecting, AwaitingSetupAck, Active, Terminating, Disconnected] {
            assert!(machine.transition(next).is_ok(), "-> {next:?}");
        }
        assert_eq!(machine.current(), Disconnected);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let machine = StateMachine::new();
        assert!(matches!(
            machine.transition(Active),
            Err(LiveError::InvalidTransition {
                from: Disconnected,
                to: Active
            })
        ));
        assert!(!Connecting.can_transition_to(Active));
        assert!(!Terminating.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Terminating));
        assert!(!Failed.can_transition_to(Active));
    }

    #[test]
    fn test_reconnect_and_failure_paths() {
        assert!(Active.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Reconnecting.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Connecting));
        assert!(Failed.can_transition_to(Terminating));
    }

    #[tokio::test]
    async fn test_watchers_see_changes() {
        let machine = StateMachine::new();
        let mut rx = machine.subscribe();
        machine.transition(Connecting).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Connecting);
        assert!(Active.accepts_audio());
        assert!(!AwaitingSetupAck.accepts_audio());
    }
}
