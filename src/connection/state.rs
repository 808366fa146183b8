//! Connection state machine
//!
//! [`transition`] is a pure function of (state, event). The manager applies it
//! and performs the side effects; keeping it pure lets every path be tested
//! without a radio.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Authenticating,
    Monitoring,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    /// States that hold (or are acquiring) a radio link
    pub fn has_link(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::DiscoveringServices
                | ConnectionState::Authenticating
                | ConnectionState::Monitoring
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ScanStarted,
    ScanStopped,
    DeviceSelected,
    LinkEstablished,
    ServicesDiscovered,
    AuthenticationFinished { authenticated: bool },
    DisconnectRequested,
    LinkLost,
    DisconnectComplete,
    Failure(String),
    Reset,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Failure(reason) => write!(f, "Failure({})", reason),
            ConnectionEvent::AuthenticationFinished { authenticated } => {
                write!(f, "AuthenticationFinished(authenticated={})", authenticated)
            }
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Compute the next state
///
/// # Errors
///
/// Returns [`EngineError::InvalidTransition`] when `event` is not accepted in
/// `state`.
pub fn transition(state: ConnectionState, event: &ConnectionEvent) -> Result<ConnectionState> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    let next = match (state, event) {
        (S::Idle | S::Scanning, E::ScanStarted) => S::Scanning,
        (S::Scanning, E::ScanStopped) => S::Idle,
        (S::Idle | S::Scanning, E::DeviceSelected) => S::Connecting,
        (S::Connecting, E::LinkEstablished) => S::DiscoveringServices,
        (S::DiscoveringServices, E::ServicesDiscovered) => S::Authenticating,
        (S::Authenticating, E::AuthenticationFinished { .. }) => S::Monitoring,
        (s, E::DisconnectRequested | E::LinkLost) if s.has_link() => S::Disconnecting,
        (S::Disconnecting, E::DisconnectComplete) => S::Idle,
        (_, E::Failure(_)) => S::Failed,
        (S::Failed, E::Reset) => S::Idle,
        (from, event) => {
            return Err(EngineError::InvalidTransition {
                from,
                event: event.to_string(),
            })
        }
    };

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent as E;
    use ConnectionState as S;

    #[test]
    fn test_happy_path() {
        let mut state = S::Idle;
        for (event, expected) in [
            (E::ScanStarted, S::Scanning),
            (E::DeviceSelected, S::Connecting),
            (E::LinkEstablished, S::DiscoveringServices),
            (E::ServicesDiscovered, S::Authenticating),
            (E::AuthenticationFinished { authenticated: false }, S::Monitoring),
            (E::DisconnectRequested, S::Disconnecting),
            (E::DisconnectComplete, S::Idle),
        ] {
            state = transition(state, &event).unwrap();
            assert_eq!(state, expected, "after {}", event);
        }
    }

    #[test]
    fn test_scan_stop_returns_to_idle() {
        assert_eq!(transition(S::Scanning, &E::ScanStopped).unwrap(), S::Idle);
        assert_eq!(transition(S::Scanning, &E::ScanStarted).unwrap(), S::Scanning);
    }

    #[test]
    fn test_connect_without_scan() {
        assert_eq!(transition(S::Idle, &E::DeviceSelected).unwrap(), S::Connecting);
    }

    #[test]
    fn test_link_lost_from_any_linked_state() {
        for state in [S::Connecting, S::DiscoveringServices, S::Authenticating, S::Monitoring] {
            assert_eq!(transition(state, &E::LinkLost).unwrap(), S::Disconnecting);
            assert_eq!(transition(state, &E::DisconnectRequested).unwrap(), S::Disconnecting);
        }
    }

    #[test]
    fn test_failure_from_every_state_then_reset() {
        for state in [
            S::Idle,
            S::Scanning,
            S::Connecting,
            S::DiscoveringServices,
            S::Authenticating,
            S::Monitoring,
            S::Disconnecting,
            S::Failed,
        ] {
            let failed = transition(state, &E::Failure("boom".to_string())).unwrap();
            assert_eq!(failed, S::Failed);
            assert_eq!(transition(failed, &E::Reset).unwrap(), S::Idle);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        for (state, event) in [
            (S::Idle, E::LinkEstablished),
            (S::Idle, E::DisconnectRequested),
            (S::Idle, E::ScanStopped),
            (S::Monitoring, E::ScanStarted),
            (S::Monitoring, E::DeviceSelected),
            (S::Connecting, E::ServicesDiscovered),
            (S::Disconnecting, E::LinkLost),
            (S::Idle, E::Reset),
        ] {
            match transition(state, &event) {
                Err(EngineError::InvalidTransition { from, .. }) => assert_eq!(from, state),
                other => panic!("{:?} on {} should be rejected, got {:?}", state, event, other),
            }
        }
    }

    #[test]
    fn test_has_link() {
        assert!(S::Monitoring.has_link());
        assert!(S::Connecting.has_link());
        assert!(!S::Idle.has_link());
        assert!(!S::Scanning.has_link());
        assert!(!S::Disconnecting.has_link());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(E::Failure("x".into()).to_string(), "Failure(x)");
        assert_eq!(E::LinkLost.to_string(), "LinkLost");
    }
}
