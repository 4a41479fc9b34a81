use std::fmt;

use crate::domain::{PairingCode, SessionBlob};

/// Why the connection ended up `Disconnected`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The network refused our credentials.
    AuthFailure(String),
    /// The network or the bridge reported a disconnect.
    Remote(String),
    /// The bridge failed in a way it cannot recover from (crash, protocol breakage).
    Fatal(String),
    /// We shut the client down ourselves.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::AuthFailure(msg) => write!(f, "auth failure: {msg}"),
            DisconnectReason::Remote(reason) => write!(f, "disconnected: {reason}"),
            DisconnectReason::Fatal(reason) => write!(f, "client error: {reason}"),
            DisconnectReason::Shutdown => f.write_str("shut down"),
        }
    }
}

/// Process-wide connection state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    AwaitingPairing(PairingCode),
    Authenticated,
    Ready,
    Disconnected(DisconnectReason),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    pub fn pairing_code(&self) -> Option<&PairingCode> {
        match self {
            ConnectionState::AwaitingPairing(code) => Some(code),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::AwaitingPairing(_) => "awaiting_pairing",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnected(_) => "disconnected",
        }
    }
}

/// Events emitted by the messaging client.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    PairingCode(PairingCode),
    /// Carries the session blob when the client exposes one.
    Authenticated(Option<SessionBlob>),
    Ready,
    AuthFailure(String),
    Disconnected(String),
    Fatal(String),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::PairingCode(_) => "pairing_code",
            ClientEvent::Authenticated(_) => "authenticated",
            ClientEvent::Ready => "ready",
            ClientEvent::AuthFailure(_) => "auth_failure",
            ClientEvent::Disconnected(_) => "disconnected",
            ClientEvent::Fatal(_) => "fatal",
        }
    }
}

/// Side effect requested by a transition; executed by the event loop.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Keep the session blob handed over with `Authenticated`.
    RememberSession(SessionBlob),
    /// Hand the current session to the store.
    PersistSession,
    /// Resume was refused: restart the client without a session to get a pairing code.
    RestartWithoutSession,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub next: ConnectionState,
    pub effect: Option<Effect>,
}

impl Transition {
    fn to(next: ConnectionState) -> Self {
        Self { next, effect: None }
    }

    fn with(next: ConnectionState, effect: Effect) -> Self {
        Self {
            next,
            effect: Some(effect),
        }
    }

    fn stay(current: &ConnectionState) -> Self {
        Self::to(current.clone())
    }
}

/// The single transition function of the connection state machine.
///
/// `resuming` is true while the client was started with a saved session and has not
/// yet produced a pairing code or authenticated.
pub fn transition(current: &ConnectionState, event: &ClientEvent, resuming: bool) -> Transition {
    use ConnectionState as S;

    match (current, event) {
        // Disconnected is only left through an explicit re-initialize.
        (S::Disconnected(_), ClientEvent::PairingCode(_))
        | (S::Disconnected(_), ClientEvent::Authenticated(_))
        | (S::Disconnected(_), ClientEvent::Ready) => Transition::stay(current),

        (_, ClientEvent::PairingCode(code)) => Transition::to(S::AwaitingPairing(code.clone())),

        (S::Uninitialized | S::AwaitingPairing(_), ClientEvent::Authenticated(session)) => {
            match session {
                Some(s) => Transition::with(S::Authenticated, Effect::RememberSession(s.clone())),
                None => Transition::to(S::Authenticated),
            }
        }
        (_, ClientEvent::Authenticated(_)) => Transition::stay(current),

        (S::Authenticated, ClientEvent::Ready) => Transition::with(S::Ready, Effect::PersistSession),
        (_, ClientEvent::Ready) => Transition::stay(current),

        (S::Uninitialized, ClientEvent::AuthFailure(_)) if resuming => {
            Transition::with(S::Uninitialized, Effect::RestartWithoutSession)
        }
        (_, ClientEvent::AuthFailure(msg)) => {
            Transition::to(S::Disconnected(DisconnectReason::AuthFailure(msg.clone())))
        }

        (_, ClientEvent::Disconnected(reason)) => {
            Transition::to(S::Disconnected(DisconnectReason::Remote(reason.clone())))
        }
        (_, ClientEvent::Fatal(reason)) => {
            Transition::to(S::Disconnected(DisconnectReason::Fatal(reason.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn code(s: &str) -> PairingCode {
        PairingCode(s.to_string())
    }

    fn blob() -> SessionBlob {
        SessionBlob(json!({"token": "t"}))
    }

    #[test]
    fn fresh_pairing_flow_reaches_ready_and_persists() {
        let s = ConnectionState::Uninitialized;

        let t = transition(&s, &ClientEvent::PairingCode(code("1@a")), false);
        assert_eq!(t.next, ConnectionState::AwaitingPairing(code("1@a")));

        let t = transition(&t.next, &ClientEvent::Authenticated(Some(blob())), false);
        assert_eq!(t.next, ConnectionState::Authenticated);
        assert_eq!(t.effect, Some(Effect::RememberSession(blob())));

        let t = transition(&t.next, &ClientEvent::Ready, false);
        assert_eq!(t.next, ConnectionState::Ready);
        assert_eq!(t.effect, Some(Effect::PersistSession));
    }

    #[test]
    fn resumed_session_skips_pairing() {
        let t = transition(
            &ConnectionState::Uninitialized,
            &ClientEvent::Authenticated(None),
            true,
        );
        assert_eq!(t.next, ConnectionState::Authenticated);
        assert_eq!(t.effect, None);
    }

    #[test]
    fn new_pairing_code_replaces_old_one() {
        let s = ConnectionState::AwaitingPairing(code("old"));
        let t = transition(&s, &ClientEvent::PairingCode(code("new")), false);
        assert_eq!(t.next.pairing_code(), Some(&code("new")));
    }

    #[test]
    fn ready_needs_authentication_first() {
        for s in [
            ConnectionState::Uninitialized,
            ConnectionState::AwaitingPairing(code("c")),
        ] {
            let t = transition(&s, &ClientEvent::Ready, false);
            assert_eq!(t.next, s);
            assert_eq!(t.effect, None);
        }
    }

    #[test]
    fn refused_resume_falls_back_to_pairing() {
        let t = transition(
            &ConnectionState::Uninitialized,
            &ClientEvent::AuthFailure("session expired".to_string()),
            true,
        );
        assert_eq!(t.next, ConnectionState::Uninitialized);
        assert_eq!(t.effect, Some(Effect::RestartWithoutSession));
    }

    #[test]
    fn auth_failure_after_pairing_disconnects() {
        let t = transition(
            &ConnectionState::Ready,
            &ClientEvent::AuthFailure("logged out".to_string()),
            false,
        );
        assert_eq!(
            t.next,
            ConnectionState::Disconnected(DisconnectReason::AuthFailure("logged out".to_string()))
        );
        assert_eq!(t.effect, None);
    }

    #[test]
    fn disconnect_and_fatal_from_any_state() {
        for s in [
            ConnectionState::Uninitialized,
            ConnectionState::AwaitingPairing(code("c")),
            ConnectionState::Authenticated,
            ConnectionState::Ready,
            ConnectionState::Disconnected(DisconnectReason::Shutdown),
        ] {
            let t = transition(&s, &ClientEvent::Disconnected("NAVIGATION".to_string()), false);
            assert_eq!(
                t.next,
                ConnectionState::Disconnected(DisconnectReason::Remote("NAVIGATION".to_string()))
            );
            let t = transition(&s, &ClientEvent::Fatal("bridge exited".to_string()), false);
            assert!(matches!(
                t.next,
                ConnectionState::Disconnected(DisconnectReason::Fatal(_))
            ));
        }
    }

    #[test]
    fn disconnected_does_not_auto_reconnect() {
        let s = ConnectionState::Disconnected(DisconnectReason::Remote("x".to_string()));
        for ev in [
            ClientEvent::PairingCode(code("c")),
            ClientEvent::Authenticated(Some(blob())),
            ClientEvent::Ready,
        ] {
            let t = transition(&s, &ev, false);
            assert_eq!(t.next, s);
            assert_eq!(t.effect, None);
        }
    }

    #[test]
    fn reason_display_is_human_readable() {
        assert_eq!(
            DisconnectReason::AuthFailure("bad".to_string()).to_string(),
            "auth failure: bad"
        );
        assert_eq!(DisconnectReason::Shutdown.to_string(), "shut down");
    }
}
