//! Session state machine. Every status change, including the ones triggered
//! by transport events, is computed here and applied by the registry in one
//! step together with the pairing artifact.

use chat_transport::TransportEvent;
use shared::domain::SessionStatus;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    Pairing,
    Restoring,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start(StartKind),
    /// Stored credentials were rejected during restoration; fall back to
    /// pairing with the same client.
    CredentialsRejected,
    PairingIssued(String),
    Authenticated,
    Ready,
    AuthFailed(String),
    Disconnected(String),
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(StartKind::Pairing) => "start_pairing",
            Self::Start(StartKind::Restoring) => "start_restoring",
            Self::CredentialsRejected => "credentials_rejected",
            Self::PairingIssued(_) => "pairing_issued",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::AuthFailed(_) => "auth_failed",
            Self::Disconnected(_) => "disconnected",
        }
    }
}

impl From<TransportEvent> for Transition {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::PairingCode(code) => Self::PairingIssued(code),
            TransportEvent::Authenticated => Self::Authenticated,
            TransportEvent::Ready => Self::Ready,
            TransportEvent::AuthFailure(reason) => Self::AuthFailed(reason),
            TransportEvent::Disconnected(reason) => Self::Disconnected(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transition {transition} is not allowed from {from}")]
pub struct InvalidTransition {
    pub from: SessionStatus,
    pub transition: &'static str,
}

/// Computes the status reached by applying `transition` to `from`.
pub fn next_status(
    from: SessionStatus,
    transition: &Transition,
) -> Result<SessionStatus, InvalidTransition> {
    use shared::domain::SessionStatus as S;

    let next = match (from, transition) {
        (S::NotInitialized | S::Disconnected | S::AuthFailure, Transition::Start(kind)) => {
            match kind {
                StartKind::Pairing => S::Initializing,
                StartKind::Restoring => S::Restoring,
            }
        }
        (S::Restoring, Transition::CredentialsRejected) => S::Initializing,
        // Codes are re-issued periodically while waiting for a scan.
        (S::Initializing | S::QrReady, Transition::PairingIssued(_)) => S::QrReady,
        (
            S::Initializing | S::QrReady | S::Restoring | S::Authenticated,
            Transition::Authenticated,
        ) => S::Authenticated,
        (S::Connected, Transition::Authenticated) => S::Connected,
        (_, Transition::Ready) => S::Connected,
        (_, Transition::AuthFailed(_)) => S::AuthFailure,
        (_, Transition::Disconnected(_)) => S::Disconnected,
        (from, transition) => {
            return Err(InvalidTransition {
                from,
                transition: transition.name(),
            })
        }
    };
    Ok(next)
}
