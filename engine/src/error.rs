//! Stable error taxonomy surfaced by the session engine's public operations.

use derive_more::Display;

/// Broad area of the engine an error originated in; carried alongside
/// [`ErrorKind`] for diagnostics.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ErrorPhase {
    #[display(fmt = "room")]
    Room,
    #[display(fmt = "signaling")]
    Signaling,
    #[display(fmt = "negotiation")]
    Negotiation,
    #[display(fmt = "reconnect")]
    Reconnect,
    #[display(fmt = "transport")]
    Transport,
    #[display(fmt = "lifecycle")]
    Lifecycle,
}

/// Stable identifier for a class of engine failure.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ErrorKind {
    /// An operation requiring [`joinRoom`] first was called before one.
    ///
    /// [`joinRoom`]: crate::session::Session::join_room
    RoomNotSelected,
    /// The store has no room with the requested id.
    RoomNotFound,
    /// The store rejected a call for missing credentials.
    AuthRequired,
    /// A store call failed transiently.
    DbUnavailable,
    /// An expected signaling event did not arrive in time.
    SignalTimeout,
    /// Peer/channels did not reach the ready state within the timeout.
    WaitReadyTimeout,
    /// A negotiation step (SDP, ICE add, rollback) failed.
    SignalingFailed,
    /// An operation was called out of order for the engine's current state.
    InvalidState,
    /// Catch-all for anything not otherwise classified.
    Unknown,
}

impl ErrorKind {
    /// Whether a caller may reasonably retry the operation that produced
    /// this kind of error.
    #[must_use]
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::DbUnavailable
                | Self::SignalTimeout
                | Self::WaitReadyTimeout
                | Self::SignalingFailed
        )
    }
}

/// Error returned by every fallible public operation of the session engine.
#[derive(Clone, Debug, Display)]
#[display(fmt = "{} ({}): {}", kind, phase, message)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub phase: ErrorPhase,
    pub message: String,
}

impl std::error::Error for SessionError {}

impl SessionError {
    #[must_use]
    pub fn new(kind: ErrorKind, phase: ErrorPhase, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn room_not_selected() -> Self {
        Self::new(
            ErrorKind::RoomNotSelected,
            ErrorPhase::Room,
            "joinRoom/createRoom must be called before this operation",
        )
    }

    #[must_use]
    pub fn room_not_found() -> Self {
        Self::new(ErrorKind::RoomNotFound, ErrorPhase::Room, "no such room in store")
    }

    #[must_use]
    pub fn auth_required() -> Self {
        Self::new(ErrorKind::AuthRequired, ErrorPhase::Room, "store requires credentials")
    }

    #[must_use]
    pub fn db_unavailable(cause: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::DbUnavailable, ErrorPhase::Room, cause.to_string())
    }

    #[must_use]
    pub fn wait_ready_timeout(timeout_ms: u64) -> Self {
        Self::new(
            ErrorKind::WaitReadyTimeout,
            ErrorPhase::Lifecycle,
            format!("peer/channels not ready within {timeout_ms}ms"),
        )
    }

    #[must_use]
    pub fn signaling_failed(cause: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::SignalingFailed, ErrorPhase::Negotiation, cause.to_string())
    }

    /// Whether this error can reasonably be retried by the caller.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

/// Classifies an opaque store/transport failure message the way the source
/// engine classifies native errors surfaced by the backend (e.g. an
/// authentication rejection raised as a generic error by the store).
#[must_use]
pub fn classify_store_failure(message: &str) -> SessionError {
    if message.to_lowercase().contains("auth") {
        SessionError::auth_required()
    } else {
        SessionError::db_unavailable(message)
    }
}

/// Result type used internally, preserving a capture-site [`tracerr::Trace`]
/// until it reaches a public operation boundary.
pub type TracedResult<T> = Result<T, tracerr::Traced<SessionError>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(ErrorKind::DbUnavailable.is_retriable());
        assert!(ErrorKind::WaitReadyTimeout.is_retriable());
        assert!(!ErrorKind::RoomNotSelected.is_retriable());
        assert!(!ErrorKind::InvalidState.is_retriable());
    }

    #[test]
    fn classify_store_failure_detects_auth() {
        let err = classify_store_failure("Auth required");
        assert_eq!(err.kind, ErrorKind::AuthRequired);
    }

    #[test]
    fn classify_store_failure_defaults_to_db_unavailable() {
        let err = classify_store_failure("connection reset");
        assert_eq!(err.kind, ErrorKind::DbUnavailable);
    }
}
