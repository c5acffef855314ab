use std::{fmt, io, time::Duration};

use thiserror::Error;

use crate::connection::TunnelState;

/// Step of the tunnel lifecycle an error happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Handshake,
    Request,
    Response,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Connect => "connect",
            Phase::Handshake => "handshake",
            Phase::Request => "request",
            Phase::Response => "response",
        };
        f.write_str(name)
    }
}

/// Why the connection to the router could not be opened
#[derive(Error, Debug)]
pub enum ConnectFailure {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("TLS handshake with destination failed: {0}")]
    TlsHandshake(String),
}

/// Error types for the router tunnel
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid route format: {0}")]
    InvalidRouteFormat(String),

    #[error("Unsupported route: {0}")]
    UnsupportedRoute(String),

    #[error("Failed to connect to router {addr}: {reason}")]
    RouterConnectFailed { addr: String, reason: ConnectFailure },

    #[error("Router handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Router rejected route (code {code}): {message}")]
    RouterRejected {
        code: i32,
        message: String,
        detail: Option<String>,
    },

    #[error("Malformed router reply ({0} bytes)")]
    MalformedReply(usize),

    #[error("Tunnel is not open (state: {0})")]
    NotConnected(TunnelState),

    #[error("Operation not allowed in state {0}")]
    InvalidState(TunnelState),

    #[error("Tunnel broken during {phase}: {reason}")]
    TunnelBroken { phase: Phase, reason: String },

    #[error("No complete response within {0:?}")]
    ResponseTimeout(Duration),

    #[error("Tunnel closed while an operation was outstanding")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid HTTP response: {0}")]
    InvalidResponse(String),

    #[error("Response exceeds {0} bytes")]
    ResponseTooLarge(usize),
}

impl TunnelError {
    pub(crate) fn broken(phase: Phase, reason: impl fmt::Display) -> Self {
        TunnelError::TunnelBroken {
            phase,
            reason: reason.to_string(),
        }
    }

    /// Lifecycle phase the failure belongs to, when it is tied to one
    pub fn phase(&self) -> Option<Phase> {
        match self {
            TunnelError::InvalidRouteFormat(_) | TunnelError::UnsupportedRoute(_) => None,
            TunnelError::RouterConnectFailed { .. } => Some(Phase::Connect),
            TunnelError::HandshakeTimeout(_)
            | TunnelError::RouterRejected { .. }
            | TunnelError::MalformedReply(_) => Some(Phase::Handshake),
            TunnelError::TunnelBroken { phase, .. } => Some(*phase),
            TunnelError::NotConnected(_) | TunnelError::InvalidRequest(_) => Some(Phase::Request),
            TunnelError::ResponseTimeout(_)
            | TunnelError::InvalidResponse(_)
            | TunnelError::ResponseTooLarge(_) => Some(Phase::Response),
            TunnelError::InvalidState(_) | TunnelError::Cancelled => None,
        }
    }

    /// Whether a timer fired, as opposed to an explicit failure
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TunnelError::HandshakeTimeout(_)
                | TunnelError::ResponseTimeout(_)
                | TunnelError::RouterConnectFailed {
                    reason: ConnectFailure::TimedOut(_),
                    ..
                }
        )
    }
}

/// Type alias for Results using TunnelError
pub type Result<T> = std::result::Result<T, TunnelError>;
