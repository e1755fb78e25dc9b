//! Crate-wide error types.
//!
//! Network failures, handshake failures and malformed commands all collapse
//! into [`SessionError`], the type every session-facing operation returns.
//! The wire-exposed response taxonomy ([`Status`]) is a separate, first
//! class enum rather than an exception: a `Failed`/`NotFound`/`Interrupted`
//! response is a normal value flowing through the system, not a fault.

use std::fmt;
use std::io;

/// The result type used throughout the session core.
pub type Result<T, E = SessionError> = std::result::Result<T, E>;

/// Errors that can terminate a session, a request, or a single operation.
#[derive(Debug)]
pub enum SessionError {
    /// The underlying socket was closed, reset, or timed out.
    Io(io::Error),
    /// A command line or header could not be parsed.
    MalformedCommand(String),
    /// The peer's authentication hash did not match ours.
    AuthFailed,
    /// The handshake saw an unexpected verb for the current step.
    UnexpectedVerb { expected: &'static str, got: String },
    /// The remote peering named in a `Hello` is not registered locally and
    /// no rendezvous path could be found for it.
    UnknownPeering,
    /// A cryptographic primitive failed (allocation failure only, per spec).
    Crypto(String),
    /// The request or session was interrupted before completion.
    Interrupted,
    /// A timeout elapsed waiting for a handshake step or a response.
    Timeout,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {}", e),
            Self::MalformedCommand(s) => write!(f, "malformed command: {}", s),
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::UnexpectedVerb { expected, got } => {
                write!(f, "expected verb {}, got {}", expected, got)
            }
            Self::UnknownPeering => write!(f, "unknown peering"),
            Self::Crypto(s) => write!(f, "crypto error: {}", s),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Timeout => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// A malformed command or missing header is treated as a network I/O
/// failure per spec: the session just closes, nothing is retried here.
impl From<SessionError> for io::Error {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// The wire-exposed response status taxonomy (spec §7). Values are fixed
/// and must match their wire representation byte for byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Stream closed cleanly; an internal marker, never sent on its own.
    Finished,
    /// Operation succeeded.
    Success,
    /// More responses follow for this request id.
    Pending,
    /// Generic failure.
    Failed,
    /// Target does not exist on this peer.
    NotFound,
    /// Session was lost while the response was in flight.
    Interrupted,
    /// The content producer failed mid-stream.
    ReadFailed,
}

impl Status {
    /// The wire-level integer value, per the fixed table in spec §7.
    pub fn code(self) -> i32 {
        match self {
            Self::Finished => -1,
            Self::Success => 0,
            Self::Pending => 1,
            Self::Failed => 2,
            Self::NotFound => 3,
            Self::Interrupted => 4,
            Self::ReadFailed => 5,
        }
    }

    /// Parses a status from its wire integer value.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Finished),
            0 => Some(Self::Success),
            1 => Some(Self::Pending),
            2 => Some(Self::Failed),
            3 => Some(Self::NotFound),
            4 => Some(Self::Interrupted),
            5 => Some(Self::ReadFailed),
            _ => None,
        }
    }

    /// A status is terminal if no further responses for the same request id
    /// are expected from the peer that sent it.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Finished => "Finished",
            Self::Success => "Success",
            Self::Pending => "Pending",
            Self::Failed => "Failed",
            Self::NotFound => "NotFound",
            Self::Interrupted => "Interrupted",
            Self::ReadFailed => "ReadFailed",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_roundtrip() {
        for s in [
            Status::Finished,
            Status::Success,
            Status::Pending,
            Status::Failed,
            Status::NotFound,
            Status::Interrupted,
            Status::ReadFailed,
        ] {
            assert_eq!(Status::from_code(s.code()), Some(s));
        }
    }

    #[test]
    fn only_pending_is_nonterminal() {
        assert!(!Status::Pending.is_terminal());
        assert!(Status::Success.is_terminal());
        assert!(Status::Failed.is_terminal());
    }
}
