//! Error types for election operations.

use std::io;
use std::net::SocketAddr;

use crate::Identity;

/// How an error should be handled by the election loop.
///
/// `Throttled` and `Transient` errors are absorbed: the loop waits out the
/// backoff delay and tries again. `Fatal` errors stop the loop and are
/// surfaced to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// A collaborator is rate limiting us.
    Throttled,
    /// Any other recoverable collaborator or network failure.
    Transient,
    /// Unrecoverable without restarting the process.
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Throttled => write!(f, "throttled"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Errors that can occur while electing a leader.
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    /// The membership source rejected the request due to rate limiting.
    #[error("membership source throttled: {0}")]
    Throttled(String),

    /// The membership source failed for some other reason.
    #[error("membership source error: {0}")]
    Membership(String),

    /// The membership listing came back empty.
    #[error("membership listing is empty")]
    EmptyMembership,

    /// Our own identity is not (yet) part of the membership listing.
    #[error("identity {0} is not registered in the membership listing")]
    NotRegistered(Identity),

    /// Waiting for a membership change gave up before anything changed.
    #[error("timed out waiting for membership change")]
    WaitTimedOut,

    /// Service discovery failed.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// The local identity never became available.
    #[error("identity unavailable after {attempts} attempts")]
    IdentityUnavailable { attempts: u32 },

    /// The local identity exists but could not be understood.
    #[error("invalid identity source: {0}")]
    InvalidIdentity(String),

    /// The heartbeat responder could not bind its port.
    #[error("failed to bind heartbeat responder on {addr}: {source}")]
    ResponderBind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The heartbeat responder's receive loop died.
    #[error("heartbeat responder stopped: {0}")]
    ResponderStopped(#[source] io::Error),

    /// Invalid configuration supplied at construction.
    #[error("invalid election configuration: {0}")]
    Configuration(String),

    /// Network error that does not fit any of the above.
    #[error("network error: {0}")]
    Io(#[from] io::Error),
}

impl ElectionError {
    /// Returns the retry classification for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ElectionError::Throttled(_) => ErrorClass::Throttled,
            ElectionError::IdentityUnavailable { .. }
            | ElectionError::InvalidIdentity(_)
            | ElectionError::ResponderBind { .. }
            | ElectionError::Configuration(_) => ErrorClass::Fatal,
            ElectionError::Membership(_)
            | ElectionError::EmptyMembership
            | ElectionError::NotRegistered(_)
            | ElectionError::WaitTimedOut
            | ElectionError::Discovery(_)
            | ElectionError::ResponderStopped(_)
            | ElectionError::Io(_) => ErrorClass::Transient,
        }
    }

    /// Returns true if this error must halt the election loop.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttled_is_classified_throttled() {
        let e = ElectionError::Throttled("ThrottlingException".into());
        assert_eq!(e.class(), ErrorClass::Throttled);
        assert!(!e.is_fatal());
    }

    #[test]
    fn steady_state_failures_are_transient() {
        assert_eq!(ElectionError::EmptyMembership.class(), ErrorClass::Transient);
        assert_eq!(ElectionError::WaitTimedOut.class(), ErrorClass::Transient);
        assert_eq!(
            ElectionError::NotRegistered(Identity::new("task-1")).class(),
            ErrorClass::Transient
        );
        let io = ElectionError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(io.class(), ErrorClass::Transient);
    }

    #[test]
    fn missing_identity_is_fatal() {
        let e = ElectionError::IdentityUnavailable { attempts: 5 };
        assert!(e.is_fatal());
        assert_eq!(e.to_string(), "identity unavailable after 5 attempts");
    }

    #[test]
    fn responder_bind_is_fatal() {
        let e = ElectionError::ResponderBind {
            addr: "127.0.0.1:9001".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(e.is_fatal());
    }
}
