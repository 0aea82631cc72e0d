//! Signals delivered to the consumer of an elector.

use std::sync::Arc;

use crate::ElectionError;

/// The role an instance currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// No detection has settled yet, or a re-election is in progress.
    #[default]
    Undetermined,
    Leader,
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Undetermined => write!(f, "undetermined"),
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

/// Events emitted by the election loop, in the order they happen.
#[derive(Debug, Clone)]
pub enum ElectionEvent {
    /// This instance is now the leader.
    Leader,
    /// Another instance is the leader.
    Follower,
    /// The previous assignment is void. A new detection follows; this
    /// does not mean a new leader has been chosen yet.
    Reelection,
    /// Something went wrong that the consumer should know about. If the
    /// event channel closes right after this, the loop has halted.
    Error(Arc<ElectionError>),
}

impl ElectionEvent {
    /// Short name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ElectionEvent::Leader => "leader",
            ElectionEvent::Follower => "follower",
            ElectionEvent::Reelection => "reelection",
            ElectionEvent::Error(_) => "error",
        }
    }
}
