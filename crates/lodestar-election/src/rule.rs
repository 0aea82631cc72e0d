//! Deterministic leader selection over a membership set.
//!
//! Every instance that sees the same set of identities picks the same
//! leader: the smallest identity. No messages are exchanged; agreement on
//! the set is the only thing that makes the result consistent.

use crate::{ElectionError, Identity};

/// A snapshot of every instance currently considered alive.
///
/// Always held sorted ascending and deduplicated. Built fresh for each
/// detection and never edited afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MembershipSet {
    members: Vec<Identity>,
}

impl MembershipSet {
    pub fn new<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Identity>,
    {
        let mut members: Vec<Identity> = ids.into_iter().map(Into::into).collect();
        members.sort();
        members.dedup();
        Self { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &Identity) -> bool {
        self.members.binary_search(id).is_ok()
    }

    /// The identity the leader rule selects, if any.
    pub fn first(&self) -> Option<&Identity> {
        self.members.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.members.iter()
    }

    pub fn as_slice(&self) -> &[Identity] {
        &self.members
    }
}

impl<T: Into<Identity>> FromIterator<T> for MembershipSet {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Returns whether `me` is the leader of `members`.
///
/// An empty set, or one that does not contain `me`, means the listing is
/// not trustworthy yet (our own registration may still be propagating),
/// so it is reported as a transient error rather than answered.
pub fn is_leader(members: &MembershipSet, me: &Identity) -> Result<bool, ElectionError> {
    if members.is_empty() {
        return Err(ElectionError::EmptyMembership);
    }
    if !members.contains(me) {
        return Err(ElectionError::NotRegistered(me.clone()));
    }
    Ok(members.first() == Some(me))
}
