//! Registry-based election.
//!
//! Membership comes from an orchestration registry's listing of running
//! instances. The leader is the smallest identity in the listing
//! ([`crate::rule`]). Followers block on the registry until one of the
//! peers they saw has left, then re-elect. The leader re-lists
//! periodically so that a newly registered instance with a smaller
//! identity takes over instead of running a second leader alongside it.
//!
//! # Known limitation
//!
//! Listings are a single page of at most [`MemberFilter::max_results`]
//! entries; there is no pagination. A full page is logged as possibly
//! truncated on every detection, since the leader rule is only correct
//! when every instance sees the whole set.

mod file;

pub use file::{FileRegistry, FileRegistryConfig};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::elector::Strategy;
use crate::identity::{resolve_identity, IdentitySource};
use crate::rule::{is_leader, MembershipSet};
use crate::{ElectionError, Identity};

/// Largest listing fetched in one call.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// Selects which registry entries count as members.
///
/// `group` is opaque to the election (a cluster name, a service name) and
/// passed through to the source untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberFilter {
    pub group: Option<String>,
    pub max_results: usize,
}

impl Default for MemberFilter {
    fn default() -> Self {
        Self {
            group: None,
            max_results: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl MemberFilter {
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..Self::default()
        }
    }
}

/// An orchestration registry that can list instances.
///
/// Implementations map rate limiting to [`ElectionError::Throttled`] and
/// everything else to a transient variant.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Lists the identities of every running instance matching `filter`,
    /// at most `filter.max_results` of them.
    async fn list_members(&self, filter: &MemberFilter) -> Result<Vec<Identity>, ElectionError>;

    /// Blocks until at least one of `watched` has left the listing.
    ///
    /// Gives up with [`ElectionError::WaitTimedOut`] after an
    /// implementation-defined time.
    async fn wait_for_change(&self, watched: &[Identity]) -> Result<(), ElectionError>;
}

/// Settings for [`RegistryStrategy`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub filter: MemberFilter,
    /// How many times to look for our own identity at startup.
    pub identity_attempts: u32,
    /// Wait between identity lookups.
    pub identity_retry_delay: Duration,
    /// How often the leader re-lists membership to confirm it still leads.
    pub recheck_interval: Duration,
    /// Delays applied when a leader recheck fails.
    pub backoff: BackoffPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            filter: MemberFilter::default(),
            identity_attempts: 30,
            identity_retry_delay: Duration::from_secs(1),
            recheck_interval: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Elects the smallest identity in the registry listing.
pub struct RegistryStrategy<M, I> {
    source: M,
    identity_source: I,
    config: RegistryConfig,
    identity: Option<Identity>,
    /// Membership observed by the last successful detection.
    peers: MembershipSet,
}

impl<M, I> RegistryStrategy<M, I>
where
    M: MembershipSource,
    I: IdentitySource,
{
    pub fn new(source: M, identity_source: I, config: RegistryConfig) -> Self {
        Self {
            source,
            identity_source,
            config,
            identity: None,
            peers: MembershipSet::default(),
        }
    }

    /// Our identity, once resolved.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Membership seen by the most recent detection.
    pub fn peers(&self) -> &MembershipSet {
        &self.peers
    }

    async fn fetch(&self) -> Result<MembershipSet, ElectionError> {
        let ids = self.source.list_members(&self.config.filter).await?;
        if ids.len() >= self.config.filter.max_results {
            warn!(
                count = ids.len(),
                limit = self.config.filter.max_results,
                "membership listing filled a whole page and may be truncated"
            );
        }
        Ok(MembershipSet::new(ids))
    }

    fn me(&self) -> Result<&Identity, ElectionError> {
        self.identity
            .as_ref()
            .ok_or_else(|| ElectionError::Configuration("identity not resolved".into()))
    }
}

#[async_trait]
impl<M, I> Strategy for RegistryStrategy<M, I>
where
    M: MembershipSource + 'static,
    I: IdentitySource + 'static,
{
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn prepare(&mut self) -> Result<(), ElectionError> {
        if self.identity.is_some() {
            return Ok(());
        }
        let id = resolve_identity(
            &self.identity_source,
            self.config.identity_attempts,
            self.config.identity_retry_delay,
        )
        .await?;
        info!(identity = %id, "resolved instance identity");
        self.identity = Some(id);
        Ok(())
    }

    async fn detect(&mut self) -> Result<bool, ElectionError> {
        let peers = self.fetch().await?;
        let leader = is_leader(&peers, self.me()?)?;
        debug!(members = peers.len(), leader, "registry detection");
        self.peers = peers;
        Ok(leader)
    }

    async fn lead(&mut self) -> Result<(), ElectionError> {
        Ok(())
    }

    async fn hold(&mut self) -> Result<(), ElectionError> {
        let mut attempt = 0u32;
        loop {
            tokio::time::sleep(self.config.recheck_interval).await;

            let peers = match self.fetch().await {
                Ok(peers) => peers,
                Err(e) => {
                    // we are alive, so failing to list is no reason to
                    // give up leadership; just look again later
                    attempt = attempt.saturating_add(1);
                    if let Some(delay) = self.config.backoff.delay_for(&e, attempt) {
                        warn!(attempt, delay = ?delay, "leader recheck failed: {e}");
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }
            };
            attempt = 0;

            match is_leader(&peers, self.me()?) {
                Ok(true) => {
                    if peers != self.peers {
                        debug!(members = peers.len(), "membership changed, still leader");
                        self.peers = peers;
                    }
                }
                Ok(false) => {
                    info!(
                        leader = ?peers.first().map(Identity::as_str),
                        "a smaller identity registered"
                    );
                    return Ok(());
                }
                // the others have already elected someone else
                Err(ElectionError::NotRegistered(me)) => {
                    warn!(identity = %me, "own entry left the registry, stepping down");
                    return Ok(());
                }
                // an empty listing is a registry gap, not a lost election
                Err(e) => debug!("ignoring inconclusive recheck: {e}"),
            }
        }
    }

    /// Waits until the leader this instance follows is no longer the
    /// leader. Departures of other followers only refresh the watched set.
    async fn follow(&mut self) -> Result<(), ElectionError> {
        loop {
            debug!(watched = self.peers.len(), "waiting for membership change");
            self.source.wait_for_change(self.peers.as_slice()).await?;

            let peers = self.fetch().await?;
            let me = self.me()?;
            if !peers.contains(me) || peers.first() != self.peers.first() {
                info!(
                    leader = ?peers.first().map(Identity::as_str),
                    "leader changed"
                );
                return Ok(());
            }
            debug!(members = peers.len(), "a follower left, leader unchanged");
            self.peers = peers;
        }
    }

    async fn stand_down(&mut self) {
        self.peers = MembershipSet::default();
    }
}
