//! Discovery and heartbeat based election.
//!
//! Detection scans the local network for an advertisement of the group's
//! name. If one turns up, its publisher is the leader and we follow it by
//! pinging it over UDP. If the scan window passes quietly, we claim the
//! name ourselves: bind the heartbeat responder and publish.
//!
//! Unlike the registry strategy, leadership here is first come, first
//! served rather than decided by identity order. Two instances whose scan
//! windows overlap before either has published can both become leader.
//! The window is randomized per scan to make that unlikely, not
//! impossible.

pub mod wire;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::discovery::{DiscoverySource, Publication};
use crate::elector::Strategy;
use crate::ElectionError;

use self::wire::{FailureCounter, Responder};

/// Settings for [`HeartbeatStrategy`].
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Group name the leader publishes under.
    pub name: String,
    /// Discovery service type scanned for.
    pub service_type: String,
    /// Heartbeat port the leader listens on.
    pub port: u16,
    /// Address the leader binds its responder to.
    pub host: IpAddr,
    /// Missed heartbeats tolerated before re-electing.
    pub max_failed_responses: u32,
    /// Time between pings, and how long each ping waits for an answer.
    pub poll_interval: Duration,
    /// Shortest detection scan.
    pub scan_window_min: Duration,
    /// Longest detection scan.
    pub scan_window_max: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            service_type: "ftl".into(),
            port: 9001,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_failed_responses: 3,
            poll_interval: Duration::from_secs(5),
            scan_window_min: Duration::from_secs(5),
            scan_window_max: Duration::from_secs(30),
        }
    }
}

impl HeartbeatConfig {
    /// Creates a config for the named group with default settings.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ElectionError> {
        if self.name.is_empty() {
            return Err(ElectionError::Configuration("group name is required".into()));
        }
        if self.service_type.is_empty() {
            return Err(ElectionError::Configuration("service type is required".into()));
        }
        if self.max_failed_responses == 0 {
            return Err(ElectionError::Configuration(
                "max failed responses must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ElectionError::Configuration(
                "poll interval must be non-zero".into(),
            ));
        }
        if self.scan_window_min > self.scan_window_max {
            return Err(ElectionError::Configuration(format!(
                "scan window min {:?} exceeds max {:?}",
                self.scan_window_min, self.scan_window_max
            )));
        }
        Ok(())
    }

    /// Picks a scan duration uniformly from the configured window.
    pub fn scan_window(&self) -> Duration {
        let span = self.scan_window_max.saturating_sub(self.scan_window_min);
        let span_ms = span.as_millis() as u64;
        if span_ms == 0 {
            return self.scan_window_min;
        }
        self.scan_window_min + Duration::from_millis(rand::rng().random_range(0..span_ms))
    }
}

/// The leader a follower is watching, as captured at detection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderRef {
    pub name: String,
    pub addr: SocketAddr,
}

/// Elects through network discovery and follows through UDP heartbeats.
pub struct HeartbeatStrategy<D> {
    discovery: D,
    config: HeartbeatConfig,
    leader: Option<LeaderRef>,
    failures: FailureCounter,
    responder: Option<Responder>,
    publication: Option<Publication>,
}

impl<D: DiscoverySource> HeartbeatStrategy<D> {
    pub fn new(discovery: D, config: HeartbeatConfig) -> Result<Self, ElectionError> {
        config.validate()?;
        let failures = FailureCounter::new(config.max_failed_responses);
        Ok(Self {
            discovery,
            config,
            leader: None,
            failures,
            responder: None,
            publication: None,
        })
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// The leader being followed, if any.
    pub fn leader(&self) -> Option<&LeaderRef> {
        self.leader.as_ref()
    }

    /// Current number of unanswered heartbeats.
    pub fn failures(&self) -> u32 {
        self.failures.value()
    }

    /// Address the responder is bound to while leading.
    pub fn responder_addr(&self) -> Option<SocketAddr> {
        self.responder.as_ref().map(Responder::local_addr)
    }
}

#[async_trait]
impl<D: DiscoverySource + 'static> Strategy for HeartbeatStrategy<D> {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn detect(&mut self) -> Result<bool, ElectionError> {
        let window = self.config.scan_window();
        debug!(service_type = %self.config.service_type, window = ?window, "scanning for leader");

        let found = self
            .discovery
            .find_once(&self.config.service_type, window)
            .await?;

        match found {
            Some(ad) if ad.name == self.config.name => {
                let Some(addr) = ad.socket_addr() else {
                    return Err(ElectionError::Discovery(format!(
                        "advertisement for '{}' carries no address",
                        ad.name
                    )));
                };
                info!(leader = %addr, "found leader");
                self.leader = Some(LeaderRef {
                    name: ad.name,
                    addr,
                });
                Ok(false)
            }
            Some(ad) => {
                debug!(name = %ad.name, "advertisement belongs to another group");
                Ok(true)
            }
            None => Ok(true),
        }
    }

    async fn lead(&mut self) -> Result<(), ElectionError> {
        // a leader that cannot answer heartbeats must not advertise
        let bind = SocketAddr::new(self.config.host, self.config.port);
        let responder = Responder::bind(bind).await?;
        let port = responder.local_addr().port();

        let publication = self
            .discovery
            .publish(&self.config.name, &self.config.service_type, port)
            .await?;

        info!(name = %self.config.name, addr = %responder.local_addr(), "claimed leadership");
        self.responder = Some(responder);
        self.publication = Some(publication);
        Ok(())
    }

    async fn hold(&mut self) -> Result<(), ElectionError> {
        match self.responder.as_mut() {
            Some(responder) => Err(responder.closed().await),
            None => Ok(()),
        }
    }

    async fn follow(&mut self) -> Result<(), ElectionError> {
        let Some(leader) = self.leader.clone() else {
            return Err(ElectionError::Discovery("no leader to follow".into()));
        };

        let every = self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let answered = wire::ping(leader.addr, every).await;
            let failures = self.failures.record(answered);
            debug!(leader = %leader.addr, answered, failures, "heartbeat");

            if self.failures.breached() {
                warn!(
                    leader = %leader.addr,
                    failures,
                    "leader stopped answering heartbeats"
                );
                return Ok(());
            }
        }
    }

    async fn stand_down(&mut self) {
        if self.responder.take().is_some() {
            debug!("heartbeat responder released");
        }
        self.publication = None;
        self.leader = None;
        self.failures.reset();
    }

    /// Discovery failures are retried on the heartbeat cadence, not with
    /// the registry API delays.
    fn retry_policy(&self) -> Option<BackoffPolicy> {
        Some(BackoffPolicy {
            throttled: self.config.poll_interval,
            transient: self.config.poll_interval,
        })
    }
}
