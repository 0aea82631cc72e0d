//! lodestar-election: leader election for fleets of identical workers.
//!
//! A group of interchangeable processes agrees on a single leader without
//! a coordinator. One instance does the privileged work; the others stand
//! by and take over when it disappears.
//!
//! # Architecture
//!
//! - **Elector**: the detect → lead/follow → re-elect loop, with backoff
//!   on recoverable errors and events for the consumer
//! - **Registry strategy**: membership from an orchestration registry,
//!   leader = smallest identity, leader loss = a peer left the listing
//! - **Heartbeat strategy**: membership from network discovery, leader =
//!   first to claim the group name, leader loss = missed UDP heartbeats
//!
//! This is leader *selection*, not consensus. During a re-election race or
//! a network partition two instances may briefly both consider themselves
//! leader.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use lodestar_election::{
//!     ElectionEvent, Elector, ElectorConfig, HeartbeatConfig, HeartbeatStrategy,
//!     MulticastDiscovery,
//! };
//!
//! let strategy = HeartbeatStrategy::new(
//!     MulticastDiscovery::default(),
//!     HeartbeatConfig::named("billing-workers"),
//! )?;
//! let (mut elector, mut events) = Elector::new(strategy, ElectorConfig::default());
//! elector.start();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ElectionEvent::Leader => start_privileged_work(),
//!         ElectionEvent::Reelection => stop_privileged_work(),
//!         _ => {}
//!     }
//! }
//! ```

pub mod backoff;
pub mod discovery;
mod elector;
mod error;
mod event;
pub mod heartbeat;
mod identity;
pub mod registry;
mod rule;

pub use backoff::{BackoffPolicy, RetryContext};
pub use discovery::{
    Advertisement, DiscoverySource, MulticastConfig, MulticastDiscovery, Publication,
};
pub use elector::{Elector, ElectorConfig, Strategy};
pub use error::{ElectionError, ErrorClass};
pub use event::{ElectionEvent, Role};
pub use heartbeat::{HeartbeatConfig, HeartbeatStrategy, LeaderRef};
pub use identity::{resolve_identity, FileIdentitySource, Identity, IdentitySource};
pub use registry::{
    FileRegistry, FileRegistryConfig, MemberFilter, MembershipSource, RegistryConfig,
    RegistryStrategy,
};
pub use rule::{is_leader, MembershipSet};
