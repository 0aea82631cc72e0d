//! Local-network service discovery used by the heartbeat strategy.
//!
//! The leader publishes an advertisement under the group's name; anyone
//! scanning for the service type during their detection window finds it
//! and follows. Whoever scans and finds nothing claims the name.

mod multicast;

pub use multicast::{MulticastConfig, MulticastDiscovery};

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::ElectionError;

/// A service instance announced on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// The group name being claimed.
    pub name: String,
    pub service_type: String,
    /// Port the advertised instance answers heartbeats on.
    pub port: u16,
    /// Addresses the advertisement was seen from.
    pub addresses: Vec<IpAddr>,
}

impl Advertisement {
    /// The first usable heartbeat address, if any.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.addresses
            .first()
            .map(|ip| SocketAddr::new(*ip, self.port))
    }
}

/// Keeps an advertisement on the network. Dropping it withdraws the
/// advertisement.
#[derive(Debug)]
pub struct Publication {
    task: JoinHandle<()>,
}

impl Publication {
    /// Wraps the background task that keeps announcing.
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Publishes and finds advertisements.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Starts advertising `name` under `service_type` at `port`.
    async fn publish(
        &self,
        name: &str,
        service_type: &str,
        port: u16,
    ) -> Result<Publication, ElectionError>;

    /// Returns the first advertisement of `service_type` seen within
    /// `timeout`, or `None` if there was none.
    async fn find_once(
        &self,
        service_type: &str,
        timeout: Duration,
    ) -> Result<Option<Advertisement>, ElectionError>;
}
