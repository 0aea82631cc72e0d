//! Heartbeat datagrams between followers and the leader.
//!
//! A follower sends `PING`; the leader answers every datagram it receives
//! with `PONG`, whatever the request said. There are no sequence numbers
//! and no framing beyond the datagram itself.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::ElectionError;

pub const PING: &[u8] = b"PING";
pub const PONG: &[u8] = b"PONG";

/// Returns true if `payload` is a heartbeat acknowledgement.
pub fn is_pong(payload: &[u8]) -> bool {
    payload == PONG
}

/// Consecutive missed heartbeats, weighed against a threshold.
///
/// A miss adds one and an answered ping takes one away, floored at zero.
/// An answer does not wipe the slate: a leader that drops every other
/// ping keeps the counter hovering instead of resetting it, while a
/// leader that answers again steadily brings it back down to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureCounter {
    value: u32,
    threshold: u32,
}

impl FailureCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            value: 0,
            threshold,
        }
    }

    /// Records one ping outcome and returns the new count.
    pub fn record(&mut self, answered: bool) -> u32 {
        self.value = if answered {
            self.value.saturating_sub(1)
        } else {
            self.value.saturating_add(1)
        };
        self.value
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Returns true once the count has reached the threshold.
    pub fn breached(&self) -> bool {
        self.value >= self.threshold
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }
}

/// Sends one `PING` to `target` and waits up to `timeout` for `PONG`.
///
/// Any failure (send error, silence, a reply that is not `PONG`) counts
/// as a missed heartbeat; the details are only logged.
pub async fn ping(target: SocketAddr, timeout: Duration) -> bool {
    match try_ping(target, timeout).await {
        Ok(answered) => answered,
        Err(e) => {
            debug!(%target, "heartbeat ping failed: {e}");
            false
        }
    }
}

async fn try_ping(target: SocketAddr, timeout: Duration) -> io::Result<bool> {
    let local: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    // connected, so only the leader's replies are delivered
    socket.connect(target).await?;
    socket.send(PING).await?;

    let mut buf = [0u8; 16];
    match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(len)) => {
            let answered = is_pong(&buf[..len]);
            trace!(%target, answered, "heartbeat reply");
            Ok(answered)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            trace!(%target, "heartbeat timed out");
            Ok(false)
        }
    }
}

/// Answers heartbeat pings while the leader holds office.
///
/// The receive loop runs in its own task and is aborted when the
/// responder is dropped, which releases the port.
#[derive(Debug)]
pub struct Responder {
    local_addr: SocketAddr,
    task: JoinHandle<io::Error>,
}

impl Responder {
    /// Binds `addr` and starts answering.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ElectionError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ElectionError::ResponderBind { addr, source })?;
        let local_addr = socket.local_addr()?;
        debug!(%local_addr, "heartbeat responder listening");

        let task = tokio::spawn(serve(socket));
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves with the reason the receive loop stopped. Under normal
    /// operation this never resolves.
    pub async fn closed(&mut self) -> ElectionError {
        match (&mut self.task).await {
            Ok(e) => ElectionError::ResponderStopped(e),
            Err(join) => ElectionError::ResponderStopped(io::Error::new(
                io::ErrorKind::Other,
                join.to_string(),
            )),
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(socket: UdpSocket) -> io::Error {
    let mut buf = [0u8; 64];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                trace!(%from, len, "heartbeat request");
                if let Err(e) = socket.send_to(PONG, from).await {
                    debug!(%from, "failed to answer heartbeat: {e}");
                }
            }
            // some platforms surface ICMP errors from earlier replies here
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) =>
            {
                debug!("ignoring heartbeat socket error: {e}");
            }
            Err(e) => return e,
        }
    }
}
