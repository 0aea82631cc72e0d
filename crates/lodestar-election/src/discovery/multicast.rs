//! Discovery over UDP multicast.
//!
//! A published service sends its advertisement to the multicast group
//! once per announce interval. A scan joins the group and waits for the
//! first advertisement of the requested type. The advertised address is
//! the datagram's source address, so publishers never need to know their
//! own externally visible IP.
//!
//! Scanners bind the group port with address reuse, so any number of
//! instances on one host can scan at the same time; the kernel delivers
//! every group datagram to each of them.
//!
//! This is a private format, not mDNS/DNS-SD. Advertisements are only
//! visible to other lodestar instances, and lodestar does not see
//! Bonjour services. Plugging a real mDNS responder in means another
//! [`DiscoverySource`] implementation; the heartbeat strategy does not
//! care which one it gets.
//!
//! # Wire format
//!
//! ```text
//! magic "LDST" | version u8 | port u16 | type_len u16 | type | name_len u16 | name
//! ```
//!
//! Integers are little-endian; strings are UTF-8. Datagrams that do not
//! parse are dropped.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use super::{Advertisement, DiscoverySource, Publication};
use crate::ElectionError;

const MAGIC: &[u8; 4] = b"LDST";
const VERSION: u8 = 1;

/// Longest type or name accepted on the wire.
const MAX_FIELD_LEN: usize = 255;

/// Settings for [`MulticastDiscovery`].
#[derive(Debug, Clone, Copy)]
pub struct MulticastConfig {
    pub group: SocketAddrV4,
    /// Local interface used to join the group.
    pub interface: Ipv4Addr,
    pub announce_interval: Duration,
    pub ttl: u32,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: SocketAddrV4::new(Ipv4Addr::new(239, 255, 42, 99), 5454),
            interface: Ipv4Addr::UNSPECIFIED,
            announce_interval: Duration::from_secs(1),
            ttl: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MulticastDiscovery {
    config: MulticastConfig,
}

impl MulticastDiscovery {
    pub fn new(config: MulticastConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MulticastConfig {
        &self.config
    }
}

impl Default for MulticastDiscovery {
    fn default() -> Self {
        Self::new(MulticastConfig::default())
    }
}

#[async_trait]
impl DiscoverySource for MulticastDiscovery {
    async fn publish(
        &self,
        name: &str,
        service_type: &str,
        port: u16,
    ) -> Result<Publication, ElectionError> {
        let payload = encode(name, service_type, port)?;

        let socket = UdpSocket::bind((self.config.interface, 0))
            .await
            .map_err(|e| ElectionError::Discovery(format!("failed to bind announcer: {e}")))?;
        socket
            .set_multicast_ttl_v4(self.config.ttl)
            .map_err(|e| ElectionError::Discovery(format!("failed to set multicast ttl: {e}")))?;
        socket
            .set_multicast_loop_v4(true)
            .map_err(|e| ElectionError::Discovery(format!("failed to enable loopback: {e}")))?;

        let group = SocketAddr::V4(self.config.group);
        let every = self.config.announce_interval;
        debug!(name, service_type, port, %group, "publishing advertisement");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = socket.send_to(&payload, group).await {
                    // keep announcing; the network may come back
                    warn!(%group, "failed to send advertisement: {e}");
                }
            }
        });

        Ok(Publication::new(task))
    }

    async fn find_once(
        &self,
        service_type: &str,
        timeout: Duration,
    ) -> Result<Option<Advertisement>, ElectionError> {
        let port = self.config.group.port();
        let socket = scanner_socket(port)
            .map_err(|e| ElectionError::Discovery(format!("failed to bind scanner on {port}: {e}")))?;
        socket
            .join_multicast_v4(*self.config.group.ip(), self.config.interface)
            .map_err(|e| ElectionError::Discovery(format!("failed to join group: {e}")))?;

        let scan = async {
            let mut buf = vec![0u8; 1024];
            loop {
                let (len, from) = socket.recv_from(&mut buf).await?;
                match decode(&buf[..len]) {
                    Ok((name, ty, port)) if ty == service_type => {
                        return Ok::<_, io::Error>(Advertisement {
                            name,
                            service_type: ty,
                            port,
                            addresses: vec![from.ip()],
                        });
                    }
                    Ok((_, ty, _)) => trace!(%from, ty = %ty, "ignoring advertisement of other type"),
                    Err(e) => trace!(%from, "dropping malformed advertisement: {e}"),
                }
            }
        };

        match tokio::time::timeout(timeout, scan).await {
            Ok(Ok(ad)) => Ok(Some(ad)),
            Ok(Err(e)) => Err(ElectionError::Discovery(format!("scan failed: {e}"))),
            Err(_) => Ok(None),
        }
    }
}

/// Binds the group port for scanning, shared with other scanners.
fn scanner_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

// Safe read helpers that return io::Error instead of panicking on truncated input.

fn safe_get_u8(buf: &mut &[u8]) -> io::Result<u8> {
    if buf.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 1 byte"));
    }
    Ok(buf.get_u8())
}

fn safe_get_u16_le(buf: &mut &[u8]) -> io::Result<u16> {
    if buf.len() < 2 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 2 bytes"));
    }
    Ok(buf.get_u16_le())
}

fn safe_get_str(buf: &mut &[u8]) -> io::Result<String> {
    let len = safe_get_u16_le(buf)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("field length {len} exceeds {MAX_FIELD_LEN}"),
        ));
    }
    if buf.len() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("need {len} bytes"),
        ));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Serializes an advertisement.
fn encode(name: &str, service_type: &str, port: u16) -> Result<Bytes, ElectionError> {
    for field in [name, service_type] {
        if field.len() > MAX_FIELD_LEN {
            return Err(ElectionError::Configuration(format!(
                "advertised field longer than {MAX_FIELD_LEN} bytes: {field:?}"
            )));
        }
    }
    let mut buf = BytesMut::with_capacity(11 + name.len() + service_type.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u16_le(port);
    put_str(&mut buf, service_type);
    put_str(&mut buf, name);
    Ok(buf.freeze())
}

/// Parses an advertisement into `(name, type, port)`.
fn decode(mut buf: &[u8]) -> io::Result<(String, String, u16)> {
    if buf.len() < MAGIC.len() || &buf[..MAGIC.len()] != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
    }
    buf.advance(MAGIC.len());

    let version = safe_get_u8(&mut buf)?;
    if version != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported version {version}"),
        ));
    }

    let port = safe_get_u16_le(&mut buf)?;
    let service_type = safe_get_str(&mut buf)?;
    let name = safe_get_str(&mut buf)?;
    Ok((name, service_type, port))
}
