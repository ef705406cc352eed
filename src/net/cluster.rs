//! Loose cluster membership over a UDP bus.
//!
//! Every node in cluster mode opens a datagram socket on `listening port +
//! 10000` and lists itself as a member. A JOIN announcement adds the sender
//! to the member list (deduplicated by host:port) and is answered with the
//! current list, so a newcomer learns the rest of the cluster from any one
//! seed. There is no replication and no quorum, membership gossip only.

use super::codec::{split_frame, ProtocolError};
use super::message::{Request, Response};
use crate::types::BUS_PORT_OFFSET;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Largest datagram the bus will accept.
const MAX_BUS_FRAME: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("bus port overflows for listening port {0}")]
    BusPort(u16),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
}

/// One cluster member. Exactly one member has `is_self` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub host: String,
    pub port: u16,
    pub is_self: bool,
}

impl Member {
    /// UDP bus address of this member.
    fn bus_addr(&self) -> Result<(String, u16), ClusterError> {
        let bus_port = self
            .port
            .checked_add(BUS_PORT_OFFSET)
            .ok_or(ClusterError::BusPort(self.port))?;
        Ok((self.host.clone(), bus_port))
    }
}

pub struct Cluster {
    members: Mutex<Vec<Member>>,
    socket: UdpSocket,
    self_host: String,
    self_port: u16,
}

impl Cluster {
    /// Bind the bus socket and list ourselves as the first member.
    pub async fn bind(host: &str, listen_port: u16) -> Result<Self, ClusterError> {
        let bus_port = listen_port
            .checked_add(BUS_PORT_OFFSET)
            .ok_or(ClusterError::BusPort(listen_port))?;
        let socket = UdpSocket::bind((host, bus_port)).await?;
        info!("cluster bus listening on {}:{}", host, bus_port);
        Ok(Self {
            members: Mutex::new(vec![Member {
                host: host.to_string(),
                port: listen_port,
                is_self: true,
            }]),
            socket,
            self_host: host.to_string(),
            self_port: listen_port,
        })
    }

    /// Known members as `(host, port)` pairs, self included.
    pub async fn member_list(&self) -> Vec<(String, u16)> {
        self.members
            .lock()
            .await
            .iter()
            .map(|m| (m.host.clone(), m.port))
            .collect()
    }

    /// Add a member unless it is already listed (or is this node).
    /// Returns true when the list grew.
    pub async fn add_member(&self, host: &str, port: u16) -> bool {
        if host == self.self_host && port == self.self_port {
            return false;
        }
        let mut members = self.members.lock().await;
        if members.iter().any(|m| m.host == host && m.port == port) {
            return false;
        }
        info!("cluster member joined: {}:{}", host, port);
        members.push(Member {
            host: host.to_string(),
            port,
            is_self: false,
        });
        true
    }

    /// Announce this node to a seed's bus port.
    pub async fn announce(&self, seed_host: &str, seed_port: u16) -> Result<(), ClusterError> {
        let seed = Member {
            host: seed_host.to_string(),
            port: seed_port,
            is_self: false,
        };
        let addr = format!("{}:{}", self.self_host, self.self_port);
        let frame = Request::Join {
            addr: addr.into_bytes(),
        }
        .encode()?;
        self.socket.send_to(&frame, seed.bus_addr()?).await?;
        self.add_member(seed_host, seed_port).await;
        debug!("sent JOIN to seed {}:{}", seed_host, seed_port);
        Ok(())
    }

    /// Receive loop: handle JOIN announcements and peer-list replies until
    /// shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_BUS_FRAME];
        loop {
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (len, src) = match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("cluster bus recv failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.handle_datagram(&buf[..len], src).await {
                debug!("ignoring bus frame from {}: {}", src, e);
            }
        }
        debug!("cluster bus loop exited");
    }

    async fn handle_datagram(&self, bytes: &[u8], src: SocketAddr) -> Result<(), ClusterError> {
        let (header, body) = split_frame(bytes, MAX_BUS_FRAME)?;
        if header.request {
            if let Request::Join { addr } = Request::decode(header, body)? {
                if let Some((host, port)) = parse_host_port(&addr) {
                    self.add_member(&host, port).await;
                    let reply = Response::Members(self.member_list().await).encode(true)?;
                    self.socket.send_to(&reply, src).await?;
                }
            }
            return Ok(());
        }
        match Response::decode_body(header, body)? {
            Response::Members(members) => {
                for (host, port) in members {
                    self.add_member(&host, port).await;
                }
            }
            Response::Ack { .. } => {}
            other => debug!("unexpected bus response from {}: {:?}", src, other),
        }
        Ok(())
    }
}

/// Split a `host:port` announcement. The port is the rightmost component so
/// IPv6 hosts with colons survive.
pub fn parse_host_port(addr: &[u8]) -> Option<(String, u16)> {
    let text = std::str::from_utf8(addr).ok()?;
    let (host, port) = text.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

/// Fire a single JOIN announcement at `host:port + 10000` from an ephemeral
/// socket. Used by the `join` subcommand before the server starts.
pub async fn send_join(
    host: &str,
    port: u16,
    self_host: &str,
    self_port: u16,
) -> Result<(), ClusterError> {
    let bus_port = port
        .checked_add(BUS_PORT_OFFSET)
        .ok_or(ClusterError::BusPort(port))?;
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let frame = Request::Join {
        addr: format!("{}:{}", self_host, self_port).into_bytes(),
    }
    .encode()?;
    socket.send_to(&frame, (host, bus_port)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port(b"10.0.0.1:8998"),
            Some(("10.0.0.1".to_string(), 8998))
        );
        assert_eq!(
            parse_host_port(b"::1:9000"),
            Some(("::1".to_string(), 9000))
        );
        assert_eq!(parse_host_port(b"nohost"), None);
        assert_eq!(parse_host_port(b":123"), None);
        assert_eq!(parse_host_port(b"h:notaport"), None);
    }

    #[tokio::test]
    async fn test_member_dedup() {
        let cluster = Cluster::bind("127.0.0.1", 0).await.unwrap();
        assert!(cluster.add_member("10.0.0.2", 9000).await);
        assert!(!cluster.add_member("10.0.0.2", 9000).await);
        // Adding ourselves is a no-op.
        assert!(!cluster.add_member("127.0.0.1", 0).await);
        assert_eq!(cluster.member_list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_join_exchange_between_two_buses() {
        let a = std::sync::Arc::new(Cluster::bind("127.0.0.1", 21001).await.unwrap());
        let b = Cluster::bind("127.0.0.1", 21002).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let a_task = {
            let a = a.clone();
            tokio::spawn(async move { a.run(shutdown_rx).await })
        };

        b.announce("127.0.0.1", 21001).await.unwrap();

        // A should learn about B; the peer-list reply lands on B's socket.
        let mut buf = vec![0u8; MAX_BUS_FRAME];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            b.socket.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        let reply = Response::decode(&buf[..len], MAX_BUS_FRAME).unwrap();
        match reply {
            Response::Members(members) => {
                assert!(members.contains(&("127.0.0.1".to_string(), 21001)));
                assert!(members.contains(&("127.0.0.1".to_string(), 21002)));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(a
            .member_list()
            .await
            .contains(&("127.0.0.1".to_string(), 21002)));

        shutdown_tx.send(true).unwrap();
        a_task.await.unwrap();
    }
}
