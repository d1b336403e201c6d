//! Local peer discovery over IPv4 multicast.
//!
//! Every `interval` a node multicasts a small announce naming its protocol
//! and the port its overlay socket listens on:
//!
//! ```text
//! {"prt": {"nm": "murmur", "v": "0.1.0"}, "gl": "LPD", "dt": {"prt": 8000}}
//! ```
//!
//! Announces heard from other nodes become [`PeerObserved`] events, which
//! are fed to [`Engine::admit_peer`]. Admission is idempotent, so hearing
//! the same node every interval is harmless.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::DiscoveryConfig;
use crate::engine::Engine;

/// Goal tag carried by every announce.
pub const GOAL_LPD: &str = "LPD";

const MAX_ANNOUNCE_SIZE: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolTag {
    #[serde(rename = "nm")]
    pub name: String,
    #[serde(rename = "v")]
    pub version: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceData {
    #[serde(rename = "prt")]
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    #[serde(rename = "prt")]
    pub protocol: ProtocolTag,
    #[serde(rename = "gl")]
    pub goal: String,
    #[serde(rename = "dt")]
    pub data: AnnounceData,
}

impl Announce {
    pub fn new(config: &DiscoveryConfig, listen_port: u16) -> Self {
        Self {
            protocol: ProtocolTag {
                name: config.protocol_name.clone(),
                version: config.protocol_version.clone(),
            },
            goal: GOAL_LPD.to_string(),
            data: AnnounceData { port: listen_port },
        }
    }
}

/// A node heard on the discovery group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerObserved {
    pub addr: SocketAddr,
}

/// Turn one multicast datagram into a peer event. Datagrams for another
/// protocol or goal are ignored.
pub fn parse_announce(bytes: &[u8], src: SocketAddr, config: &DiscoveryConfig) -> Option<PeerObserved> {
    let announce: Announce = serde_json::from_slice(bytes).ok()?;
    if announce.goal != GOAL_LPD || announce.protocol.name != config.protocol_name {
        return None;
    }
    if announce.data.port == 0 {
        return None;
    }
    if announce.protocol.version != config.protocol_version {
        debug!(
            peer = %src,
            theirs = %announce.protocol.version,
            ours = %config.protocol_version,
            "peer announces a different protocol version"
        );
    }
    Some(PeerObserved {
        addr: SocketAddr::new(src.ip(), announce.data.port),
    })
}

fn multicast_socket(config: &DiscoveryConfig) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create discovery socket")?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
    socket
        .bind(&bind.into())
        .with_context(|| format!("failed to bind discovery port {}", config.port))?;
    socket
        .join_multicast_v4(&config.group, &Ipv4Addr::UNSPECIFIED)
        .with_context(|| format!("failed to join multicast group {}", config.group))?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("failed to register discovery socket")
}

/// Running discovery tasks. Dropping the handle stops them.
pub struct Discovery {
    tasks: Vec<JoinHandle<()>>,
}

impl Discovery {
    /// Join the discovery group and start announcing `listen_port`.
    pub fn spawn(config: DiscoveryConfig, listen_port: u16, engine: Engine) -> Result<Self> {
        let socket = Arc::new(multicast_socket(&config)?);
        let target = SocketAddr::V4(SocketAddrV4::new(config.group, config.port));
        let announce = serde_json::to_vec(&Announce::new(&config, listen_port))?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let announcer = tokio::spawn(announce_loop(socket.clone(), target, announce, config.interval));
        let listener = tokio::spawn(listen_loop(socket, config.clone(), events_tx));
        let admitter = tokio::spawn(admit_loop(events_rx, engine));

        info!(group = %config.group, port = config.port, listen_port, "discovery started");
        Ok(Self {
            tasks: vec![announcer, listener, admitter],
        })
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn announce_loop(socket: Arc<UdpSocket>, target: SocketAddr, announce: Vec<u8>, every: tokio::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match socket.send_to(&announce, target).await {
            Ok(_) => trace!(group = %target, "announce sent"),
            Err(e) => warn!(group = %target, error = %e, "failed to send announce"),
        }
    }
}

async fn listen_loop(socket: Arc<UdpSocket>, config: DiscoveryConfig, events: mpsc::Sender<PeerObserved>) {
    let mut buf = [0u8; MAX_ANNOUNCE_SIZE];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "discovery receive failed");
                continue;
            }
        };
        let Some(event) = parse_announce(&buf[..len], src, &config) else {
            trace!(peer = %src, "ignored foreign multicast datagram");
            continue;
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}

async fn admit_loop(mut events: mpsc::Receiver<PeerObserved>, engine: Engine) {
    while let Some(PeerObserved { addr }) = events.recv().await {
        if let Err(e) = engine.admit_peer(addr).await {
            warn!(peer = %addr, error = %e, "failed to admit discovered peer");
        }
    }
}
