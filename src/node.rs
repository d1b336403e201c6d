//! # High-Level Node API
//!
//! A [`Node`] binds the overlay socket and wires the protocol engine, the
//! peer/user registry, the built-in handlers and local discovery together.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind(NodeConfig::local("alice")).await?;
//!
//! node.on(EnvelopeKind::Request, "echo", |message, peer, _user| async move {
//!     peer.respond(&message, "echo_resp", message.data.clone()).await?;
//!     Ok(())
//! }).await;
//!
//! node.add_peer("127.0.0.1:8001".parse()?).await?;
//! node.announce().await?;
//!
//! let reply = node.request(Message::named("echo"), peer_addr).await?.wait().await;
//! ```
//!
//! The receive loop hands every datagram to its own task, so a slow
//! handler never delays the next datagram. Those tasks belong to the loop:
//! [`Node::shutdown`] cancels them and waits before clearing engine state.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::cache::PendingReply;
use crate::config::NodeConfig;
use crate::discovery::Discovery;
use crate::dispatch::Handler;
use crate::engine::{Engine, PeerHandle, ProtocolError, UserHandle};
use crate::handlers;
use crate::identity::{Keypair, PublicKey};
use crate::messages::{EnvelopeKind, Message, MAX_DATAGRAM_SIZE};
use crate::protocols::Transport;
use crate::registry::{MemoryRegistry, Registry, UserRecord};

pub struct Node {
    engine: Engine,
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    discovery: Mutex<Option<Discovery>>,
}

impl Node {
    /// Bind a node with an in-memory registry. Keys come from
    /// `config.key_path` when set, otherwise they are generated for this run.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let keypair = match &config.key_path {
            Some(path) => Keypair::load_or_generate(path)?,
            None => Keypair::generate(),
        };
        Self::bind_with(config, keypair, Arc::new(MemoryRegistry::new())).await
    }

    pub async fn bind_with(config: NodeConfig, keypair: Keypair, registry: Arc<dyn Registry>) -> Result<Self> {
        config.validate()?;

        let socket = UdpSocket::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr()?;

        let transport: Arc<dyn Transport> = socket.clone();
        let engine = Engine::new(config.name.clone(), keypair, transport, registry, config.engine.clone())?;
        handlers::install(&engine).await;

        let (stop, stopped) = watch::channel(false);
        let listener = tokio::spawn(serve(socket, engine.clone(), stopped));

        let discovery = if config.discovery.enabled {
            match Discovery::spawn(config.discovery.clone(), local_addr.port(), engine.clone()) {
                Ok(discovery) => Some(discovery),
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "local discovery unavailable");
                    None
                }
            }
        } else {
            None
        };

        info!(
            name = %config.name,
            addr = %local_addr,
            key = %engine.public_key().fingerprint(),
            "node started"
        );

        Ok(Self {
            engine,
            local_addr,
            stop,
            listener: Mutex::new(Some(listener)),
            discovery: Mutex::new(discovery),
        })
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn public_key(&self) -> PublicKey {
        self.engine.public_key()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        self.engine.registry()
    }

    pub async fn register(&self, kind: EnvelopeKind, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.engine.register(kind, name, handler).await;
    }

    pub async fn on<F, Fut>(&self, kind: EnvelopeKind, name: impl Into<String>, f: F)
    where
        F: Fn(Message, PeerHandle, Option<UserHandle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.engine.on(kind, name, f).await;
    }

    /// Add a peer by address and ask it for its directory.
    pub async fn add_peer(&self, addr: SocketAddr) -> Result<bool> {
        Ok(self.engine.admit_peer(addr).await?)
    }

    pub async fn request(&self, message: Message, addr: SocketAddr) -> Result<PendingReply> {
        Ok(self.engine.request(message, addr).await?)
    }

    pub async fn request_all(&self, message: Message) -> Result<PendingReply> {
        Ok(self.engine.request_all(message).await?)
    }

    pub async fn send_to(&self, message: Message, user_name: &str) -> Result<PendingReply> {
        Ok(self.engine.send_to(message, user_name).await?)
    }

    pub async fn broadcast(&self, message: Message) -> Result<PendingReply> {
        Ok(self.engine.broadcast(message).await?)
    }

    /// Record this node as a user and shout `new_user` so other nodes can
    /// address it by name.
    pub async fn announce(&self) -> Result<()> {
        let record = UserRecord {
            name: self.name().to_string(),
            public_key: self.public_key(),
        };
        self.registry().insert_user(record.clone()).await?;
        match self.engine.broadcast(handlers::new_user_message(&record)?).await {
            Ok(_) => {
                debug!(name = %record.name, "announced user");
                Ok(())
            }
            Err(ProtocolError::NoPeers) => {
                debug!(name = %record.name, "no peers to announce to yet");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_running(&self) -> bool {
        match self.listener.try_lock() {
            Ok(listener) => listener.as_ref().is_some_and(|task| !task.is_finished()),
            // held only while shutting down
            Err(_) => true,
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let listener = self.listener.lock().await.take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                warn!(error = %e, "receive loop ended abnormally");
            }
        }
        if let Some(mut discovery) = self.discovery.lock().await.take() {
            discovery.stop();
        }
        self.engine.shutdown().await;
        info!(name = %self.name(), addr = %self.local_addr, "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

async fn serve(socket: Arc<UdpSocket>, engine: Engine, mut stopped: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut inflight = JoinSet::new();
    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    let bytes = buf[..len].to_vec();
                    let engine = engine.clone();
                    inflight.spawn(async move {
                        engine.receive(&bytes, from).await;
                    });
                }
                // ICMP port-unreachable surfaces here on some platforms
                Err(e) => debug!(error = %e, "receive failed"),
            },
            Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
        }
    }
    debug!(inflight = inflight.len(), "receive loop stopping");
    inflight.shutdown().await;
}
