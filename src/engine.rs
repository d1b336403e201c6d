//! # Protocol Engine
//!
//! Drives every datagram through the inbound state machine and provides
//! the outbound operations handlers and applications build on.
//!
//! ## Inbound
//!
//! ```text
//! bytes ─ decode ─┬─ request ──────────────────────────────┐
//!                 └─ message/shout                          │
//!                     ├─ tunnel_id + relay roll ─ forward   │
//!                     ├─ (exit tunnel: kind = message)      │
//!                     ├─ dedup: seen ─ drop                 │
//!                     └─ flood to all known peers ──────────┤
//!                                                           ▼
//!                  admit unknown hop (+ share request) ─ open / verify
//!                                                           │
//!                           callback pending? ─ fulfill ◄───┤
//!                                                           ▼
//!                                               handlers (kind, name)
//! ```
//!
//! Every failure is local: [`Engine::handle_datagram`] reports it to the
//! caller, nothing is ever sent back to the network because of it.
//!
//! ## Outbound
//!
//! | Operation | Kind | Path | Authenticated |
//! |-----------|------|------|---------------|
//! | [`Engine::send_low`] | any | direct | as built |
//! | [`Engine::request`] | request | direct | no |
//! | [`Engine::request_all`] | request | direct to every peer | no |
//! | [`Engine::send_to`] | message | random peer, fresh tunnel | signed + sealed |
//! | [`Engine::broadcast`] | shout | random peer, then flood | signed |
//!
//! ## Concurrency
//!
//! The engine is a cheap-to-clone handle over shared state. The dedup cache
//! and the callback registry each sit behind a mutex that is never held
//! across network I/O, so a given token is fulfilled at most once even when
//! replies race.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::cache::{CallbackRegistry, DedupCache, PendingReply};
use crate::config::{EngineConfig, DEFAULT_RELAY_PROBABILITY};
use crate::crypto::{self, CryptoError};
use crate::dispatch::{FnHandler, Handler, HandlerTable};
use crate::identity::{Keypair, PublicKey};
use crate::messages::{decode, encode, Envelope, EnvelopeKind, MalformedEnvelope, Message};
use crate::protocols::Transport;
use crate::registry::{Registry, UserRecord};
use crate::relay::TunnelRouter;

/// Name of the peer-exchange request sent to every newly admitted peer.
pub const SHARE_REQUEST: &str = "share";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] MalformedEnvelope),
    #[error("payload could not be decrypted")]
    DecryptionFailed,
    #[error("signature from {sender} failed verification")]
    VerificationFailed { sender: String },
    #[error("unknown sender {0}")]
    UnknownSender(String),
    #[error("no handler for {kind}/{name}")]
    UnhandledRequest { kind: EnvelopeKind, name: String },
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("no known peers")]
    NoPeers,
    #[error("registry error: {0:#}")]
    Registry(anyhow::Error),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("failed to build envelope: {0}")]
    Encode(String),
}

impl From<CryptoError> for ProtocolError {
    fn from(error: CryptoError) -> Self {
        match error {
            CryptoError::DecryptionFailed => ProtocolError::DecryptionFailed,
            CryptoError::Malformed(e) => ProtocolError::Malformed(e),
            other => ProtocolError::Encode(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(error: serde_json::Error) -> Self {
        ProtocolError::Encode(error.to_string())
    }
}

/// What happened to an inbound datagram that was not dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Forwarded along its tunnel; not processed locally.
    Relayed { next_hop: SocketAddr },
    /// Envelope id already seen.
    Duplicate,
    /// Resolved a pending reply; handlers were skipped.
    Fulfilled,
    /// Ran this many handlers.
    Dispatched(usize),
}

struct EngineInner {
    name: String,
    keypair: Keypair,
    transport: Arc<dyn Transport>,
    local_addr: SocketAddr,
    registry: Arc<dyn Registry>,
    handlers: RwLock<HandlerTable>,
    dedup: Mutex<DedupCache>,
    callbacks: Mutex<CallbackRegistry>,
    tunnels: TunnelRouter,
    relay_probability: f64,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.inner.name)
            .field("local_addr", &self.inner.local_addr)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        name: impl Into<String>,
        keypair: Keypair,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn Registry>,
        config: EngineConfig,
    ) -> Result<Self, ProtocolError> {
        let local_addr = transport.local_addr()?;
        let relay_probability = if (0.0..=1.0).contains(&config.relay_probability) {
            config.relay_probability
        } else {
            warn!(
                configured = config.relay_probability,
                fallback = DEFAULT_RELAY_PROBABILITY,
                "relay probability out of range"
            );
            DEFAULT_RELAY_PROBABILITY
        };
        Ok(Self {
            inner: Arc::new(EngineInner {
                name: name.into(),
                keypair,
                transport,
                local_addr,
                registry,
                handlers: RwLock::new(HandlerTable::new()),
                dedup: Mutex::new(DedupCache::new(config.dedup)),
                callbacks: Mutex::new(CallbackRegistry::new(config.callbacks)),
                tunnels: TunnelRouter::new(config.tunnels),
                relay_probability,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.keypair.public_key()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.inner.registry
    }

    pub fn relay_probability(&self) -> f64 {
        self.inner.relay_probability
    }

    pub async fn register(&self, kind: EnvelopeKind, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.inner.handlers.write().await.register(kind, name, handler);
    }

    /// Register an async closure for `(kind, name)`.
    pub async fn on<F, Fut>(&self, kind: EnvelopeKind, name: impl Into<String>, f: F)
    where
        F: Fn(Message, PeerHandle, Option<UserHandle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(kind, name, Arc::new(FnHandler::new(f))).await;
    }

    pub async fn is_handled(&self, kind: EnvelopeKind, name: &str) -> bool {
        self.inner.handlers.read().await.is_registered(kind, name)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Run one inbound datagram through the state machine.
    pub async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) -> Result<Delivery, ProtocolError> {
        trace!(peer = %from, len = bytes.len(), "datagram received");
        let mut envelope = decode(bytes)?;

        if envelope.kind() != EnvelopeKind::Request {
            if let Some(tunnel_id) = envelope.tunnel_id().map(str::to_owned) {
                if self.roll_relay() {
                    let peers = self.peer_addrs().await?;
                    let next_hop = self
                        .inner
                        .tunnels
                        .route(&tunnel_id, from, &peers)
                        .await
                        .ok_or(ProtocolError::NoPeers)?;
                    self.inner.transport.send_datagram(bytes, next_hop).await?;
                    debug!(tunnel = %tunnel_id, from = %from, next = %next_hop, "relayed tunneled envelope");
                    return Ok(Delivery::Relayed { next_hop });
                }
                debug!(tunnel = %tunnel_id, id = %envelope.id(), "envelope exits tunnel here");
                envelope.exit_tunnel();
            }

            let fresh = self.inner.dedup.lock().await.record(&envelope);
            if !fresh {
                debug!(id = %envelope.id(), peer = %from, "duplicate envelope dropped");
                return Ok(Delivery::Duplicate);
            }
            self.flood(&envelope).await?;
        }

        let known_peer = self
            .inner
            .registry
            .lookup_peer(from)
            .await
            .map_err(ProtocolError::Registry)?;
        if known_peer.is_none() {
            if let Err(e) = self.admit_peer(from).await {
                warn!(peer = %from, error = %e, "failed to admit sender");
            }
        }

        let inbound = self.open(&envelope).await?;

        {
            let mut callbacks = self.inner.callbacks.lock().await;
            if callbacks.is_pending(&inbound.message.callback) {
                trace!(token = %inbound.message.callback, peer = %from, "reply fulfilled pending request");
                callbacks.fulfill(inbound.message);
                return Ok(Delivery::Fulfilled);
            }
        }

        let mut peer = PeerHandle::new(from, self.clone());
        peer.claim = inbound.claim.map(Arc::new);
        self.dispatch(envelope.kind(), inbound.message, peer, inbound.user).await
    }

    /// [`handle_datagram`](Self::handle_datagram), logging the outcome by
    /// error class. Used by the receive loop.
    pub async fn receive(&self, bytes: &[u8], from: SocketAddr) {
        match self.handle_datagram(bytes, from).await {
            Ok(delivery) => trace!(peer = %from, ?delivery, "datagram processed"),
            Err(ProtocolError::DecryptionFailed) => {
                trace!(peer = %from, "envelope not addressed to this node")
            }
            Err(
                e @ (ProtocolError::Malformed(_)
                | ProtocolError::VerificationFailed { .. }
                | ProtocolError::UnknownSender(_)
                | ProtocolError::UnhandledRequest { .. }),
            ) => debug!(peer = %from, error = %e, "envelope dropped"),
            Err(e) => warn!(peer = %from, error = %e, "failed to process datagram"),
        }
    }

    fn roll_relay(&self) -> bool {
        rand::thread_rng().gen_bool(self.inner.relay_probability)
    }

    async fn flood(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let bytes = encode(envelope)?;
        let peers = self.peer_addrs().await?;
        let sends = peers.iter().map(|peer| self.inner.transport.send_datagram(&bytes, *peer));
        let results = join_all(sends).await;
        for (peer, result) in peers.iter().zip(results) {
            if let Err(e) = result {
                warn!(peer = %peer, id = %envelope.id(), error = %e, "flood send failed");
            }
        }
        trace!(id = %envelope.id(), peers = peers.len(), "flooded envelope");
        Ok(())
    }

    /// Recover the plaintext message and, when the sender is known, the
    /// verified user behind it. Signatures are checked over the exact
    /// bytes that were signed.
    async fn open(&self, envelope: &Envelope) -> Result<Inbound, ProtocolError> {
        let Some(sender) = envelope.sender() else {
            let opened = crypto::open(envelope.payload(), &self.inner.keypair)?;
            return Ok(Inbound::anonymous(opened.message));
        };

        let record = self
            .inner
            .registry
            .lookup_user(sender)
            .await
            .map_err(ProtocolError::Registry)?;

        let Some(record) = record else {
            if envelope.kind() == EnvelopeKind::Shout && !envelope.payload().is_sealed() {
                // first contact with this name; new_user relies on this path
                let opened = crypto::open(envelope.payload(), &self.inner.keypair)?;
                let claim = envelope.signature().map(|signature| SenderClaim {
                    name: sender.to_string(),
                    signature: signature.to_string(),
                    plaintext: opened.plaintext,
                });
                return Ok(Inbound {
                    message: opened.message,
                    user: None,
                    claim,
                });
            }
            return Err(ProtocolError::UnknownSender(sender.to_string()));
        };

        let opened = crypto::open(envelope.payload(), &self.inner.keypair)?;
        let signature = envelope.signature().unwrap_or_default();
        if !crypto::verify(&opened.plaintext, signature, &record.public_key) {
            return Err(ProtocolError::VerificationFailed {
                sender: sender.to_string(),
            });
        }
        Ok(Inbound {
            message: opened.message,
            user: Some(UserHandle::new(record, self.clone())),
            claim: None,
        })
    }

    async fn dispatch(
        &self,
        kind: EnvelopeKind,
        message: Message,
        peer: PeerHandle,
        user: Option<UserHandle>,
    ) -> Result<Delivery, ProtocolError> {
        let handlers = self.inner.handlers.read().await.handlers_for(kind, &message.name);
        if handlers.is_empty() {
            return Err(ProtocolError::UnhandledRequest {
                kind,
                name: message.name,
            });
        }

        for handler in &handlers {
            if let Err(e) = handler.handle(message.clone(), peer.clone(), user.clone()).await {
                warn!(kind = %kind, name = %message.name, peer = %peer.addr, error = %e, "handler failed");
            }
        }
        Ok(Delivery::Dispatched(handlers.len()))
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    /// Whether `addr` is this node's own socket.
    pub fn is_self(&self, addr: SocketAddr) -> bool {
        let local = self.inner.local_addr;
        if addr == local {
            return true;
        }
        local.ip().is_unspecified() && addr.port() == local.port() && addr.ip().is_loopback()
    }

    /// Idempotently add a peer. A newly added peer is immediately sent a
    /// `share` request. Returns `true` if the peer was new.
    pub async fn admit_peer(&self, addr: SocketAddr) -> Result<bool, ProtocolError> {
        if self.is_self(addr) {
            return Ok(false);
        }
        let inserted = self
            .inner
            .registry
            .insert_peer(addr)
            .await
            .map_err(ProtocolError::Registry)?;
        if inserted {
            info!(peer = %addr, "new peer admitted");
            let share = Envelope::request(Message::named(SHARE_REQUEST));
            self.transmit(&share, addr).await?;
        }
        Ok(inserted)
    }

    /// Known peer addresses, excluding this node.
    pub async fn peer_addrs(&self) -> Result<Vec<SocketAddr>, ProtocolError> {
        let peers = self
            .inner
            .registry
            .list_peers()
            .await
            .map_err(ProtocolError::Registry)?;
        Ok(peers
            .into_iter()
            .map(|peer| peer.addr)
            .filter(|addr| !self.is_self(*addr))
            .collect())
    }

    async fn random_peer(&self) -> Result<SocketAddr, ProtocolError> {
        let peers = self.peer_addrs().await?;
        peers
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or(ProtocolError::NoPeers)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    async fn transmit(&self, envelope: &Envelope, addr: SocketAddr) -> Result<(), ProtocolError> {
        let bytes = encode(envelope)?;
        self.inner.transport.send_datagram(&bytes, addr).await?;
        trace!(peer = %addr, kind = %envelope.kind(), id = %envelope.id(), "envelope sent");
        Ok(())
    }

    async fn send_registered(
        &self,
        envelope: &Envelope,
        token: &str,
        addr: SocketAddr,
    ) -> Result<PendingReply, ProtocolError> {
        let pending = self.inner.callbacks.lock().await.register(token);
        if pending.is_detached() {
            debug!(token = %token, "token already pending; reply goes to the first sender");
        }
        self.transmit(envelope, addr).await?;
        Ok(pending)
    }

    /// Transmit `envelope` to `addr` and open a reply slot keyed by its
    /// callback token. Sealed envelopes have no readable token and get a
    /// detached reply.
    pub async fn send_low(&self, envelope: &Envelope, addr: SocketAddr) -> Result<PendingReply, ProtocolError> {
        match envelope.callback() {
            Some(token) => self.send_registered(envelope, token, addr).await,
            None => {
                self.transmit(envelope, addr).await?;
                Ok(PendingReply::detached(envelope.id()))
            }
        }
    }

    /// Unauthenticated request to one peer.
    pub async fn request(&self, message: Message, addr: SocketAddr) -> Result<PendingReply, ProtocolError> {
        self.send_low(&Envelope::request(message), addr).await
    }

    /// The same request to every known peer. The first reply resolves the
    /// returned handle.
    pub async fn request_all(&self, message: Message) -> Result<PendingReply, ProtocolError> {
        let token = message.callback.clone();
        let envelope = Envelope::request(message);
        let pending = self.inner.callbacks.lock().await.register(&token);
        let peers = self.peer_addrs().await?;
        let results = join_all(peers.iter().map(|peer| self.transmit(&envelope, *peer))).await;
        for (peer, result) in peers.iter().zip(results) {
            if let Err(e) = result {
                warn!(peer = %peer, error = %e, "request send failed");
            }
        }
        debug!(token = %token, peers = peers.len(), "request sent to all peers");
        Ok(pending)
    }

    /// Signed, sealed delivery to `user_name` through a random peer.
    pub async fn send_to(&self, message: Message, user_name: &str) -> Result<PendingReply, ProtocolError> {
        self.send_sealed(message, user_name, true).await
    }

    async fn send_sealed(
        &self,
        message: Message,
        user_name: &str,
        expect_reply: bool,
    ) -> Result<PendingReply, ProtocolError> {
        let user = self
            .inner
            .registry
            .lookup_user(user_name)
            .await
            .map_err(ProtocolError::Registry)?
            .ok_or_else(|| ProtocolError::UnknownUser(user_name.to_string()))?;
        let next_hop = self.random_peer().await?;

        let tunnel_id = uuid::Uuid::new_v4().to_string();
        let envelope = crypto::seal(
            &message,
            &self.inner.name,
            &self.inner.keypair,
            &user.public_key,
            Some(tunnel_id),
        )?;

        debug!(to = %user_name, via = %next_hop, id = %envelope.id(), "sending sealed message");
        if expect_reply {
            self.send_registered(&envelope, &message.callback, next_hop).await
        } else {
            self.transmit(&envelope, next_hop).await?;
            Ok(PendingReply::detached(message.callback))
        }
    }

    /// Signed shout to the whole overlay, entering through a random peer.
    pub async fn broadcast(&self, message: Message) -> Result<PendingReply, ProtocolError> {
        let next_hop = self.random_peer().await?;
        let token = message.callback.clone();
        let envelope = crypto::sign_shout(message, &self.inner.name, &self.inner.keypair)?;
        self.inner.dedup.lock().await.record(&envelope);
        debug!(via = %next_hop, id = %envelope.id(), "broadcasting shout");
        self.send_registered(&envelope, &token, next_hop).await
    }

    /// Drop all transient protocol state.
    pub async fn shutdown(&self) {
        self.inner.dedup.lock().await.clear();
        self.inner.callbacks.lock().await.clear();
        self.inner.tunnels.clear().await;
        debug!(name = %self.inner.name, "engine state cleared");
    }

    pub async fn dedup_len(&self) -> usize {
        self.inner.dedup.lock().await.len()
    }

    pub async fn pending_replies(&self) -> usize {
        self.inner.callbacks.lock().await.len()
    }

    pub async fn tunnel_count(&self) -> usize {
        self.inner.tunnels.len().await
    }
}

struct Inbound {
    message: Message,
    user: Option<UserHandle>,
    claim: Option<SenderClaim>,
}

impl Inbound {
    fn anonymous(message: Message) -> Self {
        Self {
            message,
            user: None,
            claim: None,
        }
    }
}

/// The name an unverified shout was signed under, with what is needed to
/// check that signature against a key learned some other way.
#[derive(Clone, Debug)]
pub struct SenderClaim {
    name: String,
    signature: String,
    plaintext: Vec<u8>,
}

impl SenderClaim {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_signed_by(&self, key: &PublicKey) -> bool {
        crypto::verify(&self.plaintext, &self.signature, key)
    }
}

/// The hop an inbound envelope arrived from.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    addr: SocketAddr,
    engine: Engine,
    claim: Option<Arc<SenderClaim>>,
}

impl PeerHandle {
    pub fn new(addr: SocketAddr, engine: Engine) -> Self {
        Self {
            addr,
            engine,
            claim: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Set when the envelope came from a sender this node cannot verify yet.
    pub fn sender_claim(&self) -> Option<&SenderClaim> {
        self.claim.as_deref()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub async fn request(&self, message: Message) -> Result<PendingReply, ProtocolError> {
        self.engine.request(message, self.addr).await
    }

    /// Fire-and-forget request; no reply slot is opened.
    pub async fn send(&self, message: Message) -> Result<(), ProtocolError> {
        self.engine.transmit(&Envelope::request(message), self.addr).await
    }

    /// Answer `to` with a request that carries the same callback token.
    pub async fn respond(
        &self,
        to: &Message,
        name: impl Into<String>,
        data: Map<String, Value>,
    ) -> Result<(), ProtocolError> {
        self.send(Message::reply(to, name, data)).await
    }
}

/// A verified user who signed an inbound envelope.
#[derive(Clone, Debug)]
pub struct UserHandle {
    record: UserRecord,
    engine: Engine,
}

impl UserHandle {
    pub fn new(record: UserRecord, engine: Engine) -> Self {
        Self { record, engine }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.record.public_key
    }

    pub fn record(&self) -> &UserRecord {
        &self.record
    }

    pub async fn send(&self, message: Message) -> Result<PendingReply, ProtocolError> {
        self.engine.send_to(message, &self.record.name).await
    }

    /// Sealed reply to `to`, reusing its callback token.
    pub async fn respond(
        &self,
        to: &Message,
        name: impl Into<String>,
        data: Map<String, Value>,
    ) -> Result<(), ProtocolError> {
        self.engine
            .send_sealed(Message::reply(to, name, data), &self.record.name, false)
            .await
            .map(|_| ())
    }
}
