//! Built-in overlay handlers.
//!
//! | Kind | Name | Effect |
//! |------|------|--------|
//! | request | `ping` | none; liveness check |
//! | request | `share` | reply with a fresh `share_info` request |
//! | request | `share_info` | admit listed peers, record unknown users |
//! | shout | `new_user` | record the announced user if the name is free and the shout is signed by the announced key |
//!
//! `share` is what every node sends to a peer it sees for the first time,
//! so these four handlers are enough for an overlay to assemble itself.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::engine::{Engine, PeerHandle, UserHandle, SHARE_REQUEST};
use crate::messages::{EnvelopeKind, Message};
use crate::registry::{PeerRecord, UserRecord};

pub const PING: &str = "ping";
pub const SHARE_INFO: &str = "share_info";
pub const NEW_USER: &str = "new_user";

/// Payload of `share_info`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShareInfo {
    #[serde(default)]
    pub peers: Vec<PeerRecord>,
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

fn to_data<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("expected an object, got {other}"),
    }
}

fn from_data<T: for<'de> Deserialize<'de>>(message: Message) -> Result<T> {
    let name = message.name;
    serde_json::from_value(Value::Object(message.data))
        .with_context(|| format!("invalid {name} payload"))
}

/// The `new_user` shout announcing `user`.
pub fn new_user_message(user: &UserRecord) -> Result<Message> {
    Ok(Message::new(NEW_USER, to_data(user)?))
}

/// Register the built-in handlers on `engine`.
pub async fn install(engine: &Engine) {
    engine.on(EnvelopeKind::Request, PING, on_ping).await;
    engine.on(EnvelopeKind::Request, SHARE_REQUEST, on_share).await;
    engine.on(EnvelopeKind::Request, SHARE_INFO, on_share_info).await;
    engine.on(EnvelopeKind::Shout, NEW_USER, on_new_user).await;
}

async fn on_ping(_message: Message, peer: PeerHandle, _user: Option<UserHandle>) -> Result<()> {
    debug!(peer = %peer.addr(), "ping");
    Ok(())
}

async fn on_share(_message: Message, peer: PeerHandle, _user: Option<UserHandle>) -> Result<()> {
    let registry = peer.engine().registry();
    let info = ShareInfo {
        peers: registry.list_peers().await?,
        users: registry.list_users().await?,
    };
    debug!(
        peer = %peer.addr(),
        peers = info.peers.len(),
        users = info.users.len(),
        "sharing directory"
    );
    peer.send(Message::new(SHARE_INFO, to_data(&info)?)).await?;
    Ok(())
}

async fn on_share_info(message: Message, peer: PeerHandle, _user: Option<UserHandle>) -> Result<()> {
    let info: ShareInfo = from_data(message)?;
    let engine = peer.engine();

    let mut admitted = 0;
    for record in &info.peers {
        if engine.admit_peer(record.addr).await? {
            admitted += 1;
        }
    }
    let mut learned = 0;
    for user in info.users {
        if engine.registry().insert_user(user).await? {
            learned += 1;
        }
    }
    debug!(peer = %peer.addr(), admitted, learned, "merged shared directory");
    Ok(())
}

/// A `new_user` shout must come from the user it announces.
fn is_self_certified(announced: &UserRecord, peer: &PeerHandle, user: Option<&UserHandle>) -> bool {
    match (user, peer.sender_claim()) {
        (Some(user), _) => user.name() == announced.name && *user.public_key() == announced.public_key,
        (None, Some(claim)) => claim.name() == announced.name && claim.is_signed_by(&announced.public_key),
        (None, None) => false,
    }
}

async fn on_new_user(message: Message, peer: PeerHandle, user: Option<UserHandle>) -> Result<()> {
    let announced: UserRecord = from_data(message)?;
    if !is_self_certified(&announced, &peer, user.as_ref()) {
        debug!(user = %announced.name, peer = %peer.addr(), "ignored new_user not signed by the announced key");
        return Ok(());
    }
    let name = announced.name.clone();
    let key = announced.public_key.fingerprint();
    if peer.engine().registry().insert_user(announced).await? {
        info!(user = %name, key = %key, "learned new user");
    } else {
        debug!(user = %name, "user already known");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::config::EngineConfig;
    use crate::crypto;
    use crate::engine::{Delivery, ProtocolError};
    use crate::identity::Keypair;
    use crate::messages::{decode, encode, Envelope};
    use crate::protocols::Transport;
    use crate::registry::{MemoryRegistry, Registry};

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    #[async_trait]
    impl Transport for Outbox {
        async fn send_datagram(&self, bytes: &[u8], to: SocketAddr) -> std::io::Result<()> {
            self.sent.lock().unwrap().push((to, bytes.to_vec()));
            Ok(())
        }

        fn local_addr(&self) -> std::io::Result<SocketAddr> {
            Ok(addr(6000))
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn node() -> (Engine, Arc<Outbox>, Arc<MemoryRegistry>) {
        let outbox = Arc::new(Outbox::default());
        let registry = Arc::new(MemoryRegistry::new());
        let engine = Engine::new(
            "self",
            Keypair::generate(),
            outbox.clone(),
            registry.clone(),
            EngineConfig::default(),
        )
        .unwrap();
        install(&engine).await;
        (engine, outbox, registry)
    }

    fn user(name: &str) -> UserRecord {
        UserRecord {
            name: name.into(),
            public_key: Keypair::generate().public_key(),
        }
    }

    #[tokio::test]
    async fn share_replies_with_directory() {
        let (engine, outbox, registry) = node().await;
        registry.insert_peer(addr(6001)).await.unwrap();
        registry.insert_peer(addr(6002)).await.unwrap();
        registry.insert_user(user("alice")).await.unwrap();

        let share = Envelope::request(Message::named(SHARE_REQUEST).with_callback("s1"));
        let delivery = engine
            .handle_datagram(&encode(&share).unwrap(), addr(6001))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Dispatched(1));

        let sent = outbox.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(6001));
        let reply = decode(&sent[0].1).unwrap();
        let message = reply.payload().as_plain().unwrap().clone();
        assert_eq!(message.name, SHARE_INFO);
        assert_ne!(message.callback, "s1");

        let info: ShareInfo = from_data(message).unwrap();
        assert_eq!(info.peers.len(), 2);
        assert_eq!(info.users.len(), 1);
        assert_eq!(info.users[0].name, "alice");
    }

    #[tokio::test]
    async fn share_info_merges_idempotently() {
        let (engine, outbox, registry) = node().await;
        registry.insert_peer(addr(6001)).await.unwrap();
        let alice = user("alice");
        let info = ShareInfo {
            peers: vec![
                PeerRecord { addr: addr(6001) },
                PeerRecord { addr: addr(6002) },
                PeerRecord { addr: addr(6000) },
            ],
            users: vec![alice.clone()],
        };
        let bytes = encode(&Envelope::request(Message::new(SHARE_INFO, to_data(&info).unwrap()))).unwrap();

        engine.handle_datagram(&bytes, addr(6001)).await.unwrap();
        let again = encode(&Envelope::request(Message::new(SHARE_INFO, to_data(&info).unwrap()))).unwrap();
        engine.handle_datagram(&again, addr(6001)).await.unwrap();

        let mut peers: Vec<SocketAddr> = registry
            .list_peers()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.addr)
            .collect();
        peers.sort();
        assert_eq!(peers, vec![addr(6001), addr(6002)]);
        assert_eq!(registry.list_users().await.unwrap(), vec![alice]);

        // only the newly admitted peer is asked to share
        let sent = outbox.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(6002));
    }

    fn announcement(name: &str) -> (Keypair, UserRecord) {
        let keypair = Keypair::generate();
        let record = UserRecord {
            name: name.into(),
            public_key: keypair.public_key(),
        };
        (keypair, record)
    }

    async fn deliver_new_user(engine: &Engine, record: &UserRecord, sender: &str, signer: &Keypair) {
        let shout = crypto::sign_shout(new_user_message(record).unwrap(), sender, signer).unwrap();
        engine
            .handle_datagram(&encode(&shout).unwrap(), addr(6001))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn new_user_shout_is_first_key_wins() {
        let (engine, _outbox, registry) = node().await;
        registry.insert_peer(addr(6001)).await.unwrap();

        let (carol_keys, carol) = announcement("carol");
        deliver_new_user(&engine, &carol, "carol", &carol_keys).await;
        assert_eq!(registry.lookup_user("carol").await.unwrap(), Some(carol.clone()));

        // a second, properly self-signed claim on the name does not replace it
        let (other_keys, other) = announcement("carol");
        let shout = crypto::sign_shout(new_user_message(&other).unwrap(), "carol", &other_keys).unwrap();
        let result = engine.handle_datagram(&encode(&shout).unwrap(), addr(6001)).await;
        assert!(matches!(result, Err(ProtocolError::VerificationFailed { .. })));
        assert_eq!(registry.lookup_user("carol").await.unwrap(), Some(carol));
    }

    #[tokio::test]
    async fn new_user_must_be_signed_by_announced_key() {
        let (engine, _outbox, registry) = node().await;
        registry.insert_peer(addr(6001)).await.unwrap();

        let (_carol_keys, carol) = announcement("carol");
        let mallory = Keypair::generate();
        deliver_new_user(&engine, &carol, "carol", &mallory).await;
        assert_eq!(registry.lookup_user("carol").await.unwrap(), None);
    }

    #[tokio::test]
    async fn new_user_sender_must_match_announced_name() {
        let (engine, _outbox, registry) = node().await;
        registry.insert_peer(addr(6001)).await.unwrap();

        let (carol_keys, carol) = announcement("carol");
        deliver_new_user(&engine, &carol, "mallory", &carol_keys).await;
        assert_eq!(registry.lookup_user("carol").await.unwrap(), None);
        assert_eq!(registry.lookup_user("mallory").await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_share_info_does_not_touch_registry() {
        let (engine, _outbox, registry) = node().await;
        registry.insert_peer(addr(6001)).await.unwrap();
        let mut data = Map::new();
        data.insert("peers".into(), Value::String("nope".into()));
        let bytes = encode(&Envelope::request(Message::new(SHARE_INFO, data))).unwrap();

        // handler failures are logged, not surfaced as protocol errors
        let delivery = engine.handle_datagram(&bytes, addr(6001)).await.unwrap();
        assert_eq!(delivery, Delivery::Dispatched(1));
        assert_eq!(registry.list_peers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn builtins_are_registered() {
        let (engine, _outbox, _registry) = node().await;
        assert!(engine.is_handled(EnvelopeKind::Request, PING).await);
        assert!(engine.is_handled(EnvelopeKind::Request, SHARE_REQUEST).await);
        assert!(engine.is_handled(EnvelopeKind::Request, SHARE_INFO).await);
        assert!(engine.is_handled(EnvelopeKind::Shout, NEW_USER).await);
    }
}
