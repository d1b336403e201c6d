//! Peer and user directory.
//!
//! The engine only ever runs short transactions against a [`Registry`]: one
//! insert or lookup per call, never held across another await. Durable
//! backends implement the trait; [`MemoryRegistry`] is the default.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::identity::PublicKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRecord {
    #[serde(rename = "address")]
    pub addr: SocketAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    #[serde(rename = "key")]
    pub public_key: PublicKey,
}

#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Insert a peer. Inserting a known address is a no-op that returns
    /// `false`.
    async fn insert_peer(&self, addr: SocketAddr) -> Result<bool>;

    async fn lookup_peer(&self, addr: SocketAddr) -> Result<Option<PeerRecord>>;

    async fn list_peers(&self) -> Result<Vec<PeerRecord>>;

    /// Insert a user. An existing name keeps its original key and the call
    /// returns `false`.
    async fn insert_user(&self, user: UserRecord) -> Result<bool>;

    async fn lookup_user(&self, name: &str) -> Result<Option<UserRecord>>;

    async fn list_users(&self) -> Result<Vec<UserRecord>>;
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    peers: RwLock<HashMap<SocketAddr, PeerRecord>>,
    users: RwLock<HashMap<String, UserRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn insert_peer(&self, addr: SocketAddr) -> Result<bool> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&addr) {
            return Ok(false);
        }
        peers.insert(addr, PeerRecord { addr });
        Ok(true)
    }

    async fn lookup_peer(&self, addr: SocketAddr) -> Result<Option<PeerRecord>> {
        Ok(self.peers.read().await.get(&addr).copied())
    }

    async fn list_peers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.peers.read().await.values().copied().collect())
    }

    async fn insert_user(&self, user: UserRecord) -> Result<bool> {
        let mut users = self.users.write().await;
        if users.contains_key(&user.name) {
            return Ok(false);
        }
        users.insert(user.name.clone(), user);
        Ok(true)
    }

    async fn lookup_user(&self, name: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.read().await.get(name).cloned())
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.users.read().await.values().cloned().collect())
    }
}
