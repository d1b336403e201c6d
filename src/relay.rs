//! Tunnel router.
//!
//! A tunnel is a single relay hop: an envelope tagged with a `tunnel_id`
//! arrives from a backward peer and is passed on to a forward peer. The
//! first envelope on an unknown tunnel picks the forward peer uniformly at
//! random (avoiding the hop it came from when possible) and records the
//! pair, so later envelopes on the same tunnel follow the same path and
//! traffic from the forward side flows back to the backward peer.
//!
//! Tunnel entries live in a [`TtlCache`] with a long expiry.

use std::net::SocketAddr;

use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::trace;

use crate::cache::{TtlCache, TtlConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tunnel {
    pub backward: SocketAddr,
    pub forward: SocketAddr,
}

impl Tunnel {
    /// Next hop for traffic arriving from `from`.
    pub fn destination(&self, from: SocketAddr) -> SocketAddr {
        if from == self.forward {
            self.backward
        } else {
            self.forward
        }
    }
}

pub struct TunnelRouter {
    tunnels: Mutex<TtlCache<String, Tunnel>>,
}

impl TunnelRouter {
    pub fn new(config: TtlConfig) -> Self {
        Self {
            tunnels: Mutex::new(TtlCache::new(config)),
        }
    }

    pub async fn add(&self, tunnel_id: impl Into<String>, tunnel: Tunnel) {
        self.tunnels.lock().await.set(tunnel_id.into(), tunnel);
    }

    pub async fn get(&self, tunnel_id: &str) -> Option<Tunnel> {
        self.tunnels.lock().await.get(&tunnel_id.to_string()).copied()
    }

    /// Pick the next hop for an envelope on `tunnel_id` that arrived from
    /// `from`. `candidates` are the currently known peers; `None` only when
    /// there is no tunnel and no candidate to open one through.
    pub async fn route(
        &self,
        tunnel_id: &str,
        from: SocketAddr,
        candidates: &[SocketAddr],
    ) -> Option<SocketAddr> {
        let mut tunnels = self.tunnels.lock().await;
        let key = tunnel_id.to_string();
        if let Some(tunnel) = tunnels.get(&key).copied() {
            let next = tunnel.destination(from);
            trace!(tunnel = %tunnel_id, from = %from, next = %next, "tunnel hit");
            return Some(next);
        }

        let others: Vec<SocketAddr> = candidates.iter().copied().filter(|c| *c != from).collect();
        let pool = if others.is_empty() { candidates } else { &others[..] };
        let forward = *pool.choose(&mut rand::thread_rng())?;

        tunnels.set(key, Tunnel { backward: from, forward });
        trace!(tunnel = %tunnel_id, from = %from, next = %forward, "tunnel opened");
        Some(forward)
    }

    pub async fn len(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.tunnels.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn miss_opens_tunnel_away_from_sender() {
        let router = TunnelRouter::new(TtlConfig::tunnels());
        let candidates = [addr(1), addr(2)];

        let next = router.route("t1", addr(1), &candidates).await;
        assert_eq!(next, Some(addr(2)));
        assert_eq!(
            router.get("t1").await,
            Some(Tunnel { backward: addr(1), forward: addr(2) })
        );
    }

    #[tokio::test]
    async fn established_tunnel_is_followed_both_ways() {
        let router = TunnelRouter::new(TtlConfig::tunnels());
        router
            .add("t1", Tunnel { backward: addr(1), forward: addr(2) })
            .await;
        let candidates = [addr(1), addr(2), addr(3), addr(4)];

        for _ in 0..10 {
            assert_eq!(router.route("t1", addr(1), &candidates).await, Some(addr(2)));
            assert_eq!(router.route("t1", addr(2), &candidates).await, Some(addr(1)));
        }
        assert_eq!(router.len().await, 1);
    }

    #[tokio::test]
    async fn sole_candidate_is_used_even_if_sender() {
        let router = TunnelRouter::new(TtlConfig::tunnels());
        assert_eq!(router.route("t1", addr(1), &[addr(1)]).await, Some(addr(1)));
    }

    #[tokio::test]
    async fn no_candidates_means_no_route() {
        let router = TunnelRouter::new(TtlConfig::tunnels());
        assert_eq!(router.route("t1", addr(1), &[]).await, None);
        assert!(router.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn tunnels_expire() {
        let config = TtlConfig {
            refresh_interval: Duration::from_secs(1),
            expiry: Duration::from_secs(10),
            capacity: 8,
        };
        let router = TunnelRouter::new(config);
        router
            .add("t1", Tunnel { backward: addr(1), forward: addr(2) })
            .await;

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(router.get("t1").await, None);
    }

    #[tokio::test]
    async fn clear_drops_all_tunnels() {
        let router = TunnelRouter::new(TtlConfig::tunnels());
        router
            .add("t1", Tunnel { backward: addr(1), forward: addr(2) })
            .await;
        router.clear().await;
        assert!(router.is_empty().await);
    }
}
