//! Handler dispatch table.
//!
//! Handlers are registered per `(envelope kind, message name)` and run in
//! registration order once an inbound envelope has passed decoding,
//! decryption and verification. The table is owned by one engine; there is
//! no process-wide handler map.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::{PeerHandle, UserHandle};
use crate::messages::{EnvelopeKind, Message};

/// Application logic for one `(kind, name)` pair.
///
/// `peer` is the hop the envelope arrived from. `user` is the verified
/// sender, when the envelope named one we know.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: Message, peer: PeerHandle, user: Option<UserHandle>) -> Result<()>;
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Message, PeerHandle, Option<UserHandle>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f, _fut: PhantomData }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(Message, PeerHandle, Option<UserHandle>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message, peer: PeerHandle, user: Option<UserHandle>) -> Result<()> {
        (self.f)(message, peer, user).await
    }
}

#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<(EnvelopeKind, String), Vec<Arc<dyn Handler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the list for `(kind, name)`.
    pub fn register(&mut self, kind: EnvelopeKind, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers
            .entry((kind, name.into()))
            .or_default()
            .push(handler);
    }

    /// Handlers for `(kind, name)` in registration order; empty if none.
    pub fn handlers_for(&self, kind: EnvelopeKind, name: &str) -> Vec<Arc<dyn Handler>> {
        self.handlers
            .get(&(kind, name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_registered(&self, kind: EnvelopeKind, name: &str) -> bool {
        self.handlers.contains_key(&(kind, name.to_string()))
    }

    /// Number of distinct `(kind, name)` pairs.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self
            .handlers
            .iter()
            .map(|((kind, name), list)| format!("{kind}/{name} x{}", list.len()))
            .collect();
        keys.sort();
        f.debug_struct("HandlerTable").field("handlers", &keys).finish()
    }
}
