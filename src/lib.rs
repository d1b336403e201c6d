pub mod cache;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod dispatch;
pub mod engine;
pub mod handlers;
pub mod identity;
pub mod messages;
mod node;
pub mod protocols;
pub mod registry;
pub mod relay;

pub use cache::PendingReply;
pub use config::{DiscoveryConfig, EngineConfig, NodeConfig};
pub use dispatch::Handler;
pub use engine::{Delivery, Engine, PeerHandle, ProtocolError, SenderClaim, UserHandle};
pub use identity::{Keypair, PublicKey};
pub use messages::{Envelope, EnvelopeKind, Message};
pub use node::Node;
pub use registry::{MemoryRegistry, Registry, UserRecord};
