//! Client gateway for a distributed virtual-actor runtime.
//!
//! The gateway is the edge component of a silo: it terminates long-lived
//! client connections, multiplexes outbound traffic onto a fixed pool of
//! sender workers, and keeps the mapping from proxied actor identities back
//! to the client connection that hosts them. Any silo in the cluster can
//! deliver a message to any client by routing it through the gateway the
//! client happens to be attached to.

pub mod client;
pub mod config;
pub mod framing;
pub mod gateway;
pub mod message;
pub(crate) mod registry;
pub mod routing;
pub mod sender;
pub mod socket;
#[cfg(any(test, feature = "test-helpers", debug_assertions))]
pub mod test_support;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub use client::ClientState;
pub use config::GatewayConfig;
pub use framing::{EnvelopeSerializer, MessageSerializer, SerializedFrame};
pub use gateway::{ClientRegistrar, Gateway, GatewayStats, MessageCenter};
pub use message::{ActorId, ActorKind, Message, MessageKind, Rejection, RejectionKind};
pub use routing::ReplyRoutingCache;
pub use socket::{GatewaySocket, SocketId, TcpGatewaySocket};

/// Identity of a connected client process.
///
/// Cheap to clone; equality and hashing delegate to the underlying string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Arc<str>);

impl ClientId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ClientId").field(&&*self.0).finish()
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Network identity of a cluster node: endpoint plus instance generation.
///
/// The generation distinguishes successive incarnations of a silo on the
/// same endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiloAddress {
    endpoint: SocketAddr,
    generation: u32,
}

impl SiloAddress {
    pub fn new(endpoint: SocketAddr, generation: u32) -> Self {
        Self {
            endpoint,
            generation,
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}:{}", self.endpoint, self.generation)
    }
}

impl std::fmt::Debug for SiloAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SiloAddress({self})")
    }
}

impl std::str::FromStr for SiloAddress {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix('S').ok_or_else(|| {
            GatewayError::InvalidConfig(format!("silo address missing 'S' prefix: {s}"))
        })?;
        let (endpoint, generation) = rest.rsplit_once(':').ok_or_else(|| {
            GatewayError::InvalidConfig(format!("silo address missing generation: {s}"))
        })?;
        let endpoint = endpoint
            .parse()
            .map_err(|e| GatewayError::InvalidConfig(format!("bad silo endpoint {s}: {e}")))?;
        let generation = generation
            .parse()
            .map_err(|e| GatewayError::InvalidConfig(format!("bad silo generation {s}: {e}")))?;
        Ok(Self::new(endpoint, generation))
    }
}

/// Errors produced by the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rkyv::rancor::Error),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("gateway shutdown")]
    Shutdown,
}

impl GatewayError {
    /// True for failures produced while encoding a message, as opposed to
    /// failures of the socket it was being written to. The send path drops
    /// the message on the former and closes the socket on the latter.
    pub fn is_serialization_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::Serialization(_) | GatewayError::MessageTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Sentinel for "connected": the disconnect timestamp of a client with a
/// live socket.
pub const NEVER_DISCONNECTED: u64 = u64::MAX;

/// Current wall-clock time in milliseconds since the unix epoch.
pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}
