//! Message and actor identity types carried through the gateway.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::{ClientId, SiloAddress};

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// What an actor identity refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorKind {
    /// A grain hosted on some silo.
    Grain,
    /// A grain identity hosted inside a client process.
    ClientGrain,
    /// An anonymous observer on a client, addressable only via a gateway.
    ClientObject,
    /// A system target (membership, directory, ...).
    System,
}

/// Identifier of an actor. Client-hosted actors carry the identity of the
/// client process that hosts them.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ActorId {
    kind: ActorKind,
    client: Option<ClientId>,
    key: u64,
}

impl ActorId {
    pub fn grain(key: u64) -> Self {
        Self {
            kind: ActorKind::Grain,
            client: None,
            key,
        }
    }

    pub fn system(key: u64) -> Self {
        Self {
            kind: ActorKind::System,
            client: None,
            key,
        }
    }

    /// The grain identity of a client process itself.
    pub fn client_grain(client: ClientId) -> Self {
        Self {
            kind: ActorKind::ClientGrain,
            client: Some(client),
            key: 0,
        }
    }

    /// An observer object living on a client, keyed within that client.
    pub fn client_object(client: ClientId, key: u64) -> Self {
        Self {
            kind: ActorKind::ClientObject,
            client: Some(client),
            key,
        }
    }

    pub fn kind(&self) -> ActorKind {
        self.kind
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    /// True if this actor lives inside a client process as a grain identity.
    pub fn is_client_grain(&self) -> bool {
        self.kind == ActorKind::ClientGrain
    }

    /// True if this actor is an anonymous client-addressable object.
    pub fn is_client_addressable_object(&self) -> bool {
        self.kind == ActorKind::ClientObject
    }

    /// The client hosting this actor, for client-hosted kinds.
    pub fn client_id(&self) -> Option<&ClientId> {
        self.client.as_ref()
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.kind, &self.client) {
            (ActorKind::Grain, _) => write!(f, "grain-{}", self.key),
            (ActorKind::System, _) => write!(f, "sys-{}", self.key),
            (ActorKind::ClientGrain, Some(client)) => write!(f, "cli-{client}"),
            (ActorKind::ClientObject, Some(client)) => write!(f, "obs-{client}-{}", self.key),
            // Client kinds always carry a client; unreachable via constructors.
            (kind, None) => write!(f, "{kind:?}-{}", self.key),
        }
    }
}

impl std::fmt::Debug for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActorId({self})")
    }
}

/// Direction of a message with respect to the request/response protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    OneWay = 0,
    Request = 1,
    Response = 2,
}

impl MessageKind {
    /// Parse message kind from byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MessageKind::OneWay),
            1 => Some(MessageKind::Request),
            2 => Some(MessageKind::Response),
            _ => None,
        }
    }
}

/// How a rejection response should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectionKind {
    /// The request cannot be satisfied; the caller sees an error.
    Unrecoverable = 1,
}

impl RejectionKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(RejectionKind::Unrecoverable),
            _ => None,
        }
    }
}

/// Rejection payload attached to a synthesized response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub reason: String,
}

/// A message in flight through the gateway.
///
/// The gateway treats the body as opaque bytes; only the envelope fields
/// participate in routing decisions.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    /// Correlation id matching responses to requests.
    pub id: u64,
    pub sender: ActorId,
    pub target: ActorId,
    pub sending_silo: Option<SiloAddress>,
    pub target_silo: Option<SiloAddress>,
    pub rejection: Option<Rejection>,
    pub body: Bytes,
}

impl Message {
    fn new(kind: MessageKind, sender: ActorId, target: ActorId, body: Bytes) -> Self {
        Self {
            kind,
            id: MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed),
            sender,
            target,
            sending_silo: None,
            target_silo: None,
            rejection: None,
            body,
        }
    }

    pub fn request(sender: ActorId, target: ActorId, body: Bytes) -> Self {
        Self::new(MessageKind::Request, sender, target, body)
    }

    pub fn response(sender: ActorId, target: ActorId, body: Bytes) -> Self {
        Self::new(MessageKind::Response, sender, target, body)
    }

    pub fn one_way(sender: ActorId, target: ActorId, body: Bytes) -> Self {
        Self::new(MessageKind::OneWay, sender, target, body)
    }

    pub fn with_sending_silo(mut self, silo: SiloAddress) -> Self {
        self.sending_silo = Some(silo);
        self
    }

    pub fn with_target_silo(mut self, silo: SiloAddress) -> Self {
        self.target_silo = Some(silo);
        self
    }

    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }

    /// Synthesize a rejection response for this request: sender and target
    /// swap, the correlation id is preserved, and the body is empty.
    pub fn to_rejection(&self, kind: RejectionKind, reason: impl Into<String>) -> Message {
        Message {
            kind: MessageKind::Response,
            id: self.id,
            sender: self.target.clone(),
            target: self.sender.clone(),
            sending_silo: None,
            target_silo: self.sending_silo,
            rejection: Some(Rejection {
                kind,
                reason: reason.into(),
            }),
            body: Bytes::new(),
        }
    }
}
