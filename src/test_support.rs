//! Test doubles for the gateway's collaborators.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::framing::{decode_client_frame, WireEnvelope, LENGTH_PREFIX_LEN};
use crate::gateway::{ClientRegistrar, MessageCenter};
use crate::message::{ActorId, Message, MessageKind};
use crate::socket::{GatewaySocket, SocketId};
use crate::ClientId;

/// How the next `send` on a [`MockSocket`] should fail.
#[derive(Debug, Clone, Copy)]
pub enum SendFailure {
    /// Return an I/O error.
    Error(io::ErrorKind),
    /// Report this many bytes written regardless of the payload size.
    Short(usize),
}

/// In-memory socket recording everything written to it, with a
/// programmable failure plan.
pub struct MockSocket {
    id: SocketId,
    endpoint: Mutex<Option<String>>,
    sent: Mutex<Vec<u8>>,
    failures: Mutex<VecDeque<SendFailure>>,
    closed: AtomicBool,
}

impl MockSocket {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            id: SocketId::next(),
            endpoint: Mutex::new(Some(endpoint.into())),
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a failure for an upcoming `send`; failures apply in order.
    pub fn fail_next(&self, failure: SendFailure) {
        self.failures.lock().expect("failure lock").push_back(failure);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Everything successfully written, as one byte stream.
    pub fn sent_bytes(&self) -> Vec<u8> {
        self.sent.lock().expect("sent lock").clone()
    }

    /// Decode the written byte stream back into wire envelopes.
    pub fn sent_envelopes(&self) -> Vec<(MessageKind, WireEnvelope)> {
        decode_frames(&self.sent_bytes())
    }
}

#[async_trait]
impl GatewaySocket for MockSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn remote_endpoint(&self) -> String {
        self.endpoint
            .lock()
            .expect("endpoint lock")
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn send(&self, buffers: &[Bytes]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        }
        if let Some(failure) = self.failures.lock().expect("failure lock").pop_front() {
            match failure {
                SendFailure::Error(kind) => {
                    return Err(io::Error::new(kind, "planned send failure"))
                }
                SendFailure::Short(written) => return Ok(written),
            }
        }
        let mut sent = self.sent.lock().expect("sent lock");
        let mut written = 0;
        for buffer in buffers {
            sent.extend_from_slice(buffer);
            written += buffer.len();
        }
        Ok(written)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        *self.endpoint.lock().expect("endpoint lock") = None;
    }
}

impl std::fmt::Debug for MockSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSocket")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Split a recorded byte stream into frames and decode each envelope.
pub fn decode_frames(mut bytes: &[u8]) -> Vec<(MessageKind, WireEnvelope)> {
    let mut frames = Vec::new();
    while bytes.len() >= LENGTH_PREFIX_LEN {
        let total =
            u32::from_be_bytes(bytes[..LENGTH_PREFIX_LEN].try_into().expect("4 bytes")) as usize;
        let frame_len = LENGTH_PREFIX_LEN + total;
        assert!(
            bytes.len() >= frame_len,
            "truncated frame: have {} need {}",
            bytes.len(),
            frame_len
        );
        frames.push(decode_client_frame(&bytes[..frame_len]).expect("decodable frame"));
        bytes = &bytes[frame_len..];
    }
    assert!(bytes.is_empty(), "trailing bytes after last frame");
    frames
}

/// Message center double capturing everything the gateway hands back.
#[derive(Debug, Default)]
pub struct RecordingMessageCenter {
    messages: Mutex<Vec<Message>>,
    client_drops: Mutex<Vec<Vec<ActorId>>>,
}

impl RecordingMessageCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().expect("messages lock").clone()
    }

    pub fn client_drops(&self) -> Vec<Vec<ActorId>> {
        self.client_drops.lock().expect("drops lock").clone()
    }
}

impl MessageCenter for RecordingMessageCenter {
    fn send_message(&self, message: Message) {
        self.messages.lock().expect("messages lock").push(message);
    }

    fn record_client_drop(&self, actors: Vec<ActorId>) {
        self.client_drops.lock().expect("drops lock").push(actors);
    }
}

/// Registrar double capturing lifecycle notifications.
#[derive(Debug, Default)]
pub struct RecordingRegistrar {
    added: Mutex<Vec<ClientId>>,
    dropped: Mutex<Vec<ClientId>>,
}

impl RecordingRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn added(&self) -> Vec<ClientId> {
        self.added.lock().expect("added lock").clone()
    }

    pub fn dropped(&self) -> Vec<ClientId> {
        self.dropped.lock().expect("dropped lock").clone()
    }
}

impl ClientRegistrar for RecordingRegistrar {
    fn client_added(&self, client: &ClientId) {
        self.added.lock().expect("added lock").push(client.clone());
    }

    fn client_dropped(&self, client: &ClientId) {
        self.dropped
            .lock()
            .expect("dropped lock")
            .push(client.clone());
    }
}
