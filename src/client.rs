//! Per-client connection state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::message::Message;
use crate::socket::{GatewaySocket, SocketId};
use crate::{ClientId, NEVER_DISCONNECTED};

/// State of one known client.
///
/// The socket slot and disconnect timestamp are mutated under the gateway
/// lock; the pending queues are touched only by the sender worker the client
/// was pinned to, which is what makes peek-send-pop safe without a wider
/// lock.
///
/// Every queued unit (single message or batch) carries a per-client sequence
/// number assigned when it is queued. The drain walks both queues by that
/// sequence, so messages reach the socket in the order they were accepted
/// even when singles and batches alternate.
pub struct ClientState {
    id: ClientId,
    sender_index: usize,
    socket: Mutex<Option<Arc<dyn GatewaySocket>>>,
    /// Millis since epoch of the last disconnect; [`NEVER_DISCONNECTED`]
    /// while a socket is attached.
    disconnected_since: AtomicU64,
    pending_singles: Mutex<VecDeque<(u64, Message)>>,
    pending_batches: Mutex<VecDeque<(u64, Vec<Message>)>>,
    unit_seq: AtomicU64,
}

impl ClientState {
    pub(crate) fn new(id: ClientId, sender_index: usize, now: u64) -> Self {
        Self {
            id,
            sender_index,
            socket: Mutex::new(None),
            disconnected_since: AtomicU64::new(now),
            pending_singles: Mutex::new(VecDeque::new()),
            pending_batches: Mutex::new(VecDeque::new()),
            unit_seq: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Index of the sender worker owning this client. Assigned at creation,
    /// never changes.
    pub fn sender_index(&self) -> usize {
        self.sender_index
    }

    pub fn is_connected(&self) -> bool {
        self.disconnected_since.load(Ordering::Acquire) == NEVER_DISCONNECTED
    }

    pub fn disconnected_since(&self) -> u64 {
        self.disconnected_since.load(Ordering::Acquire)
    }

    pub fn socket(&self) -> Option<Arc<dyn GatewaySocket>> {
        self.socket.lock().expect("socket lock").clone()
    }

    pub fn socket_id(&self) -> Option<SocketId> {
        self.socket
            .lock()
            .expect("socket lock")
            .as_ref()
            .map(|s| s.id())
    }

    /// Install a new socket, returning the previous one. Caller holds the
    /// gateway lock.
    pub(crate) fn set_connected(&self, socket: Arc<dyn GatewaySocket>) -> Option<Arc<dyn GatewaySocket>> {
        let old = self.socket.lock().expect("socket lock").replace(socket);
        self.disconnected_since
            .store(NEVER_DISCONNECTED, Ordering::Release);
        old
    }

    /// Detach the socket and start the grace clock. Caller holds the gateway
    /// lock.
    pub(crate) fn set_disconnected(&self, now: u64) -> Option<Arc<dyn GatewaySocket>> {
        let old = self.socket.lock().expect("socket lock").take();
        self.disconnected_since.store(now, Ordering::Release);
        old
    }

    fn next_unit_seq(&self) -> u64 {
        self.unit_seq.fetch_add(1, Ordering::Relaxed)
    }

    // ---- pending singles, FIFO ----

    pub(crate) fn push_pending(&self, message: Message) {
        let seq = self.next_unit_seq();
        self.pending_singles
            .lock()
            .expect("pending lock")
            .push_back((seq, message));
    }

    /// Sequence number of the head single, if any.
    pub(crate) fn peek_pending_seq(&self) -> Option<u64> {
        self.pending_singles
            .lock()
            .expect("pending lock")
            .front()
            .map(|(seq, _)| *seq)
    }

    pub(crate) fn peek_pending(&self) -> Option<Message> {
        self.pending_singles
            .lock()
            .expect("pending lock")
            .front()
            .map(|(_, message)| message.clone())
    }

    pub(crate) fn pop_pending(&self) -> Option<Message> {
        self.pending_singles
            .lock()
            .expect("pending lock")
            .pop_front()
            .map(|(_, message)| message)
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending_singles.lock().expect("pending lock").len()
    }

    // ---- pending batches, FIFO of lists ----

    pub(crate) fn push_pending_batch(&self, messages: Vec<Message>) {
        let seq = self.next_unit_seq();
        self.pending_batches
            .lock()
            .expect("pending lock")
            .push_back((seq, messages));
    }

    /// Sequence number of the head batch, if any.
    pub(crate) fn peek_pending_batch_seq(&self) -> Option<u64> {
        self.pending_batches
            .lock()
            .expect("pending lock")
            .front()
            .map(|(seq, _)| *seq)
    }

    pub(crate) fn peek_pending_batch(&self) -> Option<Vec<Message>> {
        self.pending_batches
            .lock()
            .expect("pending lock")
            .front()
            .map(|(_, messages)| messages.clone())
    }

    pub(crate) fn pop_pending_batch(&self) -> Option<Vec<Message>> {
        self.pending_batches
            .lock()
            .expect("pending lock")
            .pop_front()
            .map(|(_, messages)| messages)
    }

    /// Swap the head batch for its surviving members, keeping its position
    /// in the acceptance order.
    pub(crate) fn replace_pending_batch_head(&self, survivors: Vec<Message>) {
        if let Some(front) = self
            .pending_batches
            .lock()
            .expect("pending lock")
            .front_mut()
        {
            front.1 = survivors;
        }
    }

    pub(crate) fn pending_batch_len(&self) -> usize {
        self.pending_batches.lock().expect("pending lock").len()
    }

    /// True when anything is queued in either pending queue.
    pub(crate) fn has_pending(&self) -> bool {
        self.pending_len() > 0 || self.pending_batch_len() > 0
    }

    /// Drop everything still queued, returning how many messages went with
    /// it. Used when the client itself is dropped.
    pub(crate) fn clear_pending(&self) -> usize {
        let singles = std::mem::take(&mut *self.pending_singles.lock().expect("pending lock"));
        let batches = std::mem::take(&mut *self.pending_batches.lock().expect("pending lock"));
        singles.len() + batches.iter().map(|(_, b)| b.len()).sum::<usize>()
    }
}

impl std::fmt::Debug for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientState")
            .field("id", &self.id)
            .field("sender_index", &self.sender_index)
            .field("connected", &self.is_connected())
            .field("pending_singles", &self.pending_len())
            .field("pending_batches", &self.pending_batch_len())
            .finish()
    }
}
