//! Fixed pool of sender workers driving client sockets.
//!
//! Every client is pinned to one worker at creation, so all traffic for a
//! client funnels through a single task: that is the whole concurrency story
//! for the pending queues and the socket during a send. Workers group
//! consecutive intake items for the same client into one batched write.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ClientState;
use crate::gateway::GatewayShared;
use crate::message::{Message, RejectionKind};
use crate::socket::GatewaySocket;
use crate::{ClientId, GatewayError};

/// One unit of work for a sender: a message for a client, or a wake-up
/// (`message = None`) telling the worker to inspect the client's pending
/// queues and drain them if a socket is attached.
#[derive(Debug)]
pub struct OutgoingItem {
    pub client: ClientId,
    pub message: Option<Message>,
}

impl OutgoingItem {
    pub fn message(client: ClientId, message: Message) -> Self {
        Self {
            client,
            message: Some(message),
        }
    }

    pub fn wake_up(client: ClientId) -> Self {
        Self {
            client,
            message: None,
        }
    }
}

pub(crate) struct SenderPool {
    intakes: Mutex<Vec<mpsc::UnboundedSender<OutgoingItem>>>,
    receivers: Vec<Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<OutgoingItem>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SenderPool {
    pub fn new(size: usize) -> Self {
        let mut intakes = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = mpsc::unbounded_channel();
            intakes.push(tx);
            receivers.push(Arc::new(tokio::sync::Mutex::new(rx)));
        }
        Self {
            intakes: Mutex::new(intakes),
            receivers,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue an item on the given worker. Returns false once the pool has
    /// been stopped.
    pub fn enqueue(&self, index: usize, item: OutgoingItem) -> bool {
        let intakes = self.intakes.lock().expect("intake lock");
        match intakes.get(index) {
            Some(intake) => intake.send(item).is_ok(),
            None => false,
        }
    }

    /// Spawn the worker tasks. Idempotent; later calls are ignored.
    pub fn spawn_workers(&self, shared: &Arc<GatewayShared>) {
        let mut workers = self.workers.lock().expect("worker lock");
        if !workers.is_empty() {
            return;
        }
        for (index, receiver) in self.receivers.iter().enumerate() {
            let shared = Arc::clone(shared);
            let receiver = Arc::clone(receiver);
            workers.push(tokio::spawn(supervise_sender(index, shared, receiver)));
        }
    }

    /// Close the intakes and wait for the workers to finish. Items still in
    /// an intake are drained and counted as dropped by the workers, which
    /// see the shutdown flag.
    pub async fn stop(&self) {
        self.intakes.lock().expect("intake lock").clear();
        let workers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().expect("worker lock"));
        for worker in workers {
            let _ = worker.await;
        }
    }
}

impl std::fmt::Debug for SenderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderPool")
            .field("size", &self.receivers.len())
            .finish()
    }
}

/// Keep one worker alive across panics. A restarted worker begins with
/// empty in-flight state; the client queues themselves are untouched.
async fn supervise_sender(
    index: usize,
    shared: Arc<GatewayShared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<OutgoingItem>>>,
) {
    loop {
        let run = run_sender(index, &shared, &receiver);
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(()) => break,
            Err(_) => {
                if shared.is_shutdown() {
                    break;
                }
                warn!(sender = index, "sender worker panicked, restarting");
            }
        }
    }
    debug!(sender = index, "sender worker stopped");
}

async fn run_sender(
    index: usize,
    shared: &Arc<GatewayShared>,
    receiver: &tokio::sync::Mutex<mpsc::UnboundedReceiver<OutgoingItem>>,
) {
    let mut intake = receiver.lock().await;
    let mut carry: Option<OutgoingItem> = None;

    loop {
        let item = match carry.take() {
            Some(item) => item,
            None => match intake.recv().await {
                Some(item) => item,
                None => break,
            },
        };

        if shared.is_shutdown() {
            if item.message.is_some() {
                shared.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
            continue;
        }

        let Some(first) = item.message else {
            process_wake_up(shared, &item.client).await;
            continue;
        };

        // Group consecutive intake items for the same client into one batch.
        // Stopping at the first mismatch keeps intake order intact.
        let mut batch = vec![first];
        while batch.len() < shared.config.max_send_batch {
            match intake.try_recv() {
                Ok(OutgoingItem {
                    client,
                    message: Some(message),
                }) if client == item.client => batch.push(message),
                Ok(next) => {
                    carry = Some(next);
                    break;
                }
                Err(_) => break,
            }
        }

        if batch.len() == 1 {
            let message = batch.pop().expect("one message");
            process_single(shared, index, &item.client, message).await;
        } else {
            process_batch(shared, index, &item.client, batch).await;
        }
    }
}

async fn process_wake_up(shared: &GatewayShared, client_id: &ClientId) {
    let Some(client) = shared.registry.resolve(client_id) else {
        debug!(client = %client_id, "wake-up for unknown client ignored");
        return;
    };
    if client.is_connected() {
        drain_client(shared, &client).await;
    }
}

async fn process_single(
    shared: &GatewayShared,
    index: usize,
    client_id: &ClientId,
    message: Message,
) {
    let Some(client) = shared.registry.resolve(client_id) else {
        reject_unknown(shared, index, client_id, vec![message]);
        return;
    };

    if !client.is_connected() {
        client.push_pending(message);
        return;
    }

    if client.has_pending() {
        client.push_pending(message);
        drain_client(shared, &client).await;
        return;
    }

    let Some(socket) = client.socket() else {
        // Raced with a close between the connected check and here.
        client.push_pending(message);
        return;
    };

    match send_one(shared, &socket, &message).await {
        Ok(()) => {
            shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) if err.is_serialization_failure() => {
            record_serialization_failure(shared, client_id, &err);
        }
        Err(err) => {
            warn!(
                client = %client_id,
                socket = %socket.id(),
                endpoint = %socket.remote_endpoint(),
                error = %err,
                "send failed, closing socket"
            );
            shared.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            // Both queues were empty, so queuing here keeps it at the head.
            client.push_pending(message);
            fail_socket(shared, &socket).await;
        }
    }
}

async fn process_batch(
    shared: &GatewayShared,
    index: usize,
    client_id: &ClientId,
    messages: Vec<Message>,
) {
    let Some(client) = shared.registry.resolve(client_id) else {
        reject_unknown(shared, index, client_id, messages);
        return;
    };

    if !client.is_connected() {
        client.push_pending_batch(messages);
        return;
    }

    if client.has_pending() {
        client.push_pending_batch(messages);
        drain_client(shared, &client).await;
        return;
    }

    let Some(socket) = client.socket() else {
        client.push_pending_batch(messages);
        return;
    };

    match try_send_batch(shared, client_id, &socket, &messages).await {
        BatchSend::Sent => {}
        BatchSend::Failed { survivors, err } => {
            warn!(
                client = %client_id,
                socket = %socket.id(),
                error = %err,
                "batched send failed, closing socket"
            );
            shared.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            // Both queues were empty, so queuing here keeps it at the head.
            client.push_pending_batch(survivors);
            fail_socket(shared, &socket).await;
        }
    }
}

/// Walk the pending units head-first while sends succeed, picking the older
/// of the two queue heads by unit sequence so singles and batches go out in
/// acceptance order. Stops at the first socket failure leaving unsent
/// messages in place; serialization failures drop the poisoned head and
/// keep going.
async fn drain_client(shared: &GatewayShared, client: &Arc<ClientState>) {
    loop {
        if shared.is_shutdown() {
            return;
        }
        let single_first = match (client.peek_pending_seq(), client.peek_pending_batch_seq()) {
            (None, None) => break,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(single_seq), Some(batch_seq)) => single_seq < batch_seq,
        };
        let Some(socket) = client.socket() else {
            return;
        };

        if single_first {
            let Some(message) = client.peek_pending() else {
                continue;
            };
            match send_one(shared, &socket, &message).await {
                Ok(()) => {
                    client.pop_pending();
                    shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) if err.is_serialization_failure() => {
                    client.pop_pending();
                    record_serialization_failure(shared, client.id(), &err);
                }
                Err(err) => {
                    warn!(
                        client = %client.id(),
                        socket = %socket.id(),
                        error = %err,
                        "drain send failed, closing socket"
                    );
                    shared.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    fail_socket(shared, &socket).await;
                    return;
                }
            }
        } else {
            let Some(batch) = client.peek_pending_batch() else {
                continue;
            };
            match try_send_batch(shared, client.id(), &socket, &batch).await {
                BatchSend::Sent => {
                    client.pop_pending_batch();
                }
                BatchSend::Failed { survivors, err } => {
                    warn!(
                        client = %client.id(),
                        socket = %socket.id(),
                        error = %err,
                        "batched drain failed, closing socket"
                    );
                    shared.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    client.replace_pending_batch_head(survivors);
                    fail_socket(shared, &socket).await;
                    return;
                }
            }
        }
    }
}

async fn send_one(
    shared: &GatewayShared,
    socket: &Arc<dyn GatewaySocket>,
    message: &Message,
) -> crate::Result<()> {
    let frame = shared.serializer.serialize(message)?;
    let expected = frame.total_len();
    let written = socket.send(&frame.buffers).await.map_err(GatewayError::Network)?;
    if written != expected {
        return Err(GatewayError::ShortWrite { written, expected });
    }
    Ok(())
}

enum BatchSend {
    /// Everything that serialized was written; per-message serialization
    /// failures were counted and dropped.
    Sent,
    /// The socket failed. `survivors` are the messages that serialized and
    /// must stay queued for the next socket.
    Failed {
        survivors: Vec<Message>,
        err: GatewayError,
    },
}

async fn try_send_batch(
    shared: &GatewayShared,
    client_id: &ClientId,
    socket: &Arc<dyn GatewaySocket>,
    batch: &[Message],
) -> BatchSend {
    let results = shared.serializer.serialize_batch(batch);

    let mut survivors = Vec::with_capacity(batch.len());
    let mut frames = Vec::with_capacity(batch.len());
    for (message, result) in batch.iter().zip(results) {
        match result {
            Ok(frame) => {
                survivors.push(message.clone());
                frames.push(frame);
            }
            Err(err) => record_serialization_failure(shared, client_id, &err),
        }
    }

    if survivors.is_empty() {
        return BatchSend::Sent;
    }

    let expected: usize = frames.iter().map(|f| f.total_len()).sum();
    let buffers: Vec<Bytes> = frames
        .into_iter()
        .flat_map(|frame| frame.buffers)
        .collect();

    match socket.send(&buffers).await {
        Ok(written) if written == expected => {
            shared
                .stats
                .messages_sent
                .fetch_add(survivors.len() as u64, Ordering::Relaxed);
            BatchSend::Sent
        }
        Ok(written) => BatchSend::Failed {
            survivors,
            err: GatewayError::ShortWrite { written, expected },
        },
        Err(err) => BatchSend::Failed {
            survivors,
            err: GatewayError::Network(err),
        },
    }
}

/// Mark the socket closed in the registry, then physically close it. The
/// registry check is what guards against double-close when several failures
/// race on the same socket.
async fn fail_socket(shared: &GatewayShared, socket: &Arc<dyn GatewaySocket>) {
    if shared.registry.close_socket(socket.id()).is_some() {
        socket.close().await;
    }
}

fn record_serialization_failure(shared: &GatewayShared, client_id: &ClientId, err: &GatewayError) {
    warn!(client = %client_id, error = %err, "dropping message that failed to serialize");
    shared.stats.send_failures.fetch_add(1, Ordering::Relaxed);
    shared.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
}

/// The registry has no record of this client: requests get an unrecoverable
/// rejection back into the silo, anything else is dropped.
fn reject_unknown(
    shared: &GatewayShared,
    index: usize,
    client_id: &ClientId,
    messages: Vec<Message>,
) {
    info!(
        sender = index,
        client = %client_id,
        messages = messages.len(),
        "messages for unrecognized client"
    );
    for message in messages {
        if message.is_request() {
            let rejection = message.to_rejection(
                RejectionKind::Unrecoverable,
                format!(
                    "no client {client_id} is connected to gateway {}",
                    shared.address
                ),
            );
            shared.stats.rejected_requests.fetch_add(1, Ordering::Relaxed);
            shared.message_center.send_message(rejection);
        } else {
            shared.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
