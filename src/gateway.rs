//! Gateway facade: the silo-edge component tying the registry, the sender
//! pool, the reply-route cache and the cleanup agent together.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::ClientState;
use crate::config::GatewayConfig;
use crate::framing::{EnvelopeSerializer, MessageSerializer};
use crate::message::{ActorId, Message, MessageKind};
use crate::registry::ClientRegistry;
use crate::routing::ReplyRoutingCache;
use crate::sender::{OutgoingItem, SenderPool};
use crate::socket::{GatewaySocket, SocketId};
use crate::{ClientId, Result, SiloAddress};

/// Seam to the silo-to-silo message center.
pub trait MessageCenter: Send + Sync {
    /// Hand a message to the silo for further routing (rejections the
    /// gateway synthesizes, reroute answers, ...).
    fn send_message(&self, message: Message);

    /// A dropped client took these proxied actors with it; the silo informs
    /// the directory.
    fn record_client_drop(&self, actors: Vec<ActorId>);
}

/// Seam to the client observer registrar.
pub trait ClientRegistrar: Send + Sync {
    fn client_added(&self, client: &ClientId);
    fn client_dropped(&self, client: &ClientId);
}

#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    pub connected_clients: AtomicUsize,
    pub messages_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub rejected_requests: AtomicU64,
    pub clients_dropped: AtomicU64,
    pub routes_evicted: AtomicU64,
}

/// Point-in-time snapshot of the gateway counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GatewayStats {
    /// Incremented for every opened socket, decremented when the cleanup
    /// sweep drops a client.
    pub connected_clients: usize,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub messages_dropped: u64,
    pub rejected_requests: u64,
    pub clients_dropped: u64,
    pub routes_evicted: u64,
}

pub(crate) struct GatewayShared {
    pub address: SiloAddress,
    pub config: GatewayConfig,
    pub registry: ClientRegistry,
    pub route_cache: ReplyRoutingCache,
    pub serializer: Arc<dyn MessageSerializer>,
    pub message_center: Arc<dyn MessageCenter>,
    pub registrar: Mutex<Option<Arc<dyn ClientRegistrar>>>,
    pub stats: StatsInner,
    pub shutdown: AtomicBool,
}

impl GatewayShared {
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn notify_client_added(&self, client: &ClientId) {
        if let Some(registrar) = self.registrar.lock().expect("registrar lock").as_ref() {
            registrar.client_added(client);
        }
    }

    fn notify_client_dropped(&self, client: &ClientId) {
        if let Some(registrar) = self.registrar.lock().expect("registrar lock").as_ref() {
            registrar.client_dropped(client);
        }
    }
}

/// The client gateway of a silo.
///
/// Created with [`Gateway::new`], wired to a transport via
/// [`record_opened_socket`](Gateway::record_opened_socket) /
/// [`record_closed_socket`](Gateway::record_closed_socket), and driven by
/// the silo through [`try_deliver_to_proxy`](Gateway::try_deliver_to_proxy).
pub struct Gateway {
    shared: Arc<GatewayShared>,
    senders: SenderPool,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Build a gateway with the default wire codec.
    pub fn new(
        config: GatewayConfig,
        address: SiloAddress,
        message_center: Arc<dyn MessageCenter>,
    ) -> Result<Self> {
        let serializer = Arc::new(EnvelopeSerializer::new(config.max_frame_size));
        Self::with_serializer(config, address, message_center, serializer)
    }

    /// Build a gateway with a custom serializer.
    pub fn with_serializer(
        config: GatewayConfig,
        address: SiloAddress,
        message_center: Arc<dyn MessageCenter>,
        serializer: Arc<dyn MessageSerializer>,
    ) -> Result<Self> {
        config.validate()?;
        let senders = SenderPool::new(config.gateway_sender_queues);
        let shared = Arc::new(GatewayShared {
            address,
            registry: ClientRegistry::new(config.gateway_sender_queues),
            route_cache: ReplyRoutingCache::new(config.route_ttl()),
            serializer,
            message_center,
            registrar: Mutex::new(None),
            stats: StatsInner::default(),
            shutdown: AtomicBool::new(false),
            config,
        });
        Ok(Self {
            shared,
            senders,
            cleanup: Mutex::new(None),
        })
    }

    /// Spawn the sender workers and the cleanup agent. Connection events
    /// recorded before `start` are buffered on the worker intakes.
    pub fn start(&self, registrar: Arc<dyn ClientRegistrar>) {
        *self.shared.registrar.lock().expect("registrar lock") = Some(registrar);
        self.senders.spawn_workers(&self.shared);

        let mut cleanup = self.cleanup.lock().expect("cleanup lock");
        if cleanup.is_none() {
            *cleanup = Some(tokio::spawn(run_cleanup(Arc::clone(&self.shared))));
        }

        info!(
            gateway = %self.shared.address,
            senders = self.shared.config.gateway_sender_queues,
            grace_window_ms = self.shared.config.grace_window.as_millis() as u64,
            "gateway started"
        );
    }

    /// Stop the gateway: flip the shutdown flag, cancel the cleanup agent
    /// and join the sender workers. Items still on worker intakes are
    /// dropped.
    pub async fn stop(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cleanup) = self.cleanup.lock().expect("cleanup lock").take() {
            cleanup.abort();
        }
        self.senders.stop().await;
        info!(gateway = %self.shared.address, "gateway stopped");
    }

    pub fn address(&self) -> SiloAddress {
        self.shared.address
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    // ---- connection events ----

    /// The transport accepted (or re-accepted) a client connection.
    pub fn record_opened_socket(&self, socket: Arc<dyn GatewaySocket>, client_id: ClientId) {
        let opened = self.shared.registry.open_socket(socket, client_id.clone());
        self.shared
            .stats
            .connected_clients
            .fetch_add(1, Ordering::Relaxed);
        if !opened.is_new {
            if let Some(old) = &opened.old_socket {
                debug!(client = %client_id, old_socket = %old.id(), "replaced previous socket");
            }
            // Ask the owning sender to flush whatever queued up while the
            // client was away.
            self.queue_item(&opened.client, OutgoingItem::wake_up(client_id.clone()));
        }
        self.shared.notify_client_added(&client_id);
        info!(
            gateway = %self.shared.address,
            client = %client_id,
            reconnect = !opened.is_new,
            "client connected"
        );
    }

    /// The transport noticed a closed connection. Unknown sockets are
    /// ignored.
    pub fn record_closed_socket(&self, socket_id: SocketId) {
        if let Some(client) = self.shared.registry.close_socket(socket_id) {
            info!(
                gateway = %self.shared.address,
                client = %client.id(),
                "client disconnected, grace window started"
            );
        }
    }

    // ---- proxied-actor bookkeeping ----

    pub fn record_proxied_grain(&self, actor_id: ActorId, client_id: &ClientId) {
        self.shared.registry.record_proxied_grain(actor_id, client_id);
    }

    /// Fast-path variant keyed by the socket the actor was last seen
    /// sending on; skips the gateway lock.
    pub fn record_sending_proxied_grain(&self, actor_id: ActorId, socket_id: SocketId) {
        self.shared
            .registry
            .record_sending_proxied_grain(actor_id, socket_id);
    }

    pub fn record_unproxied_grain(&self, actor_id: &ActorId) {
        self.shared.registry.record_unproxied_grain(actor_id);
    }

    // ---- delivery ----

    /// Deliver a message to a client proxied by this gateway.
    ///
    /// Returns `None` when the message was accepted for delivery here;
    /// returns the message back when its target is not proxied by this
    /// gateway so the caller can keep routing it.
    pub fn try_deliver_to_proxy(&self, mut message: Message) -> Option<Message> {
        let Some(client) = self.shared.registry.lookup_proxied(&message.target) else {
            return Some(message);
        };

        // The index read was lock-free; re-check against the authoritative
        // table and evict the entry if the client is gone.
        if !self.shared.registry.is_current(&client) {
            debug!(actor = %message.target, "evicting stale proxied-actor entry");
            self.shared
                .registry
                .evict_stale_proxied(&message.target, &client);
            return Some(message);
        }

        if message.sender.is_client_grain() && message.target.is_client_addressable_object() {
            if let (Some(sender_client), Some(silo)) =
                (message.sender.client_id(), message.sending_silo)
            {
                self.shared
                    .route_cache
                    .record_route(sender_client.clone(), silo);
            }
        }

        // Clients only ever see the gateway identity, not arbitrary silos.
        message.target_silo = None;
        message.sending_silo = Some(self.shared.address);

        self.queue_request(&client, message);
        None
    }

    /// For a response headed to a client grain that is not attached here,
    /// return the gateway silo it was last seen sending through.
    pub fn try_to_reroute(&self, message: &Message) -> Option<SiloAddress> {
        if message.kind != MessageKind::Response {
            return None;
        }
        if !message.sender.is_client_addressable_object() || !message.target.is_client_grain() {
            return None;
        }
        let client_id = message.target.client_id()?;
        self.shared.route_cache.try_find_route(client_id)
    }

    /// Clients with a live socket right now.
    pub fn get_connected_clients(&self) -> Vec<ClientId> {
        self.shared.registry.connected_clients()
    }

    pub fn stats(&self) -> GatewayStats {
        let stats = &self.shared.stats;
        GatewayStats {
            connected_clients: stats.connected_clients.load(Ordering::Relaxed),
            messages_sent: stats.messages_sent.load(Ordering::Relaxed),
            send_failures: stats.send_failures.load(Ordering::Relaxed),
            messages_dropped: stats.messages_dropped.load(Ordering::Relaxed),
            rejected_requests: stats.rejected_requests.load(Ordering::Relaxed),
            clients_dropped: stats.clients_dropped.load(Ordering::Relaxed),
            routes_evicted: stats.routes_evicted.load(Ordering::Relaxed),
        }
    }

    fn queue_request(&self, client: &Arc<ClientState>, message: Message) {
        self.queue_item(
            client,
            OutgoingItem::message(client.id().clone(), message),
        );
    }

    fn queue_item(&self, client: &Arc<ClientState>, item: OutgoingItem) {
        let was_message = item.message.is_some();
        if !self.senders.enqueue(client.sender_index(), item) && was_message {
            debug!(client = %client.id(), "sender pool stopped, dropping message");
            self.shared
                .stats
                .messages_dropped
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("address", &self.shared.address)
            .field("registry", &self.shared.registry)
            .finish()
    }
}

/// Periodic sweep: drop clients past the grace window, then evict expired
/// reply routes. Both passes serialize with registry mutations through the
/// gateway lock.
async fn run_cleanup(shared: Arc<GatewayShared>) {
    let mut ticker = tokio::time::interval(shared.config.grace_window);
    loop {
        ticker.tick().await;
        if shared.is_shutdown() {
            break;
        }
        sweep(&shared).await;
    }
}

async fn sweep(shared: &GatewayShared) {
    let dropped = shared
        .registry
        .drop_disconnected_clients(shared.config.grace_window);
    let evicted = shared
        .registry
        .with_gateway_lock(|| shared.route_cache.drop_expired());
    shared
        .stats
        .routes_evicted
        .fetch_add(evicted as u64, Ordering::Relaxed);

    for entry in dropped {
        shared
            .stats
            .connected_clients
            .fetch_sub(1, Ordering::Relaxed);
        shared.stats.clients_dropped.fetch_add(1, Ordering::Relaxed);

        let pending = entry.client.clear_pending();
        if pending > 0 {
            shared
                .stats
                .messages_dropped
                .fetch_add(pending as u64, Ordering::Relaxed);
        }
        if let Some(socket) = entry.lingering_socket {
            socket.close().await;
        }
        shared.notify_client_dropped(entry.client.id());
        shared
            .message_center
            .record_client_drop(entry.orphaned_actors);
    }
}
