//! Authoritative registry of connected clients.
//!
//! Three tables share the same `ClientState` values: the authoritative
//! client table guarded by the gateway lock, and two derived indexes held in
//! concurrent maps so the hot read paths never touch the lock. All
//! multi-table mutations happen with the gateway lock held, which is what
//! keeps the derived indexes agreeing with the client table.
//!
//! Lock order is always gateway lock first, then a concurrent-map shard.
//! Readers that start from a concurrent map clone the `Arc` out before
//! taking the gateway lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::client::ClientState;
use crate::message::ActorId;
use crate::socket::{GatewaySocket, SocketId};
use crate::{current_millis, ClientId};

struct RegistryInner {
    clients: HashMap<ClientId, Arc<ClientState>>,
    next_sender_index: usize,
}

/// Result of recording an opened socket.
pub(crate) struct OpenedSocket {
    pub client: Arc<ClientState>,
    /// True when this is the first time the client was observed.
    pub is_new: bool,
    /// Socket that was current before a reconnection, already removed from
    /// the socket index.
    pub old_socket: Option<Arc<dyn GatewaySocket>>,
}

/// A client removed by the cleanup sweep.
pub(crate) struct DroppedClient {
    pub client: Arc<ClientState>,
    /// A socket that was still attached at drop time; the caller closes it.
    pub lingering_socket: Option<Arc<dyn GatewaySocket>>,
    /// Proxied actors that lost their route when the client went away.
    pub orphaned_actors: Vec<ActorId>,
}

pub(crate) struct ClientRegistry {
    /// The gateway lock.
    inner: Mutex<RegistryInner>,
    by_socket: DashMap<SocketId, Arc<ClientState>>,
    by_proxied_actor: DashMap<ActorId, Arc<ClientState>>,
    pool_size: usize,
}

impl ClientRegistry {
    pub fn new(pool_size: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                clients: HashMap::new(),
                next_sender_index: 0,
            }),
            by_socket: DashMap::new(),
            by_proxied_actor: DashMap::new(),
            pool_size,
        }
    }

    /// Record a freshly accepted (or reconnected) socket for a client.
    pub fn open_socket(&self, socket: Arc<dyn GatewaySocket>, client_id: ClientId) -> OpenedSocket {
        let mut inner = self.lock();
        let (client, is_new) = match inner.clients.get(&client_id) {
            Some(existing) => (Arc::clone(existing), false),
            None => {
                let index = inner.next_sender_index % self.pool_size;
                inner.next_sender_index = inner.next_sender_index.wrapping_add(1);
                let state = Arc::new(ClientState::new(
                    client_id.clone(),
                    index,
                    current_millis(),
                ));
                inner.clients.insert(client_id.clone(), Arc::clone(&state));
                (state, true)
            }
        };

        let old_socket = client.set_connected(Arc::clone(&socket));
        if let Some(old) = &old_socket {
            self.by_socket.remove(&old.id());
        }
        self.by_socket.insert(socket.id(), Arc::clone(&client));

        debug!(
            client = %client_id,
            socket = %socket.id(),
            endpoint = %socket.remote_endpoint(),
            sender_index = client.sender_index(),
            is_new,
            "recorded opened socket"
        );
        OpenedSocket {
            client,
            is_new,
            old_socket,
        }
    }

    /// Record a socket close. Unknown sockets are ignored, which makes the
    /// operation idempotent and guards against double-close.
    pub fn close_socket(&self, socket_id: SocketId) -> Option<Arc<ClientState>> {
        let _inner = self.lock();
        let (_, client) = self.by_socket.remove(&socket_id)?;
        client.set_disconnected(current_millis());
        debug!(client = %client.id(), socket = %socket_id, "recorded closed socket");
        Some(client)
    }

    /// Resolve a client by id. Taken briefly by sender workers.
    pub fn resolve(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        self.lock().clients.get(client_id).cloned()
    }

    /// Whether this exact state is still the registered one for its id.
    pub fn is_current(&self, client: &Arc<ClientState>) -> bool {
        self.lock()
            .clients
            .get(client.id())
            .is_some_and(|current| Arc::ptr_eq(current, client))
    }

    /// Register a proxied actor hosted by a known client.
    pub fn record_proxied_grain(&self, actor_id: ActorId, client_id: &ClientId) {
        let client = {
            let inner = self.lock();
            match inner.clients.get(client_id) {
                Some(client) => Arc::clone(client),
                None => {
                    debug!(actor = %actor_id, client = %client_id, "proxied grain for unknown client ignored");
                    return;
                }
            }
        };
        self.by_proxied_actor.insert(actor_id, client);
    }

    /// Fast-path variant resolving the client through its live socket,
    /// without the gateway lock. Losing a race against a close just drops
    /// the shortcut.
    pub fn record_sending_proxied_grain(&self, actor_id: ActorId, socket_id: SocketId) {
        let client = self
            .by_socket
            .get(&socket_id)
            .map(|entry| Arc::clone(entry.value()));
        match client {
            Some(client) => {
                self.by_proxied_actor.insert(actor_id, client);
            }
            None => {
                debug!(actor = %actor_id, socket = %socket_id, "sending proxied grain on unknown socket ignored");
            }
        }
    }

    pub fn record_unproxied_grain(&self, actor_id: &ActorId) {
        self.by_proxied_actor.remove(actor_id);
    }

    /// Lock-free lookup used by delivery dispatch.
    pub fn lookup_proxied(&self, actor_id: &ActorId) -> Option<Arc<ClientState>> {
        self.by_proxied_actor
            .get(actor_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Evict a proxied-actor entry that still points at a dropped state.
    pub fn evict_stale_proxied(&self, actor_id: &ActorId, stale: &Arc<ClientState>) {
        self.by_proxied_actor
            .remove_if(actor_id, |_, current| Arc::ptr_eq(current, stale));
    }

    /// Clients with a live socket right now.
    pub fn connected_clients(&self) -> Vec<ClientId> {
        self.lock()
            .clients
            .values()
            .filter(|c| c.is_connected())
            .map(|c| c.id().clone())
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Drop clients that have been disconnected for at least the grace
    /// window. The whole sweep holds the gateway lock.
    pub fn drop_disconnected_clients(&self, grace: Duration) -> Vec<DroppedClient> {
        let mut inner = self.lock();
        let now = current_millis();
        let grace_millis = grace.as_millis() as u64;

        let eligible: Vec<ClientId> = inner
            .clients
            .values()
            .filter(|c| {
                !c.is_connected() && now.saturating_sub(c.disconnected_since()) >= grace_millis
            })
            .map(|c| c.id().clone())
            .collect();

        let mut dropped = Vec::with_capacity(eligible.len());
        for client_id in eligible {
            let Some(client) = inner.clients.remove(&client_id) else {
                continue;
            };
            let idle_ms = now.saturating_sub(client.disconnected_since());
            let lingering_socket = client.set_disconnected(now);
            if let Some(socket) = &lingering_socket {
                self.by_socket.remove(&socket.id());
            }

            let orphaned_actors: Vec<ActorId> = self
                .by_proxied_actor
                .iter()
                .filter(|entry| Arc::ptr_eq(entry.value(), &client))
                .map(|entry| entry.key().clone())
                .collect();
            for actor in &orphaned_actors {
                self.by_proxied_actor.remove(actor);
            }

            info!(
                client = %client_id,
                disconnected_for_ms = idle_ms,
                orphaned_actors = orphaned_actors.len(),
                "dropping client past grace window"
            );
            dropped.push(DroppedClient {
                client,
                lingering_socket,
                orphaned_actors,
            });
        }
        dropped
    }

    /// Run `f` while holding the gateway lock; used to serialize the
    /// reply-route sweep with registry mutations.
    pub fn with_gateway_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _inner = self.lock();
        f()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().expect("gateway lock")
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.client_count())
            .field("by_socket", &self.by_socket.len())
            .field("by_proxied_actor", &self.by_proxied_actor.len())
            .finish()
    }
}
