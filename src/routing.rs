//! Reply-route cache.
//!
//! Replies from client-addressable objects originate on silos with no direct
//! connection to the target client. Each gateway that relays a request from a
//! client grain memorizes the sending silo; a later reply to that client is
//! rerouted to the remembered silo, which proxies it to the owning gateway.

use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::{current_millis, ClientId, SiloAddress};

#[derive(Debug, Clone, Copy)]
struct RouteEntry {
    gateway: SiloAddress,
    last_seen: u64,
}

/// Concurrent map from client identity to the gateway silo it was last seen
/// sending through. Entries expire by TTL, swept by the cleanup agent.
#[derive(Debug)]
pub struct ReplyRoutingCache {
    routes: DashMap<ClientId, RouteEntry>,
    ttl: Duration,
}

impl ReplyRoutingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            routes: DashMap::new(),
            ttl,
        }
    }

    /// Upsert the route for a client. Last write wins.
    pub fn record_route(&self, client: ClientId, gateway: SiloAddress) {
        self.routes.insert(
            client,
            RouteEntry {
                gateway,
                last_seen: current_millis(),
            },
        );
    }

    /// Lookup with no side effects and no freshness check: a stale entry
    /// that outlived its TTL but not yet a sweep is returned intentionally,
    /// the caller tolerates routing retries.
    pub fn try_find_route(&self, client: &ClientId) -> Option<SiloAddress> {
        self.routes.get(client).map(|entry| entry.gateway)
    }

    /// Evict entries older than the TTL. Returns the number evicted.
    pub fn drop_expired(&self) -> usize {
        let now = current_millis();
        let ttl = self.ttl.as_millis() as u64;
        let before = self.routes.len();
        self.routes
            .retain(|_, entry| now.saturating_sub(entry.last_seen) < ttl);
        let evicted = before - self.routes.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.routes.len(), "evicted expired reply routes");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(format!("127.0.0.1:{port}").parse().unwrap(), 1)
    }

    #[test]
    fn record_then_find() {
        let cache = ReplyRoutingCache::new(Duration::from_secs(60));
        let client = ClientId::new("c1");
        cache.record_route(client.clone(), silo(4000));
        assert_eq!(cache.try_find_route(&client), Some(silo(4000)));
        assert_eq!(cache.try_find_route(&ClientId::new("other")), None);
    }

    #[test]
    fn last_write_wins() {
        let cache = ReplyRoutingCache::new(Duration::from_secs(60));
        let client = ClientId::new("c1");
        cache.record_route(client.clone(), silo(4000));
        cache.record_route(client.clone(), silo(5000));
        assert_eq!(cache.try_find_route(&client), Some(silo(5000)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn drop_expired_evicts_only_stale_entries() {
        let cache = ReplyRoutingCache::new(Duration::from_secs(60));
        cache.record_route(ClientId::new("fresh"), silo(4000));
        assert_eq!(cache.drop_expired(), 0);
        assert_eq!(cache.len(), 1);

        let cache = ReplyRoutingCache::new(Duration::ZERO);
        cache.record_route(ClientId::new("stale"), silo(4000));
        assert_eq!(cache.drop_expired(), 1);
        assert!(cache.is_empty());
        // Property: nothing older than the TTL survives a sweep.
        assert_eq!(cache.try_find_route(&ClientId::new("stale")), None);
    }

    #[test]
    fn lookup_does_not_refresh() {
        let cache = ReplyRoutingCache::new(Duration::ZERO);
        let client = ClientId::new("c1");
        cache.record_route(client.clone(), silo(4000));
        // Stale but unswept entries are still returned.
        assert_eq!(cache.try_find_route(&client), Some(silo(4000)));
        cache.drop_expired();
        assert_eq!(cache.try_find_route(&client), None);
    }
}
