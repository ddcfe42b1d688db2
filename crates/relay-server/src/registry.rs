//! Live stream connections, keyed by id.

use std::sync::Arc;

use dashmap::DashMap;
use relay_core::ids::ConnectionId;

use crate::stream::{CloseReason, StreamConnection};

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<StreamConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<StreamConnection>) {
        let _ = self.connections.insert(conn.id().clone(), conn);
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<StreamConnection>> {
        self.connections.remove(id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<StreamConnection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Close every registered connection. Returns how many were closed by
    /// this call.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        // Collect first: closing removes entries from the map.
        let live: Vec<Arc<StreamConnection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        live.iter().filter(|conn| conn.close(reason)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::config::ConnectionConfig;
    use relay_core::EventBus;
    use tokio_util::sync::CancellationToken;

    fn open(bus: &EventBus, registry: &Arc<ConnectionRegistry>) -> (Arc<StreamConnection>, crate::stream::FrameStream) {
        StreamConnection::open(
            Identity {
                subject: "token:0".into(),
            },
            bus,
            &ConnectionConfig::default(),
            CancellationToken::new(),
            Some(registry),
        )
    }

    #[tokio::test]
    async fn connections_deregister_on_close() {
        let bus = EventBus::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, _body_a) = open(&bus, &registry);
        let (b, _body_b) = open(&bus, &registry);
        assert_eq!(registry.count(), 2);
        assert!(registry.get(a.id()).is_some());

        a.close(CloseReason::Server);
        assert_eq!(registry.count(), 1);
        assert!(registry.get(a.id()).is_none());
        assert!(registry.get(b.id()).is_some());
    }

    #[tokio::test]
    async fn close_all_closes_each_once() {
        let bus = EventBus::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let (_a, _body_a) = open(&bus, &registry);
        let (b, _body_b) = open(&bus, &registry);
        let (_c, _body_c) = open(&bus, &registry);
        b.close(CloseReason::ClientDisconnected);

        assert_eq!(registry.close_all(CloseReason::Cancelled), 2);
        assert_eq!(registry.count(), 0);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(registry.close_all(CloseReason::Cancelled), 0);
    }
}
