//! In-memory `ClientRegistry` — per-instance, mutated only through this
//! API so the primary map and the `roomId → connectionIds` secondary
//! index never diverge.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::media::engine::{ConsumerId, ProducerId, TransportId, TransportRole};

use super::model::{Connection, Participant};

pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Connection>>,
    by_room: RwLock<HashMap<String, HashSet<String>>>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            by_room: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, connection_id: String, user_id: String, now_ms: i64) {
        self.clients.write().await.insert(
            connection_id.clone(),
            Connection::new(connection_id, user_id, now_ms),
        );
    }

    /// Full teardown on socket disconnect.
    pub async fn remove(&self, connection_id: &str) {
        let removed = self.clients.write().await.remove(connection_id);
        if let Some(conn) = removed {
            if let Some(room_id) = &conn.room_id {
                if let Some(set) = self.by_room.write().await.get_mut(room_id) {
                    set.remove(connection_id);
                }
            }
        }
    }

    pub async fn set_room(&self, connection_id: &str, room_id: &str) {
        let mut clients = self.clients.write().await;
        if let Some(conn) = clients.get_mut(connection_id) {
            if let Some(prev) = conn.room_id.take() {
                if let Some(set) = self.by_room.write().await.get_mut(&prev) {
                    set.remove(connection_id);
                }
            }
            conn.room_id = Some(room_id.to_string());
            drop(clients);
            self.by_room
                .write()
                .await
                .entry(room_id.to_string())
                .or_insert_with(HashSet::new)
                .insert(connection_id.to_string());
        }
    }

    /// §4.6 room:leave — resets the client's owned media resources and
    /// clears its room membership.
    pub async fn leave_room(&self, connection_id: &str) {
        let mut clients = self.clients.write().await;
        if let Some(conn) = clients.get_mut(connection_id) {
            if let Some(room_id) = conn.room_id.clone() {
                conn.reset_room_state();
                drop(clients);
                if let Some(set) = self.by_room.write().await.get_mut(&room_id) {
                    set.remove(connection_id);
                }
            }
        }
    }

    pub async fn add_transport(
        &self,
        connection_id: &str,
        transport_id: TransportId,
        role: TransportRole,
    ) {
        if let Some(conn) = self.clients.write().await.get_mut(connection_id) {
            conn.owned_transports.insert(transport_id, role);
        }
    }

    pub async fn transport_count(&self, connection_id: &str) -> usize {
        self.clients
            .read()
            .await
            .get(connection_id)
            .map_or(0, |c| c.owned_transports.len())
    }

    pub async fn add_producer(&self, connection_id: &str, kind: String, producer_id: ProducerId) {
        if let Some(conn) = self.clients.write().await.get_mut(connection_id) {
            conn.owned_producers.insert(kind, producer_id);
        }
    }

    pub async fn add_consumer(
        &self,
        connection_id: &str,
        source_producer_id: ProducerId,
        consumer_id: ConsumerId,
    ) {
        if let Some(conn) = self.clients.write().await.get_mut(connection_id) {
            conn.owned_consumers.insert(source_producer_id, consumer_id);
        }
    }

    /// True if `producer_id` belongs to the user named by `user_id` —
    /// used by the `audio:selfMute`/`selfUnmute` owner check.
    pub async fn owns_producer(
        &self,
        connection_id: &str,
        producer_id: &ProducerId,
    ) -> bool {
        self.clients
            .read()
            .await
            .get(connection_id)
            .is_some_and_owns(producer_id)
    }

    pub async fn user_id_of(&self, connection_id: &str) -> Option<String> {
        self.clients
            .read()
            .await
            .get(connection_id)
            .map(|c| c.user_id.clone())
    }

    pub async fn room_id_of(&self, connection_id: &str) -> Option<String> {
        self.clients
            .read()
            .await
            .get(connection_id)
            .and_then(|c| c.room_id.clone())
    }

    /// Snapshot of every client currently recorded in `room_id`, pruning
    /// entries for which `is_connected` reports the socket is gone.
    pub async fn snapshot_room(
        &self,
        room_id: &str,
        is_connected: impl Fn(&str) -> bool,
    ) -> Vec<Participant> {
        let connection_ids: Vec<String> = self
            .by_room
            .read()
            .await
            .get(room_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut stale = Vec::new();
        let mut participants = Vec::new();
        {
            let clients = self.clients.read().await;
            for id in &connection_ids {
                match clients.get(id) {
                    Some(conn) if is_connected(id) => participants.push(Participant::from(conn)),
                    _ => stale.push(id.clone()),
                }
            }
        }
        for id in stale {
            self.remove(&id).await;
        }
        participants
    }

    pub async fn connection_ids_in_room(&self, room_id: &str) -> Vec<String> {
        self.by_room
            .read()
            .await
            .get(room_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The connection id of `user_id`'s (at most one) presence in
    /// `room_id`, if any — used to locate and close a kicked occupant's
    /// producer server-side (§4.4 lockSeat).
    pub async fn connection_id_for_user_in_room(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Option<String> {
        let connection_ids = self.connection_ids_in_room(room_id).await;
        let clients = self.clients.read().await;
        connection_ids
            .into_iter()
            .find(|id| clients.get(id).map_or(false, |c| c.user_id == user_id))
    }

    pub async fn producer_ids_of(&self, connection_id: &str) -> Vec<ProducerId> {
        self.clients
            .read()
            .await
            .get(connection_id)
            .map(|c| c.owned_producers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn clear_producer(&self, connection_id: &str, producer_id: &ProducerId) {
        if let Some(conn) = self.clients.write().await.get_mut(connection_id) {
            conn.owned_producers.retain(|_, p| p != producer_id);
        }
    }

    /// Every producer currently owned by a client in `room_id`, paired with
    /// its owner's `userId` — the `existingProducers` list a fresh
    /// room:join ack needs (§4.6).
    pub async fn producers_in_room(&self, room_id: &str) -> Vec<(ProducerId, String)> {
        let connection_ids = self.connection_ids_in_room(room_id).await;
        let clients = self.clients.read().await;
        let mut result = Vec::new();
        for id in connection_ids {
            if let Some(conn) = clients.get(&id) {
                for producer_id in conn.owned_producers.values() {
                    result.push((producer_id.clone(), conn.user_id.clone()));
                }
            }
        }
        result
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

trait OwnsProducer {
    fn is_some_and_owns(self, producer_id: &ProducerId) -> bool;
}

impl OwnsProducer for Option<&Connection> {
    fn is_some_and_owns(self, producer_id: &ProducerId) -> bool {
        match self {
            Some(c) => c.owned_producers.values().any(|p| p == producer_id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_room_moves_secondary_index_entry() {
        let registry = ClientRegistry::new();
        registry.register("c1".to_string(), "u1".to_string(), 0).await;
        registry.set_room("c1", "room-a").await;
        assert_eq!(registry.connection_ids_in_room("room-a").await, vec!["c1"]);

        registry.set_room("c1", "room-b").await;
        assert!(registry.connection_ids_in_room("room-a").await.is_empty());
        assert_eq!(registry.connection_ids_in_room("room-b").await, vec!["c1"]);
    }

    #[tokio::test]
    async fn leave_room_resets_owned_resources() {
        let registry = ClientRegistry::new();
        registry.register("c1".to_string(), "u1".to_string(), 0).await;
        registry.set_room("c1", "room-a").await;
        registry
            .add_transport(
                "c1",
                TransportId("t1".to_string()),
                TransportRole::Producer,
            )
            .await;
        assert_eq!(registry.transport_count("c1").await, 1);

        registry.leave_room("c1").await;
        assert_eq!(registry.transport_count("c1").await, 0);
        assert!(registry.connection_ids_in_room("room-a").await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_prunes_disconnected_sockets() {
        let registry = ClientRegistry::new();
        registry.register("c1".to_string(), "u1".to_string(), 0).await;
        registry.set_room("c1", "room-a").await;

        let snapshot = registry.snapshot_room("room-a", |_| false).await;
        assert!(snapshot.is_empty());
        assert!(registry.connection_ids_in_room("room-a").await.is_empty());
    }
}
