//! §3 `Connection` (aka `Client`) entity — exclusively owned by the
//! instance that accepted the socket.

use std::collections::HashMap;

use crate::media::engine::{ConsumerId, ProducerId, TransportId, TransportRole};

#[derive(Clone, Debug)]
pub struct Connection {
    pub connection_id: String,
    pub user_id: String,
    pub room_id: Option<String>,
    pub joined_at_ms: i64,
    pub owned_transports: HashMap<TransportId, TransportRole>,
    pub owned_producers: HashMap<String, ProducerId>,
    pub owned_consumers: HashMap<ProducerId, ConsumerId>,
}

impl Connection {
    #[must_use]
    pub fn new(connection_id: String, user_id: String, joined_at_ms: i64) -> Self {
        Self {
            connection_id,
            user_id,
            room_id: None,
            joined_at_ms,
            owned_transports: HashMap::new(),
            owned_producers: HashMap::new(),
            owned_consumers: HashMap::new(),
        }
    }

    /// §3 invariant: `isSpeaker` iff the client owns at least one producer.
    #[must_use]
    pub fn is_speaker(&self) -> bool {
        !self.owned_producers.is_empty()
    }

    /// Drops every transport/producer/consumer this connection owned in
    /// its previous room, and clears its room assignment. Those resources
    /// belong to the session that just ended; a re-join must start clean
    /// so the `TRANSPORT_LIMIT_REACHED` check doesn't see stale entries.
    pub fn reset_room_state(&mut self) {
        self.room_id = None;
        self.owned_transports.clear();
        self.owned_producers.clear();
        self.owned_consumers.clear();
    }
}

/// A minimal, serializable view of a client for room-join snapshots.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Participant {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(rename = "isSpeaker")]
    pub is_speaker: bool,
}

impl From<&Connection> for Participant {
    fn from(c: &Connection) -> Self {
        Self {
            user_id: c.user_id.clone(),
            connection_id: c.connection_id.clone(),
            is_speaker: c.is_speaker(),
        }
    }
}
