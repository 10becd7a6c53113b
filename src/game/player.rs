//! Player Identity
//!
//! A durable player record, independent of any single transport connection
//! or game session. Identities survive disconnects and finished games; only
//! process shutdown discards them.

use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::game::session::GameId;
use crate::network::protocol::{PlayerSummary, ServerPacket};

/// Durable player identifier, stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub u32);

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live transport connection attached to an identity.
///
/// The sender feeds the per-socket writer task; dropping the receiving half
/// (socket gone) makes sends fail, which is treated as a no-op here.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Transport connection identifier.
    pub id: Uuid,
    /// Outbound packet channel for this socket.
    pub tx: mpsc::UnboundedSender<ServerPacket>,
}

impl Connection {
    /// Create a connection handle with a fresh id.
    pub fn new(tx: mpsc::UnboundedSender<ServerPacket>) -> Self {
        Self { id: Uuid::new_v4(), tx }
    }
}

/// A durable player: id, display name, secret token, and the set of live
/// connections (zero = offline, many = multiple tabs/devices).
///
/// The session back-reference is a plain id, not an ownership edge; the
/// session owns the participation record for the round, the identity owns
/// the long-lived profile.
#[derive(Debug)]
pub struct PlayerIdentity {
    /// Durable id.
    pub id: PlayerId,
    /// Display name.
    pub name: String,
    /// Capability credential, compared by equality.
    pub token: String,
    connections: Mutex<Vec<Connection>>,
    session: Mutex<Option<GameId>>,
}

impl PlayerIdentity {
    /// Create an identity with no connections and no session.
    pub fn new(id: PlayerId, name: String, token: String) -> Self {
        Self {
            id,
            name,
            token,
            connections: Mutex::new(Vec::new()),
            session: Mutex::new(None),
        }
    }

    /// Send a packet to every live connection of this player.
    ///
    /// Best-effort: a closed connection is skipped, it never affects the
    /// other connections or the caller.
    pub fn send_packet(&self, packet: &ServerPacket) {
        let connections = self.connections.lock().expect("connection set poisoned");
        for connection in connections.iter() {
            let _ = connection.tx.send(packet.clone());
        }
    }

    /// Attach a new transport connection.
    pub fn attach_connection(&self, connection: Connection) {
        self.connections
            .lock()
            .expect("connection set poisoned")
            .push(connection);
    }

    /// Detach a transport connection by id.
    ///
    /// Returns the number of connections left, or `None` if the connection
    /// was not attached (an invariant violation the caller should log).
    pub fn detach_connection(&self, connection_id: Uuid) -> Option<usize> {
        let mut connections = self.connections.lock().expect("connection set poisoned");
        let i = connections.iter().position(|c| c.id == connection_id)?;
        connections.remove(i);
        Some(connections.len())
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("connection set poisoned").len()
    }

    /// Whether at least one connection is live.
    pub fn is_online(&self) -> bool {
        self.connection_count() > 0
    }

    /// The session this player currently participates in, if any.
    pub fn session(&self) -> Option<GameId> {
        *self.session.lock().expect("session ref poisoned")
    }

    /// Point the player at a session (or clear with `None`).
    pub fn set_session(&self, game: Option<GameId>) {
        *self.session.lock().expect("session ref poisoned") = game;
    }

    /// Clear the session back-reference, but only if it still points at
    /// `game`. A newer assignment wins.
    pub fn clear_session_if(&self, game: GameId) {
        let mut session = self.session.lock().expect("session ref poisoned");
        if *session == Some(game) {
            *session = None;
        }
    }

    /// Wire summary of this player.
    pub fn summary(&self) -> PlayerSummary {
        PlayerSummary {
            id: self.id,
            name: self.name.clone(),
        }
    }
}
