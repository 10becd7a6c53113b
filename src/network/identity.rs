//! Identity Store and Registry
//!
//! The durable identity store is an external collaborator: a lookup/create
//! service keyed by player id, whose records are treated as opaque. The
//! in-memory implementation here stands in for it. The registry keeps weak
//! references to live [`PlayerIdentity`] instances so that a returning
//! player always resolves to the same in-memory object instead of forking
//! state across devices.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rand::Rng;
use tokio::sync::RwLock;

use crate::game::player::{PlayerId, PlayerIdentity};

/// Bytes of entropy in a freshly minted secret token.
const TOKEN_BYTES: usize = 24;

/// Mint a fresh secret token, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// Opaque durable player record, as stored by the identity service.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    /// Durable id.
    pub id: PlayerId,
    /// Display name.
    pub name: String,
    /// Secret token, compared by equality.
    pub token: String,
}

/// In-memory stand-in for the durable identity store.
///
/// Lookups may involve external I/O in a real deployment, so the API is
/// async and callers must not hold global locks across it.
pub struct IdentityStore {
    records: RwLock<HashMap<PlayerId, IdentityRecord>>,
    next_id: AtomicU32,
}

impl IdentityStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Look up a player record by durable id.
    pub async fn lookup(&self, id: PlayerId) -> Option<IdentityRecord> {
        self.records.read().await.get(&id).cloned()
    }

    /// Mint a new durable player with a fresh id and secret token.
    pub async fn create(&self, name: &str) -> IdentityRecord {
        let id = PlayerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = IdentityRecord {
            id,
            name: name.to_string(),
            token: generate_token(),
        };

        self.records.write().await.insert(id, record.clone());
        record
    }

    /// Number of durable records.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Weak-reference registry of live identities.
///
/// An identity stays resolvable while any connection task or session roster
/// holds it; dead entries are purged opportunistically.
pub struct PlayerRegistry {
    inner: Mutex<HashMap<PlayerId, Weak<PlayerIdentity>>>,
}

impl PlayerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    /// Resolve the live identity for a record, or instantiate it.
    ///
    /// Check-and-insert happens under one lock, so two simultaneous logins
    /// with the same id end up sharing a single instance.
    pub fn resolve_or_insert(&self, record: IdentityRecord) -> Arc<PlayerIdentity> {
        let mut inner = self.inner.lock().expect("player registry poisoned");
        inner.retain(|_, weak| weak.strong_count() > 0);

        if let Some(existing) = inner.get(&record.id).and_then(Weak::upgrade) {
            return existing;
        }

        let player = Arc::new(PlayerIdentity::new(record.id, record.name, record.token));
        inner.insert(record.id, Arc::downgrade(&player));
        player
    }

    /// Number of identities with at least one live connection.
    pub fn online_count(&self) -> usize {
        let inner = self.inner.lock().expect("player registry poisoned");
        inner
            .values()
            .filter_map(Weak::upgrade)
            .filter(|p| p.is_online())
            .count()
    }
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
