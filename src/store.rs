use bytes::Bytes;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

use crate::snapshot::{Snapshot, SnapshotError};

/// The Store holds every key-value pair in memory and writes the whole key space through to its
/// [`Snapshot`] after each mutation, before the mutating call returns.
///
/// The store is shared by all connections and cloned cheaply through reference counting. All
/// access goes through [`InnerStore::lock`], so a mutation and the persist that follows it form
/// one critical section and can never interleave with another command.
///
/// Two tradeoffs are deliberate:
///
/// * Persisting is a synchronous disk write done while the lock is held, on whichever runtime
///   worker runs the command. A slow disk stalls every command that needs the store, and that
///   worker, until the write finishes. Connections keep reading and buffering their input
///   meanwhile.
/// * Durability is best effort. When a persist fails the error is logged and the mutation still
///   stands in memory, so the client gets a success reply for a change the snapshot may lack.
#[derive(Clone)]
pub struct Store {
    inner: Arc<InnerStore>,
}

impl Store {
    /// Creates an empty store that is never persisted.
    pub fn new() -> Store {
        Self::with_state(HashMap::new(), None)
    }

    /// Creates a store backed by `snapshot`, hydrated from it.
    ///
    /// A snapshot that cannot be read is logged and the store starts empty.
    pub fn open(snapshot: impl Snapshot + 'static) -> Store {
        let keys = match snapshot.load() {
            Ok(Some(keys)) => {
                info!("Loaded {} keys from snapshot", keys.len());
                keys
            }
            Ok(None) => {
                info!("No snapshot found, starting with an empty store");
                HashMap::new()
            }
            Err(e) => {
                error!("Failed to load snapshot, starting with an empty store: {}", e);
                HashMap::new()
            }
        };

        Self::with_state(keys, Some(Box::new(snapshot)))
    }

    fn with_state(keys: HashMap<Key, Bytes>, snapshot: Option<Box<dyn Snapshot>>) -> Store {
        let inner = Arc::new(InnerStore {
            state: Mutex::new(State { keys }),
            snapshot,
        });

        Self { inner }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InnerStore {
    state: Mutex<State>,
    snapshot: Option<Box<dyn Snapshot>>,
}

pub struct InnerStoreLocked<'a> {
    state: MutexGuard<'a, State>,
    snapshot: Option<&'a dyn Snapshot>,
}

impl<'a> InnerStoreLocked<'a> {
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.state.keys.get(key).cloned()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.state.keys.contains_key(key)
    }

    pub fn size(&self) -> usize {
        self.state.keys.len()
    }

    /// Inserts or overwrites `key`, then persists. `key` must not be empty.
    pub fn set(&mut self, key: String, data: Bytes) {
        debug_assert!(!key.is_empty(), "store keys must not be empty");
        self.state.keys.insert(key, data);
        self.persist_or_log();
    }

    /// Removes every present key among `keys` and returns how many were removed. Persists only
    /// when something was removed.
    pub fn delete<'k>(&mut self, keys: impl IntoIterator<Item = &'k str>) -> usize {
        let removed = keys
            .into_iter()
            .filter(|key| self.state.keys.remove(*key).is_some())
            .count();

        if removed > 0 {
            self.persist_or_log();
        }

        removed
    }

    /// Writes the whole key space to the snapshot, if the store has one.
    pub fn persist(&self) -> Result<(), SnapshotError> {
        match self.snapshot {
            Some(snapshot) => snapshot.save(&self.state.keys),
            None => Ok(()),
        }
    }

    fn persist_or_log(&self) {
        match self.persist() {
            Ok(()) => debug!("Persisted {} keys", self.state.keys.len()),
            Err(e) => error!("Failed to persist store: {}", e),
        }
    }
}

impl Deref for Store {
    type Target = InnerStore;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl InnerStore {
    pub fn lock(&self) -> InnerStoreLocked<'_> {
        // A panic while holding the lock cannot leave the map half-updated, so the state is
        // still usable.
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        InnerStoreLocked {
            state,
            snapshot: self.snapshot.as_deref(),
        }
    }
}

type Key = String;

struct State {
    keys: HashMap<Key, Bytes>,
}
