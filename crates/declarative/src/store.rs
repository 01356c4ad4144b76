//! State store - last known live state per identity
//!
//! Reads are concurrent. Mutations of one identity are serialized through
//! [`StateStore::lock`], which never blocks work on other identities. A
//! store opened from a path rewrites its JSON file after every mutation.
//!
//! Besides live state the store keeps caller-chosen addresses bound to
//! identities. An address is how a host refers to a resource whose name the
//! remote assigned.

use crate::error::{Error, Result};
use crate::types::{LiveState, ResourceIdentity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, PoisonError, RwLock};

const STATE_VERSION: u32 = 1;

/// On-disk layout of a persisted store
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    resources: Vec<LiveState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    addresses: BTreeMap<String, ResourceIdentity>,
}

type Addresses = BTreeMap<String, ResourceIdentity>;

/// Concurrent map of identity to last known live state
#[derive(Debug, Default)]
pub struct StateStore {
    entries: RwLock<HashMap<ResourceIdentity, LiveState>>,
    addresses: RwLock<Addresses>,
    held: Mutex<HashSet<ResourceIdentity>>,
    released: Condvar,
    path: Option<PathBuf>,
}

/// Exclusive hold on one identity, released on drop
#[derive(Debug)]
pub struct IdentityGuard<'a> {
    store: &'a StateStore,
    identity: ResourceIdentity,
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        self.store
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.identity);
        self.store.released.notify_all();
    }
}

impl StateStore {
    /// In-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store persisted at `path`, loading it if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = HashMap::new();
        let mut addresses = Addresses::new();

        if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| storage(&path, e))?;
            let file: StateFile = serde_json::from_str(&content).map_err(|e| storage(&path, e))?;
            if file.version != STATE_VERSION {
                return Err(storage(
                    &path,
                    format!("unsupported state version {}", file.version),
                ));
            }
            for live in file.resources {
                entries.insert(live.identity.clone(), live);
            }
            addresses = file.addresses;
            log::debug!("Loaded {} resource(s) from {}", entries.len(), path.display());
        } else {
            log::debug!("State file {} does not exist, starting empty", path.display());
        }

        Ok(Self {
            entries: RwLock::new(entries),
            addresses: RwLock::new(addresses),
            path: Some(path),
            ..Self::default()
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, identity: &ResourceIdentity) -> Option<LiveState> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    pub fn contains(&self, identity: &ResourceIdentity) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(identity)
    }

    /// Record live state, replacing what was there. Memory is left
    /// untouched when the file cannot be written.
    pub fn put(&self, live: LiveState) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let addresses = self.addresses.read().unwrap_or_else(PoisonError::into_inner);
        if self.path.is_none() {
            entries.insert(live.identity.clone(), live);
            return Ok(());
        }
        let mut next = entries.clone();
        next.insert(live.identity.clone(), live);
        self.persist(&next, &addresses)?;
        *entries = next;
        Ok(())
    }

    /// Forget an identity and every address bound to it
    pub fn remove(&self, identity: &ResourceIdentity) -> Result<Option<LiveState>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut addresses = self.addresses.write().unwrap_or_else(PoisonError::into_inner);
        let bound = addresses.values().any(|id| id == identity);
        if !entries.contains_key(identity) && !bound {
            return Ok(None);
        }

        let mut next = entries.clone();
        let removed = next.remove(identity);
        let mut next_addresses = addresses.clone();
        next_addresses.retain(|_, id| id != identity);
        self.persist(&next, &next_addresses)?;
        *entries = next;
        *addresses = next_addresses;
        Ok(removed)
    }

    /// Bind `address` to `identity`, replacing an earlier binding
    pub fn bind(&self, address: &str, identity: &ResourceIdentity) -> Result<()> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut addresses = self.addresses.write().unwrap_or_else(PoisonError::into_inner);
        if addresses.get(address) == Some(identity) {
            return Ok(());
        }
        let mut next = addresses.clone();
        next.insert(address.to_string(), identity.clone());
        self.persist(&entries, &next)?;
        *addresses = next;
        log::debug!("Bound {address} to {identity}");
        Ok(())
    }

    /// The recorded identity an address is bound to
    pub fn resolve(&self, address: &str) -> Option<ResourceIdentity> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .filter(|id| entries.contains_key(*id))
            .cloned()
    }

    /// Addresses bound to `identity`, sorted
    pub fn addresses_of(&self, identity: &ResourceIdentity) -> Vec<String> {
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, id)| *id == identity)
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Known identities, sorted
    pub fn identities(&self) -> Vec<ResourceIdentity> {
        let mut ids: Vec<ResourceIdentity> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until no one else holds `identity`, then hold it.
    pub fn lock(&self, identity: &ResourceIdentity) -> IdentityGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(identity) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(identity.clone());
        IdentityGuard {
            store: self,
            identity: identity.clone(),
        }
    }

    /// Write the file through a sibling temp file and rename.
    fn persist(&self, entries: &HashMap<ResourceIdentity, LiveState>, addresses: &Addresses) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut resources: Vec<LiveState> = entries.values().cloned().collect();
        resources.sort_by(|a, b| a.identity.cmp(&b.identity));
        let file = StateFile {
            version: STATE_VERSION,
            resources,
            addresses: addresses.clone(),
        };
        let content = serde_json::to_string_pretty(&file).map_err(|e| storage(path, e))?;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| storage(path, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| storage(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| storage(path, e))?;
        log::debug!("Saved state to {}", path.display());
        Ok(())
    }
}

fn storage(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::Storage {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CanonicalConfig, fingerprint};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn live(name: &str, size: i64) -> LiveState {
        let attributes: CanonicalConfig = [("size".to_string(), json!(size))].into_iter().collect();
        LiveState {
            identity: ResourceIdentity::new("widget", "proj", name),
            fingerprint: fingerprint(&attributes),
            attributes,
            observed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_put_get_remove() {
        let store = StateStore::new();
        let w1 = live("w1", 1);
        store.put(w1.clone()).unwrap();
        store.put(live("w0", 2)).unwrap();

        assert_eq!(store.get(&w1.identity), Some(w1.clone()));
        assert_eq!(store.identities()[0].name, "w0");
        assert_eq!(store.remove(&w1.identity).unwrap(), Some(w1.clone()));
        assert!(!store.contains(&w1.identity));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = StateStore::open(&path).unwrap();
        assert!(store.is_empty());
        let w1 = live("w1", 3);
        store.put(w1.clone()).unwrap();
        store.put(live("w2", 4)).unwrap();
        store.remove(&live("w2", 4).identity).unwrap();

        let reopened = StateStore::open(&path).unwrap();
        assert_eq!(reopened.identities(), vec![w1.identity.clone()]);
        assert_eq!(reopened.get(&w1.identity).unwrap().fingerprint, w1.fingerprint);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_failed_write_keeps_memory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::open(&path).unwrap();
        let w1 = live("w1", 1);
        store.put(w1.clone()).unwrap();

        // A directory where the temp file should go makes every write fail
        fs::create_dir(path.with_extension("json.tmp")).unwrap();
        let err = store.put(live("w1", 2)).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert_eq!(store.get(&w1.identity), Some(w1.clone()));
        assert!(store.remove(&w1.identity).is_err());
        assert!(store.contains(&w1.identity));

        let reopened = StateStore::open(&path).unwrap();
        assert_eq!(reopened.get(&w1.identity), Some(w1));
    }

    #[test]
    fn test_addresses_persist_and_follow_removal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::open(&path).unwrap();
        let w1 = live("w1", 1);
        store.put(w1.clone()).unwrap();
        store.bind("widget.nightly", &w1.identity).unwrap();
        assert_eq!(store.resolve("widget.nightly"), Some(w1.identity.clone()));
        assert!(store.resolve("widget.other").is_none());

        let reopened = StateStore::open(&path).unwrap();
        assert_eq!(reopened.resolve("widget.nightly"), Some(w1.identity.clone()));
        assert_eq!(reopened.addresses_of(&w1.identity), vec!["widget.nightly".to_string()]);

        reopened.remove(&w1.identity).unwrap();
        assert!(reopened.resolve("widget.nightly").is_none());
        assert!(StateStore::open(&path).unwrap().addresses_of(&w1.identity).is_empty());
    }

    #[test]
    fn test_unrecorded_binding_does_not_resolve() {
        let store = StateStore::new();
        let id = ResourceIdentity::new("widget", "proj", "gone");
        store.bind("widget.gone", &id).unwrap();
        assert!(store.resolve("widget.gone").is_none());
    }

    #[test]
    fn test_corrupt_file_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();
        let err = StateStore::open(&path).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
    }

    #[test]
    fn test_lock_serializes_one_identity() {
        let store = StateStore::new();
        let id = ResourceIdentity::new("widget", "proj", "w1");
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let _guard = store.lock(&id);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lock_independent_identities() {
        let store = StateStore::new();
        let a = ResourceIdentity::new("widget", "proj", "a");
        let b = ResourceIdentity::new("widget", "proj", "b");
        let _a = store.lock(&a);
        // would deadlock if locks were global
        let _b = store.lock(&b);
        assert!(store.held.lock().unwrap().contains(&b));
    }
}
