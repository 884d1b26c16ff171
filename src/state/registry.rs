use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::dao::models::TeamEntity;
use crate::dao::team_store::TeamStore;
use crate::error::ServiceError;
use crate::state::team::Team;

/// Scoped lock handle over one team aggregate.
///
/// Holding the guard is the only way to read or mutate a team; the lock is
/// released on every exit path when the guard drops.
pub struct TeamGuard {
    entry: Arc<TeamEntry>,
    guard: OwnedMutexGuard<Team>,
}

impl std::fmt::Debug for TeamGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamGuard")
            .field("name", &self.guard.name())
            .field("evicted", &self.is_evicted())
            .finish()
    }
}

impl TeamGuard {
    /// Whether the registry evicted this team while (or before) the guard was
    /// held; a replaced entry must not be mutated further.
    pub fn is_evicted(&self) -> bool {
        self.entry.evicted.load(Ordering::Acquire)
    }
}

impl Deref for TeamGuard {
    type Target = Team;

    fn deref(&self) -> &Team {
        &self.guard
    }
}

impl DerefMut for TeamGuard {
    fn deref_mut(&mut self) -> &mut Team {
        &mut self.guard
    }
}

/// Result of a registry lookup.
pub enum Lookup {
    /// The team exists locally; the scoped lock is already held.
    Found(TeamGuard),
    /// A peer announced this name but the snapshot has not arrived yet. The
    /// receiver resolves once the placeholder does.
    Initializing(watch::Receiver<bool>),
    /// No such team, locally or in the backing store.
    NotFound,
}

struct TeamEntry {
    /// Display name, kept here so listing does not take the team lock.
    name: String,
    lock: Arc<Mutex<Team>>,
    evicted: AtomicBool,
}

/// Placeholder blocking a name while its snapshot travels from a peer.
#[derive(Clone)]
struct Placeholder {
    resolved: Arc<watch::Sender<bool>>,
}

impl Placeholder {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            resolved: Arc::new(tx),
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.resolved.subscribe()
    }

    fn resolve(&self) {
        let _ = self.resolved.send(true);
    }
}

#[derive(Clone)]
enum RegistrySlot {
    Ready(Arc<TeamEntry>),
    Initializing(Placeholder),
}

/// Owner of every active team on this node.
///
/// A concurrent map keyed by lowercased team name pairs each aggregate with
/// its mutual-exclusion lock; all access flows through scoped [`TeamGuard`]s
/// acquired with a bounded wait. Lookup misses fall back to the backing
/// store (fail open), and insertion races resolve by discarding the loser's
/// copy and re-reading the winner's.
pub struct TeamRegistry {
    slots: DashMap<String, RegistrySlot>,
    store: Arc<dyn TeamStore>,
    lock_wait: Duration,
}

impl TeamRegistry {
    /// Create a registry over the given store with the configured lock wait.
    pub fn new(store: Arc<dyn TeamStore>, lock_wait: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            store,
            lock_wait,
        }
    }

    /// The backing store this registry loads from and persists to.
    pub fn store(&self) -> &Arc<dyn TeamStore> {
        &self.store
    }

    /// Display names of all teams currently held (initializing names excluded).
    pub fn team_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.value() {
                RegistrySlot::Ready(entry) => Some(entry.name.clone()),
                RegistrySlot::Initializing(_) => None,
            })
            .collect()
    }

    /// Create a brand-new team and return its guard.
    ///
    /// Exactly one of any number of concurrent creators wins; the rest see
    /// already-exists, as do names still initializing from a peer.
    pub async fn create_team(&self, team: Team) -> Result<TeamGuard, ServiceError> {
        let key = team.name().to_lowercase();

        // A team persisted with active participants blocks the name even when
        // it is not in memory yet; an abandoned one is reclaimed here.
        if !self.slots.contains_key(&key) {
            match self.store.load_team(&key).await {
                Ok(Some(entity)) if entity.active_count() > 0 => {
                    self.insert_loaded(&key, entity);
                    return Err(ServiceError::AlreadyExists(format!("team `{key}`")));
                }
                Ok(Some(_)) => {
                    debug!(team = %key, "reclaiming abandoned team from store");
                    if let Err(err) = self.store.delete_team(&key).await {
                        warn!(team = %key, error = %err, "failed to delete abandoned team");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    // Fail open: a broken store never blocks a fresh session.
                    warn!(team = %key, error = %err, "store load failed during create");
                }
            }
        }

        let entry = Arc::new(TeamEntry {
            name: team.name().to_string(),
            lock: Arc::new(Mutex::new(team)),
            evicted: AtomicBool::new(false),
        });
        match self.slots.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(ServiceError::AlreadyExists(format!("team `{key}`")));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(RegistrySlot::Ready(Arc::clone(&entry)));
            }
        }

        let guard = self.lock_entry(entry).await?;
        self.persist(&guard).await;
        Ok(guard)
    }

    /// Insert a replica received from a peer.
    ///
    /// Returns `false` when a live team already owns the name; the caller's
    /// copy is discarded (insert-or-retry). Resolves a pending placeholder.
    pub fn attach_team(&self, team: Team) -> bool {
        let key = team.name().to_lowercase();
        let entry = Arc::new(TeamEntry {
            name: team.name().to_string(),
            lock: Arc::new(Mutex::new(team)),
            evicted: AtomicBool::new(false),
        });

        let placeholder = match self.slots.entry(key) {
            Entry::Occupied(mut occupied) => match occupied.get() {
                RegistrySlot::Ready(_) => return false,
                RegistrySlot::Initializing(placeholder) => {
                    let placeholder = placeholder.clone();
                    occupied.insert(RegistrySlot::Ready(entry));
                    Some(placeholder)
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(RegistrySlot::Ready(entry));
                None
            }
        };
        if let Some(placeholder) = placeholder {
            placeholder.resolve();
        }
        true
    }

    /// Look up a team by case-insensitive name, loading it from the backing
    /// store on a miss.
    pub async fn find(&self, name: &str) -> Result<Lookup, ServiceError> {
        let key = name.to_lowercase();
        loop {
            // Clone the slot out so no map shard stays borrowed across the
            // lock wait below.
            let slot = self.slots.get(&key).map(|s| s.value().clone());
            if let Some(slot) = slot {
                match slot {
                    RegistrySlot::Ready(entry) => {
                        let guard = self.lock_entry(entry).await?;
                        if guard.is_evicted() {
                            // Evicted while we waited; start over.
                            continue;
                        }
                        return Ok(Lookup::Found(guard));
                    }
                    RegistrySlot::Initializing(placeholder) => {
                        return Ok(Lookup::Initializing(placeholder.subscribe()));
                    }
                }
            }

            let entity = match self.store.load_team(&key).await {
                Ok(Some(entity)) => entity,
                Ok(None) => return Ok(Lookup::NotFound),
                Err(err) => {
                    // Fail open: a load failure reads as not-found.
                    warn!(team = %key, error = %err, "store load failed; treating as not found");
                    return Ok(Lookup::NotFound);
                }
            };
            if entity.active_count() == 0 {
                // A session whose last participant left before the node
                // observed it; reclaim it now.
                debug!(team = %key, "deleting abandoned team found in store");
                if let Err(err) = self.store.delete_team(&key).await {
                    warn!(team = %key, error = %err, "failed to delete abandoned team");
                }
                return Ok(Lookup::NotFound);
            }

            match self.insert_loaded(&key, entity) {
                Some(entry) => {
                    let guard = self.lock_entry(entry).await?;
                    if guard.is_evicted() {
                        continue;
                    }
                    return Ok(Lookup::Found(guard));
                }
                // Lost the insertion race; re-read the winner's entry.
                None => continue,
            }
        }
    }

    /// Convenience wrapper over [`TeamRegistry::find`] for callers that treat
    /// an initializing name as not-yet-available.
    pub async fn get_team(&self, name: &str) -> Result<TeamGuard, ServiceError> {
        match self.find(name).await? {
            Lookup::Found(guard) => Ok(guard),
            Lookup::Initializing(_) | Lookup::NotFound => {
                Err(ServiceError::NotFound(format!("team `{name}`")))
            }
        }
    }

    /// Lock a team only if this node already holds it in memory; never falls
    /// back to the store. Used by the bus inbound path so forwarded events do
    /// not grow replicas on nodes that serve no participant of the team.
    pub async fn get_if_present(&self, name: &str) -> Result<Option<TeamGuard>, ServiceError> {
        let key = name.to_lowercase();
        loop {
            let slot = self.slots.get(&key).map(|s| s.value().clone());
            let Some(slot) = slot else {
                return Ok(None);
            };
            match slot {
                RegistrySlot::Ready(entry) => {
                    let guard = self.lock_entry(entry).await?;
                    if guard.is_evicted() {
                        continue;
                    }
                    return Ok(Some(guard));
                }
                RegistrySlot::Initializing(_) => return Ok(None),
            }
        }
    }

    /// Reserve a name announced by a peer. Returns `false` when the name is
    /// already held or already initializing.
    pub fn mark_initializing(&self, name: &str) -> bool {
        match self.slots.entry(name.to_lowercase()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(RegistrySlot::Initializing(Placeholder::new()));
                true
            }
        }
    }

    /// Drop a placeholder whose snapshot never arrived, waking any waiters so
    /// they re-run their lookup (and observe not-found).
    pub fn abandon_initializing(&self, name: &str) {
        let key = name.to_lowercase();
        let slot = self.slots.get(&key).map(|s| s.value().clone());
        let removed = match slot {
            Some(RegistrySlot::Initializing(placeholder)) => {
                self.slots
                    .remove_if(&key, |_, slot| matches!(slot, RegistrySlot::Initializing(_)));
                Some(placeholder)
            }
            _ => None,
        };
        if let Some(placeholder) = removed {
            placeholder.resolve();
        }
    }

    /// Remove a team this node holds: unhook it from the map and delete it
    /// from the backing store, all while its scoped lock is held.
    pub async fn evict_team(&self, guard: &mut TeamGuard) {
        let key = guard.name().to_lowercase();
        guard.entry.evicted.store(true, Ordering::Release);
        self.slots
            .remove_if(&key, |_, slot| matches!(slot, RegistrySlot::Ready(_)));
        debug!(team = %key, "team evicted from registry");
        if let Err(err) = self.store.delete_team(&key).await {
            warn!(team = %key, error = %err, "failed to delete evicted team from store");
        }
    }

    /// Persist the team under the guard, best-effort.
    pub async fn persist(&self, guard: &TeamGuard) {
        let entity = TeamEntity::from_team(guard);
        if let Err(err) = self.store.save_team(entity).await {
            warn!(team = %guard.name(), error = %err, "failed to persist team");
        }
    }

    fn insert_loaded(&self, key: &str, entity: TeamEntity) -> Option<Arc<TeamEntry>> {
        let team: Team = entity.into();
        let entry = Arc::new(TeamEntry {
            name: team.name().to_string(),
            lock: Arc::new(Mutex::new(team)),
            evicted: AtomicBool::new(false),
        });
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(RegistrySlot::Ready(Arc::clone(&entry)));
                Some(entry)
            }
        }
    }

    /// Acquire the scoped lock with the bounded wait. Expiry is loud: the
    /// caller gets [`ServiceError::Busy`] and must not touch the aggregate.
    async fn lock_entry(&self, entry: Arc<TeamEntry>) -> Result<TeamGuard, ServiceError> {
        let lock = Arc::clone(&entry.lock);
        match timeout(self.lock_wait, lock.lock_owned()).await {
            Ok(guard) => Ok(TeamGuard { entry, guard }),
            Err(_) => {
                warn!(team = %entry.name, wait = ?self.lock_wait, "team lock wait expired");
                Err(ServiceError::Busy)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::memory::InMemoryTeamStore;
    use crate::state::estimation::Deck;

    fn registry() -> (TeamRegistry, InMemoryTeamStore) {
        let store = InMemoryTeamStore::new();
        let registry = TeamRegistry::new(Arc::new(store.clone()), Duration::from_millis(200));
        (registry, store)
    }

    fn team(name: &str) -> Team {
        Team::new(name, "Duracellko", Deck::standard()).unwrap()
    }

    #[tokio::test]
    async fn create_then_get_same_team() {
        let (registry, store) = registry();
        let guard = registry.create_team(team("My Team")).await.unwrap();
        drop(guard);
        assert_eq!(store.len(), 1);

        let guard = registry.get_team("my team").await.unwrap();
        assert_eq!(guard.name(), "My Team");
    }

    #[tokio::test]
    async fn concurrent_creates_have_exactly_one_winner() {
        let store: Arc<dyn TeamStore> = Arc::new(InMemoryTeamStore::new());
        let registry = Arc::new(TeamRegistry::new(store, Duration::from_millis(200)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.create_team(team("Contested")).await.map(drop)
            }));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => wins += 1,
                Err(ServiceError::AlreadyExists(_)) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn lock_wait_expiry_is_busy() {
        let (registry, _store) = registry();
        let guard = registry.create_team(team("Held")).await.unwrap();

        let err = registry.get_team("Held").await.unwrap_err();
        assert!(matches!(err, ServiceError::Busy));
        drop(guard);

        registry.get_team("Held").await.unwrap();
    }

    #[tokio::test]
    async fn miss_loads_from_store() {
        let (registry, store) = registry();
        let entity = TeamEntity::from_team(&team("Persisted"));
        store.save_team(entity).await.unwrap();

        let guard = registry.get_team("persisted").await.unwrap();
        assert_eq!(guard.name(), "Persisted");
    }

    #[tokio::test]
    async fn loaded_team_with_no_active_participants_is_reclaimed() {
        let (registry, store) = registry();
        let mut abandoned = team("Ghost");
        abandoned.disconnect("Duracellko").unwrap();
        store
            .save_team(TeamEntity::from_team(&abandoned))
            .await
            .unwrap();

        let err = registry.get_team("Ghost").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(store.is_empty(), "abandoned team not deleted from store");
    }

    #[tokio::test]
    async fn initializing_name_blocks_creation_until_attached() {
        let (registry, _store) = registry();
        assert!(registry.mark_initializing("Remote"));
        assert!(!registry.mark_initializing("remote"));

        let err = registry.create_team(team("Remote")).await.unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyExists(_)));

        let Lookup::Initializing(mut resolved) = registry.find("Remote").await.unwrap() else {
            panic!("expected initializing lookup");
        };

        assert!(registry.attach_team(team("Remote")));
        resolved.changed().await.unwrap();
        assert!(*resolved.borrow());
        registry.get_team("Remote").await.unwrap();
    }

    #[tokio::test]
    async fn attach_loses_to_existing_team() {
        let (registry, _store) = registry();
        registry.create_team(team("Mine")).await.unwrap();
        assert!(!registry.attach_team(team("Mine")));
    }

    #[tokio::test]
    async fn abandoned_placeholder_wakes_waiters_with_not_found() {
        let (registry, _store) = registry();
        registry.mark_initializing("Nowhere");
        let Lookup::Initializing(mut resolved) = registry.find("Nowhere").await.unwrap() else {
            panic!("expected initializing lookup");
        };

        registry.abandon_initializing("Nowhere");
        resolved.changed().await.unwrap();
        assert!(matches!(
            registry.find("Nowhere").await.unwrap(),
            Lookup::NotFound
        ));
    }

    #[tokio::test]
    async fn evicted_team_is_gone_everywhere() {
        let (registry, store) = registry();
        let mut guard = registry.create_team(team("Leaving")).await.unwrap();
        registry.evict_team(&mut guard).await;
        assert!(guard.is_evicted());
        drop(guard);

        assert!(matches!(
            registry.find("Leaving").await.unwrap(),
            Lookup::NotFound
        ));
        assert!(store.is_empty());
        assert!(registry.team_names().is_empty());
    }

    #[tokio::test]
    async fn mutations_serialize_under_the_lock() {
        let store: Arc<dyn TeamStore> = Arc::new(InMemoryTeamStore::new());
        let registry = Arc::new(TeamRegistry::new(store, Duration::from_secs(2)));
        {
            let mut guard = registry.create_team(team("Serial")).await.unwrap();
            guard.join("Me", false).unwrap();
        }

        // Interleave many concurrent joins; every one must observe a fully
        // consistent aggregate or fail cleanly, never corrupt it.
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let mut guard = registry.get_team("Serial").await?;
                let before = guard.participants().count();
                tokio::task::yield_now().await;
                guard.join(&format!("member-{i}"), false).map_err(|e| {
                    ServiceError::from(e)
                })?;
                assert_eq!(guard.participants().count(), before + 1);
                Ok::<(), ServiceError>(())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let guard = registry.get_team("Serial").await.unwrap();
        assert_eq!(guard.participants().count(), 18);
    }
}
