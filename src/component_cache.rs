//! # Component Cache (spec §4.D)
//!
//! A write-through cache of `ComponentRecord`s keyed by `(entityId, typeId)`,
//! abstracted behind a [`CacheProvider`] so an external KV store can stand in
//! for the in-process default. Stores explicit tombstones for confirmed-missing
//! keys (an implementer decision recorded in `DESIGN.md` — see spec §9 open
//! question 2) so repeat-miss traffic on an optional component doesn't bypass
//! the cache on every request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::EngineResult;
use crate::id::{ComponentId, EntityId, TypeId};

/// The cached unit: a component's full identity plus payload and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentRecord {
    /// The component's own id.
    pub id: ComponentId,
    /// The owning entity.
    pub entity_id: EntityId,
    /// The component's type id.
    pub type_id: TypeId,
    /// JSON payload.
    pub data: Value,
    /// Creation time (as stored).
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Last-modified time (as stored).
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<crate::sql::component::ComponentRow> for ComponentRecord {
    fn from(row: crate::sql::component::ComponentRow) -> Self {
        ComponentRecord {
            id: row.component_id,
            entity_id: row.entity_id,
            type_id: row.type_id,
            data: row.data,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Cache key: one `(entityId, typeId)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// The owning entity.
    pub entity_id: EntityId,
    /// The component's type id.
    pub type_id: TypeId,
}

impl CacheKey {
    /// Builds a key for one entity/type pair.
    pub fn new(entity_id: EntityId, type_id: TypeId) -> Self {
        CacheKey { entity_id, type_id }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "component:{}:{}", self.entity_id, self.type_id)
    }
}

/// What a lookup returns for one key: present, explicitly missing, or not
/// cached at all (the caller must consult storage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// A live component record was cached.
    Present(ComponentRecord),
    /// This key was confirmed absent in storage (a tombstone).
    Missing,
    /// No cache entry exists either way.
    Unknown,
}

enum Entry {
    Present(ComponentRecord),
    Missing,
}

struct TimedEntry {
    entry: Entry,
    expires_at: Instant,
}

/// Abstraction over the cache backing store (spec §4.D "Providers: ...
/// in-process map, external KV"). The in-process [`InMemoryCacheProvider`] is
/// the default; an external provider implements this trait against e.g. a
/// Redis-like store.
pub trait CacheProvider: Send + Sync {
    /// Reads one key.
    fn get(&self, key: &CacheKey) -> EngineResult<CacheLookup>;
    /// Reads many keys, returning a parallel array aligned to `keys`.
    fn get_many(&self, keys: &[CacheKey]) -> EngineResult<Vec<CacheLookup>> {
        keys.iter().map(|k| self.get(k)).collect()
    }
    /// Writes a present record with the given TTL.
    fn put(&self, key: CacheKey, record: ComponentRecord, ttl: Duration) -> EngineResult<()>;
    /// Writes a tombstone with the given TTL.
    fn put_missing(&self, key: CacheKey, ttl: Duration) -> EngineResult<()>;
    /// Removes one key outright (neither present nor tombstoned).
    fn invalidate(&self, key: &CacheKey) -> EngineResult<()>;
    /// Removes every key for one entity (spec §4.D "invalidate ... en masse
    /// when its owning entity is deleted").
    fn invalidate_entity(&self, entity_id: EntityId) -> EngineResult<()>;
}

/// The default in-process provider: a `HashMap` behind a `Mutex`, with
/// passive TTL expiry checked on read.
pub struct InMemoryCacheProvider {
    entries: Mutex<HashMap<CacheKey, TimedEntry>>,
}

impl Default for InMemoryCacheProvider {
    fn default() -> Self {
        InMemoryCacheProvider {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl CacheProvider for InMemoryCacheProvider {
    fn get(&self, key: &CacheKey) -> EngineResult<CacheLookup> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(timed) if timed.expires_at > Instant::now() => Ok(match &timed.entry {
                Entry::Present(record) => CacheLookup::Present(record.clone()),
                Entry::Missing => CacheLookup::Missing,
            }),
            Some(_) => {
                entries.remove(key);
                Ok(CacheLookup::Unknown)
            }
            None => Ok(CacheLookup::Unknown),
        }
    }

    fn put(&self, key: CacheKey, record: ComponentRecord, ttl: Duration) -> EngineResult<()> {
        self.entries.lock().unwrap().insert(
            key,
            TimedEntry {
                entry: Entry::Present(record),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn put_missing(&self, key: CacheKey, ttl: Duration) -> EngineResult<()> {
        self.entries.lock().unwrap().insert(
            key,
            TimedEntry {
                entry: Entry::Missing,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn invalidate(&self, key: &CacheKey) -> EngineResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn invalidate_entity(&self, entity_id: EntityId) -> EngineResult<()> {
        self.entries
            .lock()
            .unwrap()
            .retain(|key, _| key.entity_id != entity_id);
        Ok(())
    }
}

/// The façade over [`CacheProvider`] that the rest of the engine talks to.
/// Wraps every provider call so a provider failure is logged at `warn` and
/// downgraded to a cache miss rather than propagated (spec §7: "Cache
/// failures are logged at warn level and downgraded to a direct DB fetch").
pub struct ComponentCache {
    provider: Box<dyn CacheProvider>,
    ttl: Duration,
    enabled: bool,
}

impl ComponentCache {
    /// Builds a cache in front of `provider` with a fixed TTL for all
    /// entries (present and tombstoned alike).
    pub fn new(provider: Box<dyn CacheProvider>, ttl: Duration, enabled: bool) -> Self {
        ComponentCache { provider, ttl, enabled }
    }

    /// An enabled in-process cache with the given TTL; the common case.
    pub fn in_memory(ttl: Duration) -> Self {
        ComponentCache::new(Box::new(InMemoryCacheProvider::default()), ttl, true)
    }

    fn downgrade<T>(&self, result: EngineResult<T>, fallback: T) -> T {
        match result {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "component cache provider failed, falling back to direct fetch");
                fallback
            }
        }
    }

    /// Reads one key. Returns `Unknown` immediately, without touching the
    /// provider, when caching is disabled or bypassed via `noCache`.
    pub fn get(&self, key: CacheKey, bypass: bool) -> CacheLookup {
        if !self.enabled || bypass {
            return CacheLookup::Unknown;
        }
        self.downgrade(self.provider.get(&key), CacheLookup::Unknown)
    }

    /// Reads many keys at once, aligned to `keys` (spec §4.D "multi-key batch
    /// API returns a parallel array").
    pub fn get_many(&self, keys: &[CacheKey], bypass: bool) -> Vec<CacheLookup> {
        if !self.enabled || bypass {
            return keys.iter().map(|_| CacheLookup::Unknown).collect();
        }
        self.downgrade(
            self.provider.get_many(keys),
            keys.iter().map(|_| CacheLookup::Unknown).collect(),
        )
    }

    /// Write-through after a successful save (spec §4.F save step 8).
    pub fn put(&self, key: CacheKey, record: ComponentRecord) {
        if !self.enabled {
            return;
        }
        self.downgrade(self.provider.put(key, record, self.ttl), ());
    }

    /// Records a confirmed-missing key so repeat lookups short-circuit.
    pub fn put_missing(&self, key: CacheKey) {
        if !self.enabled {
            return;
        }
        self.downgrade(self.provider.put_missing(key, self.ttl), ());
    }

    /// Drops one key (e.g. the component was removed).
    pub fn invalidate(&self, key: CacheKey) {
        if !self.enabled {
            return;
        }
        self.downgrade(self.provider.invalidate(&key), ());
    }

    /// Drops every cached key for one entity (`Entity::delete`).
    pub fn invalidate_entity(&self, entity_id: EntityId) {
        if !self.enabled {
            return;
        }
        self.downgrade(self.provider.invalidate_entity(entity_id), ());
    }

    /// Whether caching is on at all (distinct from a per-call `noCache`
    /// bypass).
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record(entity_id: EntityId, type_id: TypeId) -> ComponentRecord {
        ComponentRecord {
            id: ComponentId::generate().unwrap(),
            entity_id,
            type_id,
            data: json!({"name": "Ada"}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = ComponentCache::in_memory(Duration::from_secs(30));
        let entity_id = EntityId::generate().unwrap();
        let type_id = TypeId::derive_from_name("Profile");
        let key = CacheKey::new(entity_id, type_id);
        let record = sample_record(entity_id, type_id);

        cache.put(key, record.clone());

        assert_eq!(cache.get(key, false), CacheLookup::Present(record));
    }

    #[test]
    fn tombstone_is_distinguishable_from_unknown() {
        let cache = ComponentCache::in_memory(Duration::from_secs(30));
        let entity_id = EntityId::generate().unwrap();
        let type_id = TypeId::derive_from_name("Settings");
        let key = CacheKey::new(entity_id, type_id);

        assert_eq!(cache.get(key, false), CacheLookup::Unknown);

        cache.put_missing(key);
        assert_eq!(cache.get(key, false), CacheLookup::Missing);
    }

    #[test]
    fn bypass_never_touches_the_provider() {
        let cache = ComponentCache::in_memory(Duration::from_secs(30));
        let entity_id = EntityId::generate().unwrap();
        let type_id = TypeId::derive_from_name("Profile");
        let key = CacheKey::new(entity_id, type_id);
        cache.put(key, sample_record(entity_id, type_id));

        assert_eq!(cache.get(key, true), CacheLookup::Unknown);
    }

    #[test]
    fn invalidate_entity_clears_every_key_for_that_entity_only() {
        let cache = ComponentCache::in_memory(Duration::from_secs(30));
        let entity_a = EntityId::generate().unwrap();
        let entity_b = EntityId::generate().unwrap();
        let type_id = TypeId::derive_from_name("Profile");
        let key_a = CacheKey::new(entity_a, type_id);
        let key_b = CacheKey::new(entity_b, type_id);
        cache.put(key_a, sample_record(entity_a, type_id));
        cache.put(key_b, sample_record(entity_b, type_id));

        cache.invalidate_entity(entity_a);

        assert_eq!(cache.get(key_a, false), CacheLookup::Unknown);
        assert!(matches!(cache.get(key_b, false), CacheLookup::Present(_)));
    }

    #[test]
    fn disabled_cache_never_stores_anything() {
        let cache = ComponentCache::new(Box::new(InMemoryCacheProvider::default()), Duration::from_secs(30), false);
        let entity_id = EntityId::generate().unwrap();
        let type_id = TypeId::derive_from_name("Profile");
        let key = CacheKey::new(entity_id, type_id);

        cache.put(key, sample_record(entity_id, type_id));

        assert_eq!(cache.get(key, false), CacheLookup::Unknown);
    }

    #[test]
    fn get_many_is_aligned_to_input_keys() {
        let cache = ComponentCache::in_memory(Duration::from_secs(30));
        let entity_a = EntityId::generate().unwrap();
        let entity_b = EntityId::generate().unwrap();
        let type_id = TypeId::derive_from_name("Profile");
        let key_a = CacheKey::new(entity_a, type_id);
        let key_b = CacheKey::new(entity_b, type_id);
        cache.put(key_a, sample_record(entity_a, type_id));

        let results = cache.get_many(&[key_a, key_b], false);

        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], CacheLookup::Present(_)));
        assert_eq!(results[1], CacheLookup::Unknown);
    }
}
