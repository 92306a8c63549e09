//! # Request Loaders (spec §4.E)
//!
//! Three per-request batching loaders (`entityById`, `componentByEntityType`,
//! `relationsByEntityField`) built on one generic debounced [`BatchLoader`]:
//! calls made within the same micro-batch window are de-duplicated and
//! issued as one bulk SQL statement per distinct shape, the common
//! async-dataloader pattern built directly on `tokio` rather than a
//! dataloader crate.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{oneshot, Mutex};

use crate::component_cache::{CacheKey, CacheLookup, ComponentCache, ComponentRecord};
use crate::error::{EngineError, EngineResult};
use crate::id::{EntityId, TypeId};
use crate::sql;

type FetchFuture<V> = Pin<Box<dyn Future<Output = EngineResult<V>> + Send>>;
type FetchFn<K, V> = Arc<dyn Fn(Vec<K>) -> FetchFuture<HashMap<K, V>> + Send + Sync>;

fn duplicate_for_fanout(err: &EngineError) -> EngineError {
    EngineError::Transient(err.to_string())
}

struct PendingState<K, V> {
    waiters: HashMap<K, Vec<oneshot::Sender<EngineResult<Option<V>>>>>,
}

/// Collapses concurrent `load(key)` calls made within one debounce window
/// into a single bulk fetch, fanning the result back out aligned to each
/// caller's key (spec §4.E: "collects calls made within the same micro-batch
/// window, de-duplicates keys, and issues one bulk SQL query per distinct
/// shape").
pub struct BatchLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fetch: FetchFn<K, V>,
    batch_window: Duration,
    max_batch_size: usize,
    state: Arc<Mutex<PendingState<K, V>>>,
    scheduled: Arc<AtomicBool>,
}

impl<K, V> BatchLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Builds a loader around `fetch`, a bulk-lookup function that receives
    /// the deduplicated keys from one batch and returns whichever subset was
    /// found, keyed by the same `K`.
    pub fn new(batch_window: Duration, max_batch_size: usize, fetch: FetchFn<K, V>) -> Self {
        BatchLoader {
            fetch,
            batch_window,
            max_batch_size: max_batch_size.max(1),
            state: Arc::new(Mutex::new(PendingState {
                waiters: HashMap::new(),
            })),
            scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Loads one key, waiting for this key's batch to flush. `Ok(None)`
    /// means the key was looked up and not found; `Err` means the bulk fetch
    /// itself failed.
    pub async fn load(&self, key: K) -> EngineResult<Option<V>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.waiters.entry(key).or_default().push(tx);
        }
        self.schedule_flush();
        rx.await
            .unwrap_or_else(|_| Err(EngineError::Transient("loader batch was dropped".to_string())))
    }

    /// Loads many keys, preserving input order in the output (spec §8
    /// invariant 5: loader alignment).
    pub async fn load_many(&self, keys: &[K]) -> EngineResult<Vec<Option<V>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.load(key.clone()).await?);
        }
        Ok(results)
    }

    fn schedule_flush(&self) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = Arc::clone(&self.state);
        let scheduled = Arc::clone(&self.scheduled);
        let fetch = Arc::clone(&self.fetch);
        let batch_window = self.batch_window;
        let max_batch_size = self.max_batch_size;

        tokio::spawn(async move {
            tokio::time::sleep(batch_window).await;

            let waiters = {
                let mut guard = state.lock().await;
                scheduled.store(false, Ordering::SeqCst);
                std::mem::take(&mut guard.waiters)
            };

            if waiters.is_empty() {
                return;
            }

            let keys: Vec<K> = waiters.keys().cloned().collect();
            let mut combined: HashMap<K, V> = HashMap::new();
            let mut fetch_err: Option<EngineError> = None;

            for chunk in keys.chunks(max_batch_size) {
                match (fetch)(chunk.to_vec()).await {
                    Ok(found) => combined.extend(found),
                    Err(err) => {
                        tracing::warn!(error = %err, "loader batch fetch failed");
                        fetch_err = Some(err);
                        break;
                    }
                }
            }

            for (key, senders) in waiters {
                let response: EngineResult<Option<V>> = match &fetch_err {
                    Some(err) => Err(duplicate_for_fanout(err)),
                    None => Ok(combined.get(&key).cloned()),
                };
                for sender in senders {
                    let to_send = match &response {
                        Ok(v) => Ok(v.clone()),
                        Err(err) => Err(duplicate_for_fanout(err)),
                    };
                    let _ = sender.send(to_send);
                }
            }
        });
    }
}

/// Loader #1: `entityById(id) -> Entity|null` (here, the raw storage row;
/// `entity::Entity` rehydration happens one layer up to avoid a loaders ->
/// entity -> loaders import cycle).
pub struct EntityLoader {
    inner: BatchLoader<EntityId, sql::entity::EntityRow>,
}

impl EntityLoader {
    /// Builds a loader against `pool` with the given batching parameters.
    pub fn new(pool: PgPool, batch_window: Duration, max_batch_size: usize) -> Self {
        let fetch: FetchFn<EntityId, sql::entity::EntityRow> = Arc::new(move |ids| {
            let pool = pool.clone();
            Box::pin(async move {
                let rows = sql::entity::get_many(&pool, &ids).await?;
                Ok(rows.into_iter().map(|row| (row.id, row)).collect())
            })
        });
        EntityLoader {
            inner: BatchLoader::new(batch_window, max_batch_size, fetch),
        }
    }

    /// Loads one entity row by id.
    pub async fn load(&self, id: EntityId) -> EngineResult<Option<sql::entity::EntityRow>> {
        self.inner.load(id).await
    }

    /// Loads many entity rows, aligned to `ids`.
    pub async fn load_many(&self, ids: &[EntityId]) -> EngineResult<Vec<Option<sql::entity::EntityRow>>> {
        self.inner.load_many(ids).await
    }
}

/// Loader #2 key: one component of one type on one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentKey {
    /// Owning entity.
    pub entity_id: EntityId,
    /// Component type.
    pub type_id: TypeId,
}

/// Loader #2: `componentByEntityType({entityId, typeId}) -> ComponentRecord|null`.
/// Consults the component cache before issuing any SQL, per spec §4.E
/// contract steps 1-5: cache-read, bulk-fetch misses, write-through, align
/// to input.
pub struct ComponentLoader {
    pool: PgPool,
    cache: Arc<ComponentCache>,
    batch_window: Duration,
    max_batch_size: usize,
    state: Arc<Mutex<PendingState<ComponentKey, ComponentRecord>>>,
    scheduled: Arc<AtomicBool>,
    bypass_cache: bool,
}

impl ComponentLoader {
    /// Builds a loader against `pool`, read-through on `cache`.
    /// `bypass_cache` mirrors `noCache({component: true})` for this
    /// loader's lifetime (spec §4.G).
    pub fn new(
        pool: PgPool,
        cache: Arc<ComponentCache>,
        batch_window: Duration,
        max_batch_size: usize,
        bypass_cache: bool,
    ) -> Self {
        ComponentLoader {
            pool,
            cache,
            batch_window,
            max_batch_size: max_batch_size.max(1),
            state: Arc::new(Mutex::new(PendingState {
                waiters: HashMap::new(),
            })),
            scheduled: Arc::new(AtomicBool::new(false)),
            bypass_cache,
        }
    }

    /// Loads one component by `(entityId, typeId)`.
    pub async fn load(&self, key: ComponentKey) -> EngineResult<Option<ComponentRecord>> {
        match self.cache.get(CacheKey::new(key.entity_id, key.type_id), self.bypass_cache) {
            CacheLookup::Present(record) => return Ok(Some(record)),
            CacheLookup::Missing => return Ok(None),
            CacheLookup::Unknown => {}
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.waiters.entry(key).or_default().push(tx);
        }
        self.schedule_flush();
        rx.await
            .unwrap_or_else(|_| Err(EngineError::Transient("loader batch was dropped".to_string())))
    }

    /// Loads many components, aligned to `keys`.
    pub async fn load_many(&self, keys: &[ComponentKey]) -> EngineResult<Vec<Option<ComponentRecord>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.load(*key).await?);
        }
        Ok(results)
    }

    fn schedule_flush(&self) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = Arc::clone(&self.state);
        let scheduled = Arc::clone(&self.scheduled);
        let pool = self.pool.clone();
        let cache = Arc::clone(&self.cache);
        let batch_window = self.batch_window;
        let max_batch_size = self.max_batch_size;
        let bypass_cache = self.bypass_cache;

        tokio::spawn(async move {
            tokio::time::sleep(batch_window).await;

            let waiters = {
                let mut guard = state.lock().await;
                scheduled.store(false, Ordering::SeqCst);
                std::mem::take(&mut guard.waiters)
            };

            if waiters.is_empty() {
                return;
            }

            let keys: Vec<ComponentKey> = waiters.keys().cloned().collect();
            let entity_ids: Vec<EntityId> = keys.iter().map(|k| k.entity_id).collect();
            let type_ids: Vec<TypeId> = keys.iter().map(|k| k.type_id).collect();

            let mut fetch_err: Option<EngineError> = None;
            let mut found: HashMap<ComponentKey, ComponentRecord> = HashMap::new();

            for entity_chunk in entity_ids.chunks(max_batch_size) {
                match sql::component::get_many(&pool, entity_chunk, &type_ids).await {
                    Ok(rows) => {
                        for row in rows {
                            let record: ComponentRecord = row.into();
                            found.insert(
                                ComponentKey {
                                    entity_id: record.entity_id,
                                    type_id: record.type_id,
                                },
                                record,
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "component loader bulk fetch failed");
                        fetch_err = Some(err);
                        break;
                    }
                }
            }

            if fetch_err.is_none() {
                for key in &keys {
                    let cache_key = CacheKey::new(key.entity_id, key.type_id);
                    match found.get(key) {
                        Some(record) if !bypass_cache => cache.put(cache_key, record.clone()),
                        None if !bypass_cache => cache.put_missing(cache_key),
                        _ => {}
                    }
                }
            }

            for (key, senders) in waiters {
                let response: EngineResult<Option<ComponentRecord>> = match &fetch_err {
                    Some(err) => Err(duplicate_for_fanout(err)),
                    None => Ok(found.get(&key).cloned()),
                };
                for sender in senders {
                    let to_send = match &response {
                        Ok(v) => Ok(v.clone()),
                        Err(err) => Err(duplicate_for_fanout(err)),
                    };
                    let _ = sender.send(to_send);
                }
            }
        });
    }
}

/// Conventional foreign-key field names tried, in order, when a
/// [`RelationKey`] does not specify one explicitly (spec §4.E contract #3).
const CONVENTIONAL_FOREIGN_KEYS: &[&str] = &["user_id", "parent_id"];

/// Loader #3 key: one relation lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationKey {
    /// The entity whose related rows are sought.
    pub entity_id: EntityId,
    /// The field name on the owning entity that the relation is named for
    /// (informational; grouping happens on `foreign_key`/`related_type`).
    pub relation_field: String,
    /// The component type expected to hold the foreign key.
    pub related_type: TypeId,
    /// The JSON field on `related_type`'s payload holding the owning
    /// entity's id. `None` falls back to [`CONVENTIONAL_FOREIGN_KEYS`].
    pub foreign_key: Option<String>,
}

/// Loader #3: `relationsByEntityField(...) -> Entity[]`. Returns the ids of
/// entities that own a `related_type` component whose foreign-key field
/// equals the queried entity's id; callers hydrate full entities from these.
pub struct RelationLoader {
    pool: PgPool,
    batch_window: Duration,
    max_batch_size: usize,
    state: Arc<Mutex<PendingState<RelationKey, Vec<EntityId>>>>,
    scheduled: Arc<AtomicBool>,
}

impl RelationLoader {
    /// Builds a loader against `pool`.
    pub fn new(pool: PgPool, batch_window: Duration, max_batch_size: usize) -> Self {
        RelationLoader {
            pool,
            batch_window,
            max_batch_size: max_batch_size.max(1),
            state: Arc::new(Mutex::new(PendingState {
                waiters: HashMap::new(),
            })),
            scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Loads the related entity ids for one key.
    pub async fn load(&self, key: RelationKey) -> EngineResult<Vec<EntityId>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.waiters.entry(key).or_default().push(tx);
        }
        self.schedule_flush();
        rx.await
            .unwrap_or_else(|_| Err(EngineError::Transient("loader batch was dropped".to_string())))
            .map(|found| found.unwrap_or_default())
    }

    fn schedule_flush(&self) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = Arc::clone(&self.state);
        let scheduled = Arc::clone(&self.scheduled);
        let pool = self.pool.clone();
        let batch_window = self.batch_window;
        let max_batch_size = self.max_batch_size;

        tokio::spawn(async move {
            tokio::time::sleep(batch_window).await;

            let waiters = {
                let mut guard = state.lock().await;
                scheduled.store(false, Ordering::SeqCst);
                std::mem::take(&mut guard.waiters)
            };

            if waiters.is_empty() {
                return;
            }

            // Group keys by (related_type, resolved foreign_key) — one bulk
            // SQL statement per distinct shape (spec §4.E contract #3).
            let mut groups: HashMap<(TypeId, String), Vec<RelationKey>> = HashMap::new();
            for key in waiters.keys() {
                let foreign_key = match &key.foreign_key {
                    Some(field) => field.clone(),
                    None => {
                        tracing::warn!(
                            related_type = %key.related_type,
                            "relation loader falling back to conventional foreign-key names"
                        );
                        CONVENTIONAL_FOREIGN_KEYS[0].to_string()
                    }
                };
                groups
                    .entry((key.related_type, foreign_key))
                    .or_default()
                    .push(key.clone());
            }

            let mut results: HashMap<RelationKey, Vec<EntityId>> = HashMap::new();
            let mut fetch_err: Option<EngineError> = None;

            'groups: for ((type_id, foreign_key), group_keys) in groups {
                let entity_ids: Vec<EntityId> = group_keys.iter().map(|k| k.entity_id).collect();

                for chunk_ids in entity_ids.chunks(max_batch_size) {
                    match sql::component::get_by_foreign_key(&pool, type_id, &foreign_key, chunk_ids).await {
                        Ok(rows) => {
                            for key in &group_keys {
                                let owners: Vec<EntityId> = rows
                                    .iter()
                                    .filter(|row| {
                                        row.data.get(&foreign_key).and_then(|v| v.as_str())
                                            == Some(key.entity_id.to_string().as_str())
                                    })
                                    .map(|row| row.entity_id)
                                    .collect();
                                results
                                    .entry(key.clone())
                                    .or_default()
                                    .extend(owners);
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "relation loader bulk fetch failed");
                            fetch_err = Some(err);
                            break 'groups;
                        }
                    }
                }
            }

            for (key, senders) in waiters {
                let response: EngineResult<Option<Vec<EntityId>>> = match &fetch_err {
                    Some(err) => Err(duplicate_for_fanout(err)),
                    None => Ok(Some(results.get(&key).cloned().unwrap_or_default())),
                };
                for sender in senders {
                    let to_send = match &response {
                        Ok(v) => Ok(v.clone()),
                        Err(err) => Err(duplicate_for_fanout(err)),
                    };
                    let _ = sender.send(to_send);
                }
            }
        });
    }
}

/// Per-request bundle of the three loaders, constructed by
/// [`crate::facade::Engine::loaders`].
pub struct LoaderSet {
    /// Loader #1.
    pub entities: EntityLoader,
    /// Loader #2.
    pub components: ComponentLoader,
    /// Loader #3.
    pub relations: RelationLoader,
}
