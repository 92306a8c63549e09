//! # Entity Core (spec §4.F)
//!
//! An `Entity` is an in-memory, single-owner aggregate of typed component
//! payloads keyed by their [`TypeId`]. Payloads are kept as `serde_json::Value`
//! internally and only (de)serialized into a concrete [`Component`] at the
//! call site — mirroring the teacher's preference for a dynamic JSON payload
//! over generated per-type storage, since the component set is open-ended and
//! registered at runtime (§4.A).
//!
//! Entities are not thread-safe (spec §5): one entity, one owner at a time.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;

use crate::component_cache::{CacheKey, ComponentCache, ComponentRecord};
use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::hooks::{HookDispatcher, HookEvent};
use crate::id::{ComponentId, EntityId, TypeId};
use crate::registry::Component;
use crate::sql;

fn type_id_of<T: Component>() -> TypeId {
    TypeId::derive_from_name(T::NAME)
}

/// One component instance attached to an entity.
#[derive(Debug, Clone)]
struct ComponentSlot {
    component_id: ComponentId,
    data: Value,
    persisted: bool,
    dirty: bool,
    /// The payload as it stood the last time this slot was clean, captured
    /// the moment `set()` first dirties an already-persisted slot, so the
    /// save path can report `ComponentUpdated{old, new}` (spec §4.H).
    previous: Option<Value>,
}

/// An in-memory entity: its id plus whichever components have been attached,
/// loaded, or queued for removal. Constructed via [`Entity::new`] (new,
/// unpersisted) or returned by [`Entity::load_multiple`]/[`crate::query`]
/// (persisted, hydrated from storage).
#[derive(Debug, Clone)]
pub struct Entity {
    id: EntityId,
    persisted: bool,
    dirty: bool,
    deleted: bool,
    components: HashMap<TypeId, ComponentSlot>,
    pending_removals: HashSet<TypeId>,
}

impl Entity {
    /// Creates a brand-new, unpersisted entity with a fresh id.
    pub fn new() -> std::io::Result<Self> {
        Ok(Entity {
            id: EntityId::generate()?,
            persisted: false,
            dirty: false,
            deleted: false,
            components: HashMap::new(),
            pending_removals: HashSet::new(),
        })
    }

    /// Rehydrates an entity from a known id with no components attached;
    /// callers typically follow with `load_multiple`/`load_components`, or
    /// (spec §4.G `exec`) leave components unhydrated and let `get()` fetch
    /// them lazily, one at most per `(entity, type)`.
    pub(crate) fn from_persisted(id: EntityId) -> Self {
        Entity {
            id,
            persisted: true,
            dirty: false,
            deleted: false,
            components: HashMap::new(),
            pending_removals: HashSet::new(),
        }
    }

    /// This entity's identifier.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Whether this entity has ever been saved.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Whether this entity has unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether this entity has been deleted (soft or hard) since it was
    /// loaded into memory.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Attaches a new component instance. Returns [`EngineError::Conflict`]
    /// if a live instance of `T` is already attached — callers that want an
    /// idempotent upsert should use [`Entity::set`] instead.
    pub fn add<T: Component>(&mut self, data: T) -> EngineResult<()> {
        let type_id = type_id_of::<T>();
        if self.components.contains_key(&type_id) {
            return Err(EngineError::Conflict(format!(
                "component '{}' is already attached to this entity",
                T::NAME
            )));
        }
        let value = serde_json::to_value(data)?;
        self.components.insert(
            type_id,
            ComponentSlot {
                component_id: ComponentId::generate().map_err(|e| {
                    EngineError::Transient(format!("failed to generate component id: {e}"))
                })?,
                data: value,
                persisted: false,
                dirty: true,
                previous: None,
            },
        );
        self.pending_removals.remove(&type_id);
        self.dirty = true;
        Ok(())
    }

    /// Updates `T`'s payload in place if attached, otherwise attaches it
    /// (spec §4.F `set`).
    pub fn set<T: Component>(&mut self, data: T) -> EngineResult<()> {
        let type_id = type_id_of::<T>();
        let value = serde_json::to_value(data)?;

        if let Some(slot) = self.components.get_mut(&type_id) {
            if !slot.dirty {
                slot.previous = Some(slot.data.clone());
            }
            slot.data = value;
            slot.dirty = true;
            self.dirty = true;
            return Ok(());
        }

        self.components.insert(
            type_id,
            ComponentSlot {
                component_id: ComponentId::generate().map_err(|e| {
                    EngineError::Transient(format!("failed to generate component id: {e}"))
                })?,
                data: value,
                persisted: false,
                dirty: true,
                previous: None,
            },
        );
        self.pending_removals.remove(&type_id);
        self.dirty = true;
        Ok(())
    }

    /// Updates or attaches a component by its [`TypeId`] directly, bypassing
    /// the `T: Component` static-type path. Used by callers that only hold a
    /// component's name at runtime (e.g. an HTTP body naming its type in a
    /// JSON field) rather than a concrete Rust type.
    pub fn set_raw(&mut self, type_id: TypeId, data: Value) -> EngineResult<()> {
        if let Some(slot) = self.components.get_mut(&type_id) {
            if !slot.dirty {
                slot.previous = Some(slot.data.clone());
            }
            slot.data = data;
            slot.dirty = true;
            self.dirty = true;
            return Ok(());
        }

        self.components.insert(
            type_id,
            ComponentSlot {
                component_id: ComponentId::generate().map_err(|e| {
                    EngineError::Transient(format!("failed to generate component id: {e}"))
                })?,
                data,
                persisted: false,
                dirty: true,
                previous: None,
            },
        );
        self.pending_removals.remove(&type_id);
        self.dirty = true;
        Ok(())
    }

    /// Detaches `T`, if attached. A persisted instance is queued for delete
    /// on the next save; an instance that was never saved is simply dropped.
    pub fn remove<T: Component>(&mut self) {
        let type_id = type_id_of::<T>();
        if let Some(slot) = self.components.remove(&type_id) {
            if slot.persisted {
                self.pending_removals.insert(type_id);
                self.dirty = true;
            }
        }
    }

    /// Returns `T`'s payload, fetching it via `ctx`'s loader (preferred) or a
    /// directly-held pool if not already attached in memory. Fetched
    /// components are cached on the entity for subsequent calls.
    pub async fn get<T: Component>(&mut self, ctx: &RequestContext) -> EngineResult<Option<T>> {
        let type_id = type_id_of::<T>();

        if self.pending_removals.contains(&type_id) {
            return Ok(None);
        }
        if let Some(slot) = self.components.get(&type_id) {
            return Ok(Some(serde_json::from_value(slot.data.clone())?));
        }

        let record = if let Some(loaders) = ctx.loaders() {
            loaders
                .components
                .load(crate::loaders::ComponentKey {
                    entity_id: self.id,
                    type_id,
                })
                .await?
        } else if let Some(pool) = ctx.pool() {
            sql::component::get_many(pool, &[self.id], &[type_id])
                .await?
                .into_iter()
                .next()
                .map(ComponentRecord::from)
        } else {
            None
        };

        let Some(record) = record else {
            return Ok(None);
        };

        let value = record.data.clone();
        self.components.insert(
            type_id,
            ComponentSlot {
                component_id: record.id,
                data: value.clone(),
                persisted: true,
                dirty: false,
                previous: None,
            },
        );
        Ok(Some(serde_json::from_value(value)?))
    }

    /// Persists this entity within a transaction, per the save algorithm in
    /// spec §4.F. A no-op (returns `Ok(())` immediately) when the entity is
    /// not dirty. Hook dispatch failures are logged but never fail the save.
    pub async fn save(
        &mut self,
        pool: &PgPool,
        cache: &ComponentCache,
        hooks: &HookDispatcher,
        timeout: Duration,
    ) -> EngineResult<()> {
        if !self.dirty {
            return Ok(());
        }

        tokio::time::timeout(timeout, self.save_inner(pool, cache, hooks))
            .await
            .map_err(|_| EngineError::Timeout)?
    }

    async fn save_inner(
        &mut self,
        pool: &PgPool,
        cache: &ComponentCache,
        hooks: &HookDispatcher,
    ) -> EngineResult<()> {
        let was_new = !self.persisted;

        let removed_type_ids: Vec<TypeId> = self.pending_removals.iter().copied().collect();

        let mut to_insert: Vec<TypeId> = Vec::new();
        let mut to_update: Vec<TypeId> = Vec::new();
        for (type_id, slot) in self.components.iter() {
            if !slot.dirty {
                continue;
            }
            if slot.persisted {
                to_update.push(*type_id);
            } else {
                to_insert.push(*type_id);
            }
        }

        let mut tx = pool.begin().await?;

        if !self.persisted {
            sql::entity::insert_if_absent(&mut *tx, self.id).await?;
        }

        if !removed_type_ids.is_empty() {
            sql::component::delete_many(&mut *tx, self.id, &removed_type_ids).await?;
        }

        if !to_insert.is_empty() {
            let new_components: Vec<sql::component::NewComponent> = to_insert
                .iter()
                .map(|type_id| {
                    let slot = &self.components[type_id];
                    sql::component::NewComponent {
                        component_id: slot.component_id,
                        entity_id: self.id,
                        type_id: *type_id,
                        name: type_id.to_string(),
                        data: slot.data.clone(),
                    }
                })
                .collect();
            sql::component::insert_many(&mut *tx, &new_components).await?;
        }

        for type_id in &to_update {
            let slot = &self.components[type_id];
            sql::component::update(&mut *tx, self.id, *type_id, &slot.data).await?;
        }

        tx.commit().await?;

        self.persisted = true;
        self.dirty = false;
        self.pending_removals.clear();

        let mut updates: Vec<(TypeId, Value, Value)> = Vec::new();
        for type_id in &to_insert {
            let slot = self.components.get_mut(type_id).expect("just inserted");
            slot.persisted = true;
            slot.dirty = false;
            slot.previous = None;
            cache.put(
                CacheKey::new(self.id, *type_id),
                ComponentRecord {
                    id: slot.component_id,
                    entity_id: self.id,
                    type_id: *type_id,
                    data: slot.data.clone(),
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                },
            );
        }
        for type_id in &to_update {
            let slot = self.components.get_mut(type_id).expect("present");
            let old = slot.previous.take().unwrap_or_else(|| slot.data.clone());
            slot.persisted = true;
            slot.dirty = false;
            cache.put(
                CacheKey::new(self.id, *type_id),
                ComponentRecord {
                    id: slot.component_id,
                    entity_id: self.id,
                    type_id: *type_id,
                    data: slot.data.clone(),
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                },
            );
            updates.push((*type_id, old, slot.data.clone()));
        }
        for type_id in &removed_type_ids {
            cache.invalidate(CacheKey::new(self.id, *type_id));
        }

        if was_new {
            hooks
                .dispatch(HookEvent::EntityCreated { entity_id: self.id })
                .await;
        } else {
            let mut changed: Vec<TypeId> = to_insert.clone();
            changed.extend(to_update.iter().copied());
            changed.extend(removed_type_ids.iter().copied());
            hooks
                .dispatch(HookEvent::EntityUpdated {
                    entity_id: self.id,
                    changed_type_ids: changed,
                })
                .await;
        }
        for type_id in &to_insert {
            hooks
                .dispatch(HookEvent::ComponentAdded {
                    entity_id: self.id,
                    type_id: *type_id,
                })
                .await;
        }
        for (type_id, old, new) in updates {
            hooks
                .dispatch(HookEvent::ComponentUpdated {
                    entity_id: self.id,
                    type_id,
                    old,
                    new,
                })
                .await;
        }
        for type_id in &removed_type_ids {
            hooks
                .dispatch(HookEvent::ComponentRemoved {
                    entity_id: self.id,
                    type_id: *type_id,
                })
                .await;
        }

        Ok(())
    }

    /// Deletes this entity and every attached component, soft by default
    /// (`deleted_at` set) or hard (`force = true`, rows removed outright),
    /// all within one transaction (spec §4.F `delete`, §9 open question 3).
    pub async fn delete(
        &mut self,
        pool: &PgPool,
        cache: &ComponentCache,
        hooks: &HookDispatcher,
        force: bool,
    ) -> EngineResult<()> {
        if !self.persisted {
            self.components.clear();
            self.pending_removals.clear();
            self.dirty = false;
            self.deleted = true;
            return Ok(());
        }

        let mut tx = pool.begin().await?;
        if force {
            sql::component::hard_delete_all_for_entity(&mut *tx, self.id).await?;
            sql::entity::hard_delete(&mut *tx, self.id).await?;
        } else {
            sql::component::soft_delete_all_for_entity(&mut *tx, self.id).await?;
            sql::entity::soft_delete(&mut *tx, self.id).await?;
        }
        tx.commit().await?;

        cache.invalidate_entity(self.id);
        self.components.clear();
        self.pending_removals.clear();
        self.dirty = false;
        self.deleted = true;
        if force {
            self.persisted = false;
        }

        hooks
            .dispatch(HookEvent::EntityDeleted {
                entity_id: self.id,
                soft: !force,
            })
            .await;
        Ok(())
    }

    /// Batch-fetches entities and all their live components in one query each
    /// (spec §4.F "Bulk loaders").
    pub async fn load_multiple(pool: &PgPool, ids: &[EntityId]) -> EngineResult<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sql::entity::get_many(pool, ids).await?;
        let component_rows = sql::component::get_all_for_entities(pool, ids).await?;

        let mut by_entity: HashMap<EntityId, Vec<sql::component::ComponentRow>> = HashMap::new();
        for row in component_rows {
            by_entity.entry(row.entity_id).or_default().push(row);
        }

        let entities = rows
            .into_iter()
            .filter(|row| row.deleted_at.is_none())
            .map(|row| {
                let mut entity = Entity::from_persisted(row.id);
                for component_row in by_entity.remove(&row.id).unwrap_or_default() {
                    entity.components.insert(
                        component_row.type_id,
                        ComponentSlot {
                            component_id: component_row.component_id,
                            data: component_row.data,
                            persisted: true,
                            dirty: false,
                            previous: None,
                        },
                    );
                }
                entity
            })
            .collect();

        Ok(entities)
    }

    /// Bulk-loads `type_ids` for every entity in `entities` with one query,
    /// distributing results by `O(1)` map lookup rather than a nested scan
    /// (spec §4.F "Bulk loaders").
    pub async fn load_components(
        pool: &PgPool,
        entities: &mut [Entity],
        type_ids: &[TypeId],
    ) -> EngineResult<()> {
        if entities.is_empty() || type_ids.is_empty() {
            return Ok(());
        }
        let entity_ids: Vec<EntityId> = entities.iter().map(|e| e.id).collect();
        let rows = sql::component::get_many(pool, &entity_ids, type_ids).await?;

        let mut by_entity: HashMap<EntityId, Vec<sql::component::ComponentRow>> = HashMap::new();
        for row in rows {
            by_entity.entry(row.entity_id).or_default().push(row);
        }

        for entity in entities.iter_mut() {
            if let Some(rows) = by_entity.remove(&entity.id) {
                for row in rows {
                    entity.components.insert(
                        row.type_id,
                        ComponentSlot {
                            component_id: row.component_id,
                            data: row.data,
                            persisted: true,
                            dirty: false,
                            previous: None,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Produces a new entity with a new id and newly-IDed copies of every
    /// component, all dirty and unpersisted (spec §4.F `clone`).
    pub fn duplicate(&self) -> std::io::Result<Entity> {
        let mut clone = Entity::new()?;
        for (type_id, slot) in &self.components {
            clone.components.insert(
                *type_id,
                ComponentSlot {
                    component_id: ComponentId::generate()?,
                    data: slot.data.clone(),
                    persisted: false,
                    dirty: true,
                    previous: None,
                },
            );
        }
        clone.dirty = !clone.components.is_empty();
        Ok(clone)
    }

    /// Produces a handle to this same entity that shares its component
    /// payloads, all marked persisted and clean, for assembling an in-memory
    /// aggregate without re-saving already-persisted children (spec §4.F
    /// `makeRef`).
    pub fn make_ref(&self) -> Entity {
        let components = self
            .components
            .iter()
            .map(|(type_id, slot)| {
                (
                    *type_id,
                    ComponentSlot {
                        component_id: slot.component_id,
                        data: slot.data.clone(),
                        persisted: true,
                        dirty: false,
                        previous: None,
                    },
                )
            })
            .collect();
        Entity {
            id: self.id,
            persisted: true,
            dirty: false,
            deleted: false,
            components,
            pending_removals: HashSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PropertyKind, PropertySchema, PropertyDescriptor};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Profile {
        name: String,
    }

    impl Component for Profile {
        const NAME: &'static str = "Profile";

        fn property_schema() -> PropertySchema {
            PropertySchema {
                fields: vec![PropertyDescriptor {
                    name: "name".to_string(),
                    kind: PropertyKind::String,
                    indexed: true,
                }],
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Settings {
        enabled: bool,
    }

    impl Component for Settings {
        const NAME: &'static str = "Settings";

        fn property_schema() -> PropertySchema {
            PropertySchema { fields: Vec::new() }
        }
    }

    #[test]
    fn new_entity_is_not_dirty() {
        let entity = Entity::new().unwrap();
        assert!(!entity.is_dirty());
        assert!(!entity.is_persisted());
    }

    #[test]
    fn add_then_add_again_is_a_conflict() {
        let mut entity = Entity::new().unwrap();
        entity.add(Profile { name: "Ada".to_string() }).unwrap();
        let result = entity.add(Profile { name: "Grace".to_string() });
        assert!(matches!(result, Err(EngineError::Conflict(_))));
    }

    #[test]
    fn set_on_unattached_component_behaves_like_add() {
        let mut entity = Entity::new().unwrap();
        entity.set(Profile { name: "Ada".to_string() }).unwrap();
        assert!(entity.is_dirty());
        assert!(entity.components.contains_key(&type_id_of::<Profile>()));
    }

    #[test]
    fn set_raw_attaches_a_component_by_type_id() {
        let mut entity = Entity::new().unwrap();
        let type_id = TypeId::derive_from_name("Profile");
        entity
            .set_raw(type_id, serde_json::json!({ "name": "Ada" }))
            .unwrap();
        assert!(entity.is_dirty());
        assert!(entity.components.contains_key(&type_id));
    }

    #[test]
    fn remove_of_unpersisted_component_clears_state_without_pending_removal() {
        let mut entity = Entity::new().unwrap();
        entity.add(Profile { name: "Ada".to_string() }).unwrap();
        entity.remove::<Profile>();
        assert!(entity.pending_removals.is_empty());
        assert!(!entity.components.contains_key(&type_id_of::<Profile>()));
    }

    #[tokio::test]
    async fn get_returns_in_memory_component_without_a_context() {
        let mut entity = Entity::new().unwrap();
        entity.add(Profile { name: "Ada".to_string() }).unwrap();

        let ctx = RequestContext::direct();
        let profile: Option<Profile> = entity.get(&ctx).await.unwrap();
        assert_eq!(profile, Some(Profile { name: "Ada".to_string() }));
    }

    #[tokio::test]
    async fn get_returns_none_for_unattached_component_with_no_db() {
        let mut entity = Entity::new().unwrap();
        let ctx = RequestContext::direct();
        let settings: Option<Settings> = entity.get(&ctx).await.unwrap();
        assert_eq!(settings, None);
    }

    #[tokio::test]
    async fn save_round_trips_components_through_postgres() {
        let pool = crate::sql::tests::setup_test_db().await;
        let cache = ComponentCache::in_memory(Duration::from_secs(30));
        let hooks = HookDispatcher::new();

        let mut entity = Entity::new().unwrap();
        entity.add(Profile { name: "Ada".to_string() }).unwrap();
        entity.save(&pool, &cache, &hooks, Duration::from_secs(5)).await.unwrap();
        assert!(entity.is_persisted());
        assert!(!entity.is_dirty());

        let mut reloaded = Entity::load_multiple(&pool, &[entity.id()]).await.unwrap();
        assert_eq!(reloaded.len(), 1);
        let ctx = RequestContext::direct();
        let profile: Option<Profile> = reloaded[0].get(&ctx).await.unwrap();
        assert_eq!(profile, Some(Profile { name: "Ada".to_string() }));
    }

    #[tokio::test]
    async fn save_is_a_no_op_when_not_dirty() {
        let pool = crate::sql::tests::setup_test_db().await;
        let cache = ComponentCache::in_memory(Duration::from_secs(30));
        let hooks = HookDispatcher::new();

        let mut entity = Entity::new().unwrap();
        entity.save(&pool, &cache, &hooks, Duration::from_secs(5)).await.unwrap();
        assert!(!entity.is_persisted());
    }

    #[tokio::test]
    async fn remove_then_save_deletes_persisted_component() {
        let pool = crate::sql::tests::setup_test_db().await;
        let cache = ComponentCache::in_memory(Duration::from_secs(30));
        let hooks = HookDispatcher::new();

        let mut entity = Entity::new().unwrap();
        entity.add(Profile { name: "Ada".to_string() }).unwrap();
        entity.save(&pool, &cache, &hooks, Duration::from_secs(5)).await.unwrap();

        entity.remove::<Profile>();
        entity.save(&pool, &cache, &hooks, Duration::from_secs(5)).await.unwrap();

        let mut reloaded = Entity::load_multiple(&pool, &[entity.id()]).await.unwrap();
        let ctx = RequestContext::direct();
        let profile: Option<Profile> = reloaded[0].get(&ctx).await.unwrap();
        assert_eq!(profile, None);
    }

    #[tokio::test]
    async fn delete_soft_keeps_row_but_clears_components() {
        let pool = crate::sql::tests::setup_test_db().await;
        let cache = ComponentCache::in_memory(Duration::from_secs(30));
        let hooks = HookDispatcher::new();

        let mut entity = Entity::new().unwrap();
        entity.add(Profile { name: "Ada".to_string() }).unwrap();
        entity.save(&pool, &cache, &hooks, Duration::from_secs(5)).await.unwrap();

        entity.delete(&pool, &cache, &hooks, false).await.unwrap();
        assert!(entity.is_deleted());

        let reloaded = Entity::load_multiple(&pool, &[entity.id()]).await.unwrap();
        assert!(reloaded.is_empty(), "soft-deleted entities are excluded from load_multiple");
    }

    #[test]
    fn duplicate_produces_new_id_and_dirty_unpersisted_components() {
        let mut original = Entity::new().unwrap();
        original.add(Profile { name: "Ada".to_string() }).unwrap();

        let clone = original.duplicate().unwrap();
        assert_ne!(clone.id(), original.id());
        assert!(clone.is_dirty());
        assert!(!clone.is_persisted());
    }

    #[test]
    fn make_ref_shares_data_but_is_marked_clean() {
        let mut original = Entity::new().unwrap();
        original.add(Profile { name: "Ada".to_string() }).unwrap();

        let reference = original.make_ref();
        assert_eq!(reference.id(), original.id());
        assert!(!reference.is_dirty());
        assert!(reference.is_persisted());
    }
}
